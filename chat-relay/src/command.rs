//! In-band chat commands.
//!
//! A relayed line is either one of these commands or plain chat. Commands are
//! case-sensitive and must start the line; anything that does not match
//! exactly is broadcast as chat, including near misses like `/WHO` or
//! `/nickname`.

/// Commands the dispatcher handles instead of broadcasting.
#[derive(Debug, PartialEq, Eq)]
pub enum ChatCommand<'a> {
    /// `/nick <name>`; the name is trimmed and may be empty.
    Nick(&'a str),
    /// `/who`
    Who,
    /// `/quit` or `exit`
    Quit,
}

impl<'a> ChatCommand<'a> {
    /// Returns `None` for chat lines.
    pub fn parse(line: &'a str) -> Option<Self> {
        match line {
            "/who" => return Some(ChatCommand::Who),
            "/quit" | "exit" => return Some(ChatCommand::Quit),
            "/nick" => return Some(ChatCommand::Nick("")),
            _ => {}
        }

        line.strip_prefix("/nick ")
            .map(|name| ChatCommand::Nick(name.trim()))
    }
}

/// True for the lines that end a worker's session.
pub fn is_quit(line: &[u8]) -> bool {
    line == b"/quit" || line == b"exit"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_commands() {
        assert_eq!(ChatCommand::parse("/who"), Some(ChatCommand::Who));
        assert_eq!(ChatCommand::parse("/quit"), Some(ChatCommand::Quit));
        assert_eq!(ChatCommand::parse("exit"), Some(ChatCommand::Quit));
    }

    #[test]
    fn test_nick_trims_name() {
        assert_eq!(
            ChatCommand::parse("/nick Alice"),
            Some(ChatCommand::Nick("Alice"))
        );
        assert_eq!(
            ChatCommand::parse("/nick   Bob  "),
            Some(ChatCommand::Nick("Bob"))
        );
        assert_eq!(
            ChatCommand::parse("/nick two words"),
            Some(ChatCommand::Nick("two words"))
        );
    }

    #[test]
    fn test_nick_without_name() {
        assert_eq!(ChatCommand::parse("/nick"), Some(ChatCommand::Nick("")));
        assert_eq!(ChatCommand::parse("/nick    "), Some(ChatCommand::Nick("")));
    }

    #[test]
    fn test_chat_lines() {
        assert_eq!(ChatCommand::parse("hello"), None);
        assert_eq!(ChatCommand::parse("/WHO"), None);
        assert_eq!(ChatCommand::parse("/who am i"), None);
        assert_eq!(ChatCommand::parse("/nickname x"), None);
        assert_eq!(ChatCommand::parse("EXIT"), None);
        assert_eq!(ChatCommand::parse(" /quit"), None);
        assert_eq!(ChatCommand::parse("exit now"), None);
    }

    #[test]
    fn test_is_quit() {
        assert!(is_quit(b"exit"));
        assert!(is_quit(b"/quit"));
        assert!(!is_quit(b"/quit!"));
        assert!(!is_quit(b""));
    }
}
