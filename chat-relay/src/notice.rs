use std::fmt;

use bytes::Bytes;

/// Every line the relay writes to a client.
///
/// The wire format is plain newline-terminated text so `nc` and `telnet` work
/// as clients. [`Notice::to_line`] renders the exact bytes to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice<'a> {
    /// First line queued on every connection, before it is given a slot.
    Welcome,
    /// Sent to a newly accepted connection once it owns a slot.
    Greeting { nickname: &'a str, active: usize },
    Joined { nickname: &'a str, active: usize },
    Left { nickname: &'a str, active: usize },
    Renamed { old: &'a str, new: &'a str },
    /// `/who` reply; one entry per active slot in slot order.
    Roster { active: usize, nicknames: Vec<&'a str> },
    NickUsage,
    Goodbye,
    ServerFull,
    ShuttingDown,
    Chat { nickname: &'a str, text: &'a str },
}

impl Notice<'_> {
    pub fn to_line(&self) -> String {
        let mut line = self.to_string();
        line.push('\n');
        line
    }

    /// The rendered line as shared bytes, cloned cheaply per recipient.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_line())
    }
}

impl fmt::Display for Notice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Welcome => {
                write!(f, "Welcome! Commands: /nick <name>, /who, /quit (or 'exit').")
            }
            Notice::Greeting { nickname, active } => {
                write!(f, "You are {nickname}. Active: {active}")
            }
            Notice::Joined { nickname, active } => write!(f, "{nickname} joined. Active: {active}"),
            Notice::Left { nickname, active } => write!(f, "{nickname} left. Active: {active}"),
            Notice::Renamed { old, new } => write!(f, "{old} is now known as {new}"),
            Notice::Roster { active, nicknames } => {
                write!(f, "Users ({active}):")?;
                for nickname in nicknames {
                    write!(f, "\n - {nickname}")?;
                }
                Ok(())
            }
            Notice::NickUsage => write!(f, "Usage: /nick <name>"),
            Notice::Goodbye => write!(f, "Goodbye."),
            Notice::ServerFull => write!(f, "Server full. Try later."),
            Notice::ShuttingDown => write!(f, "*** Server shutting down ***"),
            Notice::Chat { nickname, text } => write!(f, "{nickname}: {text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_renders_one_line_per_user() {
        let roster = Notice::Roster {
            active: 2,
            nicknames: vec!["Alice", "user1"],
        };
        assert_eq!(roster.to_line(), "Users (2):\n - Alice\n - user1\n");
    }

    #[test]
    fn chat_line_is_prefixed_with_nickname() {
        let chat = Notice::Chat {
            nickname: "user0",
            text: "hello",
        };
        assert_eq!(chat.to_line(), "user0: hello\n");
    }
}
