//! Broadcast chat relay.
//!
//! A single dispatcher task accepts TCP connections and fans each line a
//! client sends out to every other connected client. Each connection is read
//! by its own worker task, which forwards lines to the dispatcher as
//! length-prefixed frames over a private in-memory pipe. Workers share no
//! state with the dispatcher, so a misbehaving or crashed worker can only
//! produce a dropped frame or an end-of-stream.
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`config`] holds the dispatcher's runtime limits.
//! - [`relay`] defines frames and the worker-to-dispatcher pipe.
//! - [`worker`] reads one connection and relays its lines.
//! - [`outbound`] queues lines for one connection without blocking.
//! - [`table`] is the bounded slot table the dispatcher owns.
//! - [`command`] recognizes `/nick`, `/who`, `/quit` and `exit`.
//! - [`notice`] renders every line the server sends.
//! - [`dispatcher`] is the event loop tying it all together.
//! - [`client`] is a small terminal client.

pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod notice;
pub mod outbound;
pub mod relay;
pub mod table;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
