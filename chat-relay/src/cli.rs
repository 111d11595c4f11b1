use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    ServerConfig, DEFAULT_MAX_CLIENTS, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_RELAY_CAPACITY,
    DEFAULT_WRITE_TIMEOUT_MS,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay, accepting TCP connections.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Maximum number of concurrent clients; extra connections are refused.
    #[arg(long, env = "CHAT_RELAY_MAX_CLIENTS", default_value_t = DEFAULT_MAX_CLIENTS)]
    pub max_clients: usize,

    /// Bytes each worker may queue for the dispatcher before it blocks.
    #[arg(long, env = "CHAT_RELAY_RELAY_CAPACITY", default_value_t = DEFAULT_RELAY_CAPACITY)]
    pub relay_capacity: usize,

    /// Lines queued for each client; a client that falls further behind
    /// misses lines.
    #[arg(
        long,
        env = "CHAT_RELAY_OUTBOUND_CAPACITY",
        default_value_t = DEFAULT_OUTBOUND_CAPACITY
    )]
    pub outbound_capacity: usize,

    /// Time a closing connection gets to receive its last lines, in milliseconds.
    #[arg(
        long,
        env = "CHAT_RELAY_WRITE_TIMEOUT_MS",
        default_value_t = DEFAULT_WRITE_TIMEOUT_MS
    )]
    pub write_timeout_ms: u64,
}

impl ServeArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_clients: self.max_clients,
            relay_capacity: self.relay_capacity,
            outbound_capacity: self.outbound_capacity,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub server: SocketAddr,
}
