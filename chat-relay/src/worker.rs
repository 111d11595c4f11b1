//! Per-connection worker.
//!
//! A worker owns the read half of exactly one client connection and the
//! write end of that connection's relay pipe. It never touches another
//! connection or the dispatcher's table. However it stops (EOF, read error,
//! quit, or a panic) its relay writer is dropped, which the dispatcher sees
//! as a single end-of-stream.

use std::io;

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader},
    net::TcpStream,
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    command::is_quit,
    config::ServerConfig,
    notice::Notice,
    outbound::{self, Outbound},
    relay::{self, RelayReader, RelayWriter, SlotId, MAX_PAYLOAD},
};

/// Why a worker stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    EndOfStream,
    Quit,
}

/// Splits the connection, queues the welcome banner, and starts the worker
/// for `slot`.
///
/// Returns the connection's outbound queue, the dispatcher's end of the
/// relay pipe, and the worker's task handle. The banner is queued before the
/// caller can queue anything, so it is always the first line the client sees.
pub fn spawn(
    stream: TcpStream,
    slot: SlotId,
    config: &ServerConfig,
) -> (Outbound, RelayReader, JoinHandle<()>) {
    let (reader, writer) = stream.into_split();
    let outbound = outbound::spawn(writer, slot, config.outbound_capacity);
    if let Err(reason) = outbound.try_send(Notice::Welcome.to_bytes()) {
        debug!(slot, %reason, "welcome banner not queued");
    }

    let (relay_tx, relay_rx) = relay::channel(slot, config.relay_capacity);
    let handle = tokio::spawn(run(BufReader::new(reader), relay_tx));

    (outbound, relay_rx, handle)
}

async fn run<R>(mut reader: R, mut relay: RelayWriter)
where
    R: AsyncBufRead + Unpin,
{
    let slot = relay.slot();
    match forward_lines(&mut reader, &mut relay).await {
        Ok(exit) => debug!(slot, ?exit, "worker finished"),
        Err(error) => debug!(slot, ?error, "worker stopped on error"),
    }
}

/// Relays every non-empty line from `reader` until EOF or a quit line.
///
/// Lines longer than one frame are split across consecutive frames.
pub async fn forward_lines<R>(reader: &mut R, relay: &mut RelayWriter) -> io::Result<WorkerExit>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(MAX_PAYLOAD);
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_PAYLOAD as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if bytes == 0 {
            return Ok(WorkerExit::EndOfStream);
        }

        let trimmed = trim_line_ending(&line);
        if trimmed.is_empty() {
            continue;
        }

        relay.send(trimmed).await?;
        if is_quit(trimmed) {
            return Ok(WorkerExit::Quit);
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}
