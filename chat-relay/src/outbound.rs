//! Per-connection outbound queue.
//!
//! The dispatcher never awaits a client socket. Every connection has a writer
//! task draining a bounded queue of rendered lines. When a queue is full the
//! line is dropped for that connection alone, so a client that stops reading
//! only loses its own output.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time,
};
use tracing::debug;

use crate::relay::SlotId;

/// Why a line was not queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Dropped {
    #[error("outbound queue is full")]
    Full,
    #[error("connection writer has stopped")]
    Closed,
}

/// Sending side of one connection's outbound queue.
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
    writer: JoinHandle<()>,
}

/// Starts the writer task for `slot`, queueing at most `capacity` lines.
///
/// `capacity` must be non-zero; [`crate::config::ServerConfig::validate`]
/// guarantees it for the dispatcher.
pub fn spawn(writer: OwnedWriteHalf, slot: SlotId, capacity: usize) -> Outbound {
    let (tx, rx) = mpsc::channel(capacity);
    let writer = tokio::spawn(drain(writer, rx, slot));
    Outbound { tx, writer }
}

impl Outbound {
    /// Queues one whole line without waiting.
    pub fn try_send(&self, line: Bytes) -> Result<(), Dropped> {
        self.tx.try_send(line).map_err(|err| match err {
            TrySendError::Full(_) => Dropped::Full,
            TrySendError::Closed(_) => Dropped::Closed,
        })
    }

    /// Stops accepting lines and lets the writer flush what is queued.
    ///
    /// The returned task finishes once the writer has closed the connection,
    /// or after `grace` if the peer is not reading, in which case the writer
    /// is aborted.
    pub fn close(self, grace: Duration) -> JoinHandle<()> {
        let Outbound { tx, mut writer } = self;
        drop(tx);
        tokio::spawn(async move {
            if time::timeout(grace, &mut writer).await.is_err() {
                writer.abort();
            }
        })
    }
}

async fn drain(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, slot: SlotId) {
    while let Some(line) = rx.recv().await {
        if let Err(error) = writer.write_all(&line).await {
            debug!(slot, ?error, "client write failed; discarding its output");
            return;
        }
    }
    if let Err(error) = writer.shutdown().await {
        debug!(slot, ?error, "failed to shut down client writer");
    }
}
