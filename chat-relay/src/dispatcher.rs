//! The dispatcher: one task that owns the listener and the connection table.
//!
//! Every iteration waits for whichever happens first: shutdown, a new
//! connection, or a relay pipe becoming readable. Handling runs to completion
//! before the next wait, so the table is only ever touched from here and
//! needs no locking.

use std::{
    future::{poll_fn, Future},
    io,
    net::SocketAddr,
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select, time,
};
use tracing::{debug, info, warn};

use crate::{
    command::ChatCommand,
    config::{ConfigError, ServerConfig},
    notice::Notice,
    relay::{Decoded, Frame, RelayRead, SlotId},
    table::{default_nickname, ConnectionTable, Slot},
    worker,
};

pub struct Dispatcher {
    listener: TcpListener,
    state: DispatcherState,
}

impl Dispatcher {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            listener,
            state: DispatcherState::new(config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Dispatcher {
            listener,
            mut state,
        } = self;
        tokio::pin!(shutdown);

        while state.phase == Phase::Running {
            let event = select! {
                biased;
                _ = &mut shutdown => Event::Shutdown,
                accepted = listener.accept() => Event::Accepted(accepted),
                (slot, read) = poll_fn(|cx| state.table.poll_relay(cx)) => Event::Relay(slot, read),
            };

            match event {
                Event::Shutdown => state.shutdown().await,
                Event::Accepted(Ok((stream, peer))) => state.handle_accept(stream, peer),
                Event::Accepted(Err(err)) => warn!(error = ?err, "failed to accept connection"),
                Event::Relay(slot, read) => state.handle_relay(slot, read),
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

enum Event {
    Shutdown,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Relay(SlotId, RelayRead),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    ShuttingDown,
}

struct DispatcherState {
    table: ConnectionTable,
    config: ServerConfig,
    phase: Phase,
}

impl DispatcherState {
    fn new(config: ServerConfig) -> Self {
        Self {
            table: ConnectionTable::with_capacity(config.max_clients),
            config,
            phase: Phase::Running,
        }
    }

    fn handle_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let Some(id) = self.table.first_free() else {
            info!(%peer, active = self.table.active_count(), "server full; refusing connection");
            tokio::spawn(refuse(stream, peer, self.config.write_timeout));
            return;
        };

        let (outbound, relay, handle) = worker::spawn(stream, id, &self.config);
        let nickname = default_nickname(id);
        let slot = Slot::new(outbound, relay, handle, nickname.clone(), Some(peer));
        if let Err(slot) = self.table.insert(id, slot) {
            warn!(slot = id, %peer, "slot already occupied; dropping connection");
            slot.close(self.config.write_timeout);
            return;
        }

        let active = self.table.active_count();
        info!(slot = id, %peer, %nickname, active, "client joined");

        let joined = Notice::Joined {
            nickname: &nickname,
            active,
        };
        self.broadcast(joined.to_bytes(), Some(id));

        let greeting = Notice::Greeting {
            nickname: &nickname,
            active,
        };
        self.send_to(id, greeting.to_bytes());
    }

    fn handle_relay(&mut self, id: SlotId, read: RelayRead) {
        match read {
            RelayRead::Frames(items) => {
                for item in items {
                    match item {
                        Decoded::Frame(frame) => self.handle_frame(id, frame),
                        Decoded::Malformed(err) => {
                            warn!(slot = id, error = %err, "dropping malformed relay frame");
                        }
                    }
                }
            }
            RelayRead::Closed { truncated } => {
                if truncated > 0 {
                    warn!(slot = id, truncated, "relay closed mid-frame; partial frame dropped");
                }
                self.disconnect(id);
            }
            RelayRead::Failed(err) => {
                warn!(slot = id, error = ?err, "relay pipe failed");
                self.disconnect(id);
            }
        }
    }

    fn handle_frame(&mut self, id: SlotId, frame: Frame) {
        if frame.sender_slot() != id {
            warn!(
                slot = id,
                claimed = frame.sender_slot(),
                "dropping frame attributed to another slot"
            );
            return;
        }

        let text = frame.text();
        match ChatCommand::parse(&text) {
            Some(ChatCommand::Nick(name)) => self.rename(id, name),
            Some(ChatCommand::Who) => self.list_users(id),
            Some(ChatCommand::Quit) => {
                // Teardown follows from the worker's end-of-stream.
                self.send_to(id, Notice::Goodbye.to_bytes());
            }
            None => self.chat(id, &text),
        }
    }

    fn chat(&self, id: SlotId, text: &str) {
        let Some(slot) = self.table.get(id) else {
            return;
        };
        let line = Notice::Chat {
            nickname: slot.nickname(),
            text,
        }
        .to_bytes();
        self.broadcast(line, Some(id));
    }

    fn rename(&mut self, id: SlotId, name: &str) {
        if name.is_empty() {
            self.send_to(id, Notice::NickUsage.to_bytes());
            return;
        }
        let Some(slot) = self.table.get_mut(id) else {
            return;
        };
        let old = slot.rename(name);
        let line = Notice::Renamed {
            old: &old,
            new: slot.nickname(),
        }
        .to_bytes();
        info!(slot = id, %old, new = slot.nickname(), "client renamed");
        self.broadcast(line, None);
    }

    fn list_users(&self, id: SlotId) {
        let line = Notice::Roster {
            active: self.table.active_count(),
            nicknames: self.table.iter().map(|(_, slot)| slot.nickname()).collect(),
        }
        .to_bytes();
        self.send_to(id, line);
    }

    fn disconnect(&mut self, id: SlotId) {
        let Some(slot) = self.table.remove(id) else {
            return;
        };
        let active = self.table.active_count();
        info!(slot = id, peer = ?slot.peer(), nickname = slot.nickname(), active, "client left");

        let line = Notice::Left {
            nickname: slot.nickname(),
            active,
        }
        .to_bytes();
        slot.close(self.config.write_timeout);
        self.broadcast(line, None);
    }

    /// Queues the shutdown notice everywhere, then waits for every connection
    /// to flush and close. Each close gives up after `write_timeout`.
    async fn shutdown(&mut self) {
        info!(active = self.table.active_count(), "dispatcher shutting down");
        self.phase = Phase::ShuttingDown;

        let line = Notice::ShuttingDown.to_bytes();
        let mut closing = Vec::with_capacity(self.table.active_count());
        for (id, slot) in self.table.drain() {
            if let Err(reason) = slot.send(line.clone()) {
                debug!(slot = id, %reason, "shutdown notice not queued");
            }
            closing.push(slot.close(self.config.write_timeout));
        }
        for handle in closing {
            if let Err(err) = handle.await {
                debug!(error = ?err, "connection close task failed");
            }
        }
    }

    fn send_to(&self, id: SlotId, line: Bytes) {
        if let Some(slot) = self.table.get(id) {
            if let Err(reason) = slot.send(line) {
                debug!(slot = id, %reason, "dropped reply to client");
            }
        }
    }

    /// Queues `line` for every active slot except `skip`. Never waits; a
    /// client whose queue is full misses this line.
    fn broadcast(&self, line: Bytes, skip: Option<SlotId>) {
        for (id, slot) in self.table.iter() {
            if Some(id) == skip {
                continue;
            }
            if let Err(reason) = slot.send(line.clone()) {
                debug!(slot = id, %reason, "dropped broadcast to client");
            }
        }
    }
}

/// Tells a connection there is no free slot and closes it.
async fn refuse(mut stream: TcpStream, peer: SocketAddr, timeout: Duration) {
    let line = Notice::ServerFull.to_line();
    match time::timeout(timeout, stream.write_all(line.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(%peer, error = ?err, "failed to send server-full notice"),
        Err(_) => debug!(%peer, "server-full notice timed out"),
    }
    if let Err(err) = stream.shutdown().await {
        debug!(%peer, error = ?err, "failed to close refused connection");
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::*;
    use crate::{
        outbound,
        relay::RelayReader,
        test_support::{idle_slot, read_line, tcp_pair, READ_TIMEOUT},
    };

    async fn pump(state: &mut DispatcherState) {
        let (slot, read) = time::timeout(READ_TIMEOUT, poll_fn(|cx| state.table.poll_relay(cx)))
            .await
            .expect("relay event");
        state.handle_relay(slot, read);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_sender_stays_connected() {
        let mut state = DispatcherState::new(ServerConfig::default());

        let (sender_server, _sender_client) = tcp_pair().await;
        let (_reader, sender_writer) = sender_server.into_split();
        let (mut raw, relay_end) = tokio::io::duplex(8192);
        let worker = tokio::spawn(async {});
        let sender = Slot::new(
            outbound::spawn(sender_writer, 0, 4),
            RelayReader::from_stream(relay_end),
            worker,
            default_nickname(0),
            None,
        );
        assert!(state.table.insert(0, sender).is_ok());

        let (recipient_server, recipient_client) = tcp_pair().await;
        assert!(state.table.insert(1, idle_slot(recipient_server, 1)).is_ok());
        let (recipient_reader, _recipient_writer) = recipient_client.into_split();
        let mut recipient = BufReader::new(recipient_reader);

        let mut bytes = BytesMut::new();
        // Zero-length frame, then an oversized one with its body, then a
        // frame claiming another slot, then a good frame.
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&2000i32.to_be_bytes());
        bytes.extend_from_slice(&[b'x'; 2000]);
        Frame::new(1, "spoofed").expect("frame").encode(&mut bytes);
        Frame::new(0, "hi").expect("frame").encode(&mut bytes);
        raw.write_all(&bytes).await.expect("write relay");

        pump(&mut state).await;

        assert_eq!(read_line(&mut recipient).await.as_deref(), Some("user0: hi"));
        assert!(state.table.get(0).is_some());
        assert_eq!(state.table.active_count(), 2);
    }

    #[tokio::test]
    async fn end_of_stream_frees_slot_and_notifies_others() {
        let mut state = DispatcherState::new(ServerConfig::default());

        let (leaver_server, _leaver_client) = tcp_pair().await;
        let (_reader, writer) = leaver_server.into_split();
        let (raw, relay_end) = tokio::io::duplex(64);
        let worker = tokio::spawn(async {});
        let leaver = Slot::new(
            outbound::spawn(writer, 0, 4),
            RelayReader::from_stream(relay_end),
            worker,
            default_nickname(0),
            None,
        );
        assert!(state.table.insert(0, leaver).is_ok());

        let (stayer_server, stayer_client) = tcp_pair().await;
        assert!(state.table.insert(1, idle_slot(stayer_server, 1)).is_ok());
        let (stayer_reader, _stayer_writer) = stayer_client.into_split();
        let mut stayer = BufReader::new(stayer_reader);

        drop(raw);
        pump(&mut state).await;

        assert_eq!(
            read_line(&mut stayer).await.as_deref(),
            Some("user0 left. Active: 1")
        );
        assert_eq!(state.table.first_free(), Some(0));
        assert_eq!(state.table.active_count(), 1);
    }

    #[tokio::test]
    async fn empty_nick_gets_usage_reply_only() {
        let mut state = DispatcherState::new(ServerConfig::default());

        let (server_a, client_a) = tcp_pair().await;
        assert!(state.table.insert(0, idle_slot(server_a, 0)).is_ok());
        let (server_b, client_b) = tcp_pair().await;
        assert!(state.table.insert(1, idle_slot(server_b, 1)).is_ok());

        state.handle_frame(0, Frame::new(0, "/nick   ").expect("frame"));
        state.handle_frame(0, Frame::new(0, "still here").expect("frame"));

        let (reader_a, _wa) = client_a.into_split();
        let (reader_b, _wb) = client_b.into_split();
        let mut a = BufReader::new(reader_a);
        let mut b = BufReader::new(reader_b);

        assert_eq!(read_line(&mut a).await.as_deref(), Some("Usage: /nick <name>"));
        assert_eq!(
            read_line(&mut b).await.as_deref(),
            Some("user0: still here")
        );
        assert_eq!(state.table.get(0).map(Slot::nickname), Some("user0"));
    }

    #[tokio::test]
    async fn full_recipient_queue_drops_only_that_recipients_copy() {
        let mut state = DispatcherState::new(ServerConfig::default());

        let (sender_server, _sender_client) = tcp_pair().await;
        assert!(state.table.insert(0, idle_slot(sender_server, 0)).is_ok());
        let (healthy_server, healthy_client) = tcp_pair().await;
        assert!(state.table.insert(2, idle_slot(healthy_server, 2)).is_ok());

        let (stuck_server, stuck_client) = tcp_pair().await;
        let (_stuck_reader, stuck_writer) = stuck_server.into_split();
        // Nothing yields from here until the chat is handled, so this one-line
        // queue still holds its backlog when the broadcast runs.
        let stuck_outbound = outbound::spawn(stuck_writer, 1, 1);
        assert!(stuck_outbound
            .try_send(Bytes::from_static(b"backlog\n"))
            .is_ok());
        let (_relay_tx, relay_rx) = crate::relay::channel(1, 4096);
        let stuck = Slot::new(
            stuck_outbound,
            relay_rx,
            tokio::spawn(async {}),
            default_nickname(1),
            None,
        );
        assert!(state.table.insert(1, stuck).is_ok());

        state.handle_frame(0, Frame::new(0, "hello").expect("frame"));

        let (healthy_reader, _hw) = healthy_client.into_split();
        let mut healthy = BufReader::new(healthy_reader);
        assert_eq!(read_line(&mut healthy).await.as_deref(), Some("user0: hello"));
        assert_eq!(state.table.active_count(), 3);

        let stuck = state.table.remove(1).expect("stuck slot");
        stuck.close(READ_TIMEOUT).await.expect("close");
        let (stuck_reader, _sw) = stuck_client.into_split();
        let mut stuck = BufReader::new(stuck_reader);
        assert_eq!(read_line(&mut stuck).await.as_deref(), Some("backlog"));
        assert_eq!(read_line(&mut stuck).await, None);
    }
}
