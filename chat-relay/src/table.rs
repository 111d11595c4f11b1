//! Fixed-capacity table of live connections, owned by the dispatcher.

use std::{
    net::SocketAddr,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::{
    outbound::{Dropped, Outbound},
    relay::{RelayRead, RelayReader, SlotId},
};

/// Longest nickname in bytes; longer names are cut on a char boundary.
pub const MAX_NICKNAME: usize = 31;

pub fn default_nickname(slot: SlotId) -> String {
    format!("user{slot}")
}

pub fn truncate_nickname(name: &str) -> &str {
    if name.len() <= MAX_NICKNAME {
        return name;
    }
    let mut end = MAX_NICKNAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// One live connection.
pub struct Slot {
    outbound: Outbound,
    relay: RelayReader,
    worker: JoinHandle<()>,
    nickname: String,
    peer: Option<SocketAddr>,
}

impl Slot {
    pub fn new(
        outbound: Outbound,
        relay: RelayReader,
        worker: JoinHandle<()>,
        nickname: String,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            outbound,
            relay,
            worker,
            nickname,
            peer,
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Replaces the nickname and returns the previous one.
    pub fn rename(&mut self, nickname: &str) -> String {
        std::mem::replace(&mut self.nickname, truncate_nickname(nickname).to_string())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queues one rendered line for this connection without waiting.
    pub fn send(&self, line: Bytes) -> Result<(), Dropped> {
        self.outbound.try_send(line)
    }

    /// Stops the worker and closes the connection once queued lines are
    /// flushed or `grace` runs out.
    pub fn close(self, grace: Duration) -> JoinHandle<()> {
        self.worker.abort();
        self.outbound.close(grace)
    }
}

/// Slots indexed by [`SlotId`]; `None` marks a free slot.
pub struct ConnectionTable {
    slots: Vec<Option<Slot>>,
    active: usize,
    next_poll: usize,
}

impl ConnectionTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            active: 0,
            next_poll: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Lowest free index, if any.
    pub fn first_free(&self) -> Option<SlotId> {
        self.slots.iter().position(Option::is_none)
    }

    /// Occupies `id`. Hands the slot back if the index is taken or out of range.
    pub fn insert(&mut self, id: SlotId, slot: Slot) -> Result<(), Slot> {
        let Some(entry) = self.slots.get_mut(id) else {
            return Err(slot);
        };
        if entry.is_some() {
            return Err(slot);
        }
        *entry = Some(slot);
        self.active += 1;
        Ok(())
    }

    pub fn remove(&mut self, id: SlotId) -> Option<Slot> {
        let slot = self.slots.get_mut(id)?.take()?;
        self.active -= 1;
        Some(slot)
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id)?.as_ref()
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// Active slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|slot| (id, slot)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotId, &mut Slot)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_mut().map(|slot| (id, slot)))
    }

    /// Empties the table, yielding every active slot.
    pub fn drain(&mut self) -> Vec<(SlotId, Slot)> {
        self.active = 0;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| slot.take().map(|slot| (id, slot)))
            .collect()
    }

    /// Polls every active relay pipe and returns the first that is ready.
    ///
    /// The scan starts one past the slot that was last served so a busy
    /// low-numbered worker cannot starve the others.
    pub fn poll_relay(&mut self, cx: &mut Context<'_>) -> Poll<(SlotId, RelayRead)> {
        let capacity = self.slots.len();
        for offset in 0..capacity {
            let id = (self.next_poll + offset) % capacity;
            let Some(slot) = self.slots[id].as_mut() else {
                continue;
            };
            if let Poll::Ready(read) = slot.relay.poll_read_frames(cx) {
                self.next_poll = (id + 1) % capacity;
                return Poll::Ready((id, read));
            }
        }
        Poll::Pending
    }
}
