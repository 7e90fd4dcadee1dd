use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::descriptor::{Direction, RateLimit};
use crate::events::ConnId;
use crate::handler::loop_event::{EventTx, LoopEvent};
use crate::rate::RateGroups;
use crate::stream::EstablishedPeer;

/// The bridge for foreign threads: every operation here either delegates to
///  a thread-safe per-peer primitive under the connected-registry lock, or
///  posts an event for the event task. None of them block on I/O and none
///  hold a lock across an await.
#[derive(Clone)]
pub struct HandlerHandle {
    pub(crate) connected: Arc<Mutex<FxHashMap<ConnId, EstablishedPeer>>>,
    pub(crate) groups: Arc<RateGroups>,
    pub(crate) events: EventTx,
}

impl HandlerHandle {
    /// Appends to the peer's outbound buffer. False when the peer is unknown
    ///  or winding down; the bytes are then dropped.
    pub fn send(&self, id: ConnId, data: Bytes) -> bool {
        let connected = self.connected.lock().expect("connected lock poisoned");
        match connected.get(&id) {
            Some(peer) => peer.write(data),
            None => false,
        }
    }

    /// Closes a peer. `immediate` discards buffered output; otherwise the
    ///  buffer is flushed first and the disconnect callback follows the last
    ///  byte out.
    pub fn close(&self, id: ConnId, immediate: bool) {
        let connected = self.connected.lock().expect("connected lock poisoned");
        if let Some(peer) = connected.get(&id) {
            if immediate {
                peer.disconnect_now();
            } else {
                peer.disconnect_after_write();
            }
        }
    }

    pub fn pause_recv(&self, id: ConnId) {
        let connected = self.connected.lock().expect("connected lock poisoned");
        if let Some(peer) = connected.get(&id) {
            peer.set_paused(true);
        }
    }

    pub fn unpause_recv(&self, id: ConnId) {
        let connected = self.connected.lock().expect("connected lock poisoned");
        if let Some(peer) = connected.get(&id) {
            peer.set_paused(false);
        }
    }

    pub fn set_rate_limit(&self, id: ConnId, limit: RateLimit) {
        let connected = self.connected.lock().expect("connected lock poisoned");
        if let Some(peer) = connected.get(&id) {
            peer.set_rate_limit(limit);
        }
    }

    /// Swaps the aggregate limit shared by all peers of one direction.
    pub fn set_group_rate_limit(&self, direction: Direction, limit: RateLimit) {
        self.groups.for_direction(direction).set(limit);
    }

    /// Schedules the shutdown drain on the event task and returns.
    pub fn shutdown(&self) {
        let _ = self.events.send(LoopEvent::Shutdown);
    }
}
