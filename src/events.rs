use std::fmt::{Debug, Display, Formatter};

use bytes::{Bytes, BytesMut};

use crate::descriptor::ConnDescriptor;

/// Identifies one connection attempt. Allocated by the handler, monotonically
///  increasing; a retry gets a fresh id, so ids are opaque and short-lived
///  from the application's point of view.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnId(pub u64);

impl Debug for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// The application-supplied byte-to-frame parser. Fed the raw receive buffer
///  on the event task; consumes complete frames and leaves partial data in
///  the buffer. An `Err` marks the stream malformed and drops the peer.
pub trait Framing: Send + Sync {
    fn decode(&self, buf: &mut BytesMut) -> anyhow::Result<Vec<Bytes>>;
}

/// The callback facade the embedding application implements. All callbacks
///  are invoked and awaited on the event task, so for a given id they observe
///  the natural phase order: resolve, connect, proxy handshake, established,
///  disconnected.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PeerEvents: Send + Sync {
    async fn on_startup(&self);

    /// Return up to `needed` candidate descriptors. Called from a 500ms
    ///  admission timer whenever there is headroom below the outgoing limit.
    async fn on_need_outgoing_connections(&self, needed: usize) -> Vec<ConnDescriptor>;

    async fn on_dns_response(&self, requested: ConnDescriptor, resolved: Vec<ConnDescriptor>);
    async fn on_dns_failure(&self, requested: ConnDescriptor, will_retry: bool);

    /// An outgoing peer reached its remote. Return false to reject it; the
    ///  peer is then dropped again with a final `on_disconnected`.
    async fn on_outgoing_connection(&self, id: ConnId, requested: ConnDescriptor, resolved: ConnDescriptor) -> bool;

    /// An incoming peer was accepted by a listener. Return false to reject:
    ///  the socket closes and the id is never heard from again.
    async fn on_incoming_connection(&self, id: ConnId, listener: ConnDescriptor, peer: ConnDescriptor) -> bool;

    async fn on_connection_failure(&self, requested: ConnDescriptor, resolved: ConnDescriptor, will_retry: bool);
    async fn on_proxy_failure(&self, requested: ConnDescriptor, will_retry: bool);

    /// Emitted once per established outgoing peer, before any frames arrive.
    async fn on_ready_for_first_send(&self, id: ConnId);

    /// One or more complete frames arrived. Return false to mark the stream
    ///  malformed; the peer is disconnected immediately and will not retry.
    async fn on_receive_messages(&self, id: ConnId, frames: Vec<Bytes>, total_bytes: usize) -> bool;

    async fn on_write_buffer_full(&self, id: ConnId, buffered: usize);
    async fn on_write_buffer_ready(&self, id: ConnId, buffered: usize);

    async fn on_bind(&self, listener: ConnDescriptor);
    async fn on_bind_failure(&self, listener: ConnDescriptor);

    async fn on_disconnected(&self, id: ConnId, will_reconnect: bool);

    async fn on_shutdown(&self);
}
