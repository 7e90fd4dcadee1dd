use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;

use crate::descriptor::ConnDescriptor;
use crate::events::{ConnId, PeerEvents};

/// A flattened record of one callback invocation, with descriptors reduced to
///  `host:port` strings so tests can match on them directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upcall {
    Startup,
    NeedOutgoing(usize),
    DnsResponse { host: String, results: usize },
    DnsFailure { host: String, will_retry: bool },
    OutgoingConnection { id: ConnId, requested: String, resolved: String },
    IncomingConnection { id: ConnId, peer: String },
    ConnectionFailure { requested: String, resolved: String, will_retry: bool },
    ProxyFailure { will_retry: bool },
    ReadyForFirstSend(ConnId),
    ReceiveMessages { id: ConnId, frames: Vec<Vec<u8>>, total: usize },
    WriteBufferFull { id: ConnId, buffered: usize },
    WriteBufferReady { id: ConnId, buffered: usize },
    Bind(String),
    BindFailure(String),
    Disconnected { id: ConnId, will_reconnect: bool },
    Shutdown,
}

fn host_port(conn: &ConnDescriptor) -> String {
    format!("{}:{}", conn.host, conn.port)
}

/// A [PeerEvents] implementation for tests: answers from configured state and
///  records every callback in order.
pub struct RecordingEvents {
    log: Mutex<Vec<Upcall>>,
    candidates: Mutex<VecDeque<Vec<ConnDescriptor>>>,
    accept_outgoing: AtomicBool,
    accept_incoming: AtomicBool,
    accept_frames: AtomicBool,
}

impl RecordingEvents {
    pub fn new() -> RecordingEvents {
        RecordingEvents {
            log: Mutex::new(Vec::new()),
            candidates: Mutex::new(VecDeque::new()),
            accept_outgoing: AtomicBool::new(true),
            accept_incoming: AtomicBool::new(true),
            accept_frames: AtomicBool::new(true),
        }
    }

    /// Queues one batch of candidates; each admission pass pops one batch.
    pub fn push_candidates(&self, batch: Vec<ConnDescriptor>) {
        self.candidates.lock().unwrap().push_back(batch);
    }

    pub fn set_accept_outgoing(&self, accept: bool) {
        self.accept_outgoing.store(accept, Ordering::Relaxed);
    }

    pub fn set_accept_incoming(&self, accept: bool) {
        self.accept_incoming.store(accept, Ordering::Relaxed);
    }

    pub fn set_accept_frames(&self, accept: bool) {
        self.accept_frames.store(accept, Ordering::Relaxed);
    }

    pub fn upcalls(&self) -> Vec<Upcall> {
        self.log.lock().unwrap().clone()
    }

    pub fn has(&self, pred: impl Fn(&Upcall) -> bool) -> bool {
        self.log.lock().unwrap().iter().any(|u| pred(u))
    }

    pub fn count(&self, pred: impl Fn(&Upcall) -> bool) -> usize {
        self.log.lock().unwrap().iter().filter(|u| pred(u)).count()
    }

    /// The id of the first accepted outgoing connection.
    pub fn established_id(&self) -> Option<ConnId> {
        self.log.lock().unwrap().iter().find_map(|u| match u {
            Upcall::OutgoingConnection { id, .. } => Some(*id),
            _ => None,
        })
    }

    fn record(&self, upcall: Upcall) {
        self.log.lock().unwrap().push(upcall);
    }
}

impl Default for RecordingEvents {
    fn default() -> RecordingEvents {
        RecordingEvents::new()
    }
}

#[async_trait::async_trait]
impl PeerEvents for RecordingEvents {
    async fn on_startup(&self) {
        self.record(Upcall::Startup);
    }

    async fn on_need_outgoing_connections(&self, needed: usize) -> Vec<ConnDescriptor> {
        self.record(Upcall::NeedOutgoing(needed));
        self.candidates.lock().unwrap().pop_front().unwrap_or_default()
    }

    async fn on_dns_response(&self, requested: ConnDescriptor, resolved: Vec<ConnDescriptor>) {
        self.record(Upcall::DnsResponse {
            host: host_port(&requested),
            results: resolved.len(),
        });
    }

    async fn on_dns_failure(&self, requested: ConnDescriptor, will_retry: bool) {
        self.record(Upcall::DnsFailure {
            host: host_port(&requested),
            will_retry,
        });
    }

    async fn on_outgoing_connection(&self, id: ConnId, requested: ConnDescriptor, resolved: ConnDescriptor) -> bool {
        self.record(Upcall::OutgoingConnection {
            id,
            requested: host_port(&requested),
            resolved: host_port(&resolved),
        });
        self.accept_outgoing.load(Ordering::Relaxed)
    }

    async fn on_incoming_connection(&self, id: ConnId, _listener: ConnDescriptor, peer: ConnDescriptor) -> bool {
        self.record(Upcall::IncomingConnection {
            id,
            peer: host_port(&peer),
        });
        self.accept_incoming.load(Ordering::Relaxed)
    }

    async fn on_connection_failure(&self, requested: ConnDescriptor, resolved: ConnDescriptor, will_retry: bool) {
        self.record(Upcall::ConnectionFailure {
            requested: host_port(&requested),
            resolved: host_port(&resolved),
            will_retry,
        });
    }

    async fn on_proxy_failure(&self, _requested: ConnDescriptor, will_retry: bool) {
        self.record(Upcall::ProxyFailure { will_retry });
    }

    async fn on_ready_for_first_send(&self, id: ConnId) {
        self.record(Upcall::ReadyForFirstSend(id));
    }

    async fn on_receive_messages(&self, id: ConnId, frames: Vec<Bytes>, total_bytes: usize) -> bool {
        self.record(Upcall::ReceiveMessages {
            id,
            frames: frames.iter().map(|f| f.to_vec()).collect(),
            total: total_bytes,
        });
        self.accept_frames.load(Ordering::Relaxed)
    }

    async fn on_write_buffer_full(&self, id: ConnId, buffered: usize) {
        self.record(Upcall::WriteBufferFull { id, buffered });
    }

    async fn on_write_buffer_ready(&self, id: ConnId, buffered: usize) {
        self.record(Upcall::WriteBufferReady { id, buffered });
    }

    async fn on_bind(&self, listener: ConnDescriptor) {
        self.record(Upcall::Bind(host_port(&listener)));
    }

    async fn on_bind_failure(&self, listener: ConnDescriptor) {
        self.record(Upcall::BindFailure(host_port(&listener)));
    }

    async fn on_disconnected(&self, id: ConnId, will_reconnect: bool) {
        self.record(Upcall::Disconnected { id, will_reconnect });
    }

    async fn on_shutdown(&self) {
        self.record(Upcall::Shutdown);
    }
}
