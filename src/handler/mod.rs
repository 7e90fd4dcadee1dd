mod handle;
pub(crate) mod loop_event;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::attempt::{Attempt, FailureKind, Step};
use crate::config::HandlerConfig;
use crate::descriptor::{ConnDescriptor, Direction, ResolveMode};
use crate::error::HandlerError;
use crate::events::{ConnId, Framing, PeerEvents};
use crate::listener::{bind_listener, ListenerHandle};
use crate::rate::RateGroups;
use crate::resolver::ResolveOnly;
use crate::stream::{spawn_peer_io, EstablishedPeer, IoTotals};

pub use handle::HandlerHandle;

use loop_event::{CloseCause, EventRx, EventTx, LoopEvent};

/// Caps the fan-out of concurrently connecting/resolving attempts so a burst
///  of failures cannot saturate the OS with half-open work.
const MAX_SIMULTANEOUS_CONNECTING: usize = 8;

const REQUEST_INTERVAL: Duration = Duration::from_millis(500);

/// The orchestrator. Owns the registries and the event queue; the task that
///  awaits [pump_events](ConnectionHandler::pump_events) becomes the event
///  task, and every state transition and application callback runs there.
///  Cross-thread operations go through [HandlerHandle].
pub struct ConnectionHandler {
    config: HandlerConfig,
    events_cb: Arc<dyn PeerEvents>,
    framing: Arc<dyn Framing>,

    tx: EventTx,
    rx: EventRx,

    pending: FxHashMap<ConnId, Attempt>,
    dns_only: FxHashMap<ConnId, ResolveOnly>,
    connected: Arc<Mutex<FxHashMap<ConnId, EstablishedPeer>>>,
    binds: Arc<Mutex<FxHashMap<ConnId, ListenerHandle>>>,

    groups: Arc<RateGroups>,
    totals: IoTotals,

    next_id: u64,
    outgoing_limit: usize,
    outgoing_count: usize,
    incoming_count: usize,

    running: bool,
    shutdown: bool,
    next_request_at: Instant,
}

impl ConnectionHandler {
    pub fn new(config: HandlerConfig, events: Arc<dyn PeerEvents>, framing: Arc<dyn Framing>) -> ConnectionHandler {
        let (tx, rx) = mpsc::unbounded_channel();
        ConnectionHandler {
            outgoing_limit: config.outgoing_limit,
            config,
            events_cb: events,
            framing,
            tx,
            rx,
            pending: FxHashMap::default(),
            dns_only: FxHashMap::default(),
            connected: Arc::new(Mutex::new(FxHashMap::default())),
            binds: Arc::new(Mutex::new(FxHashMap::default())),
            groups: Arc::new(RateGroups::new()),
            totals: IoTotals::new(),
            next_id: 0,
            outgoing_count: 0,
            incoming_count: 0,
            running: false,
            shutdown: false,
            next_request_at: Instant::now(),
        }
    }

    /// The bridge object for foreign threads; cheap to clone.
    pub fn handle(&self) -> HandlerHandle {
        HandlerHandle {
            connected: self.connected.clone(),
            groups: self.groups.clone(),
            events: self.tx.clone(),
        }
    }

    /// Brings the handler up: arms the admission timer, reports `on_startup`
    ///  and pulses one admission pass.
    pub async fn start(&mut self, outgoing_limit: usize) -> Result<(), HandlerError> {
        if self.running {
            return Err(HandlerError::AlreadyRunning);
        }
        debug_assert_eq!(self.outgoing_count, 0);
        debug_assert_eq!(self.incoming_count, 0);

        self.running = true;
        self.shutdown = false;
        self.outgoing_limit = outgoing_limit;
        self.next_request_at = Instant::now() + REQUEST_INTERVAL;

        info!("starting connection handler, outgoing limit {}", outgoing_limit);
        self.events_cb.on_startup().await;
        let _ = self.tx.send(LoopEvent::RequestOutgoing);
        Ok(())
    }

    /// One pass over the event queue: with `block`, waits for the next event
    ///  or admission tick first; then drains everything that is ready.
    ///  Returns false once the shutdown drain has completed (after the final
    ///  `on_shutdown` callback).
    pub async fn pump_events(&mut self, block: bool) -> bool {
        if !self.running {
            return false;
        }

        if block && !self.shutdown {
            let deadline = self.next_request_at;
            let wake = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => None,
                event = self.rx.recv() => event,
            };
            match wake {
                Some(event) => self.dispatch(event).await,
                None => {
                    self.next_request_at = Instant::now() + REQUEST_INTERVAL;
                    self.request_outgoing().await;
                }
            }
        }

        while !self.shutdown {
            if Instant::now() >= self.next_request_at {
                self.next_request_at = Instant::now() + REQUEST_INTERVAL;
                self.request_outgoing().await;
                continue;
            }
            match self.rx.try_recv() {
                Ok(event) => self.dispatch(event).await,
                Err(_) => break,
            }
        }

        if self.shutdown {
            self.running = false;
            self.events_cb.on_shutdown().await;
            return false;
        }
        true
    }

    /// Schedules the shutdown drain; also available on the handle from any
    ///  thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopEvent::Shutdown);
    }

    /// Opens a listener for the descriptor's literal address. Event-task
    ///  only; a construction-time operation like in the original design.
    pub async fn bind(&mut self, conn: ConnDescriptor) -> Result<ConnId, HandlerError> {
        if !self.running {
            return Err(HandlerError::NotRunning);
        }
        {
            let binds = self.binds.lock().expect("binds lock poisoned");
            if binds.len() >= self.config.bind_limit {
                return Err(HandlerError::BindLimit);
            }
        }

        let id = self.alloc_id();
        match bind_listener(id, &conn, &self.tx) {
            Ok(handle) => {
                self.binds.lock().expect("binds lock poisoned").insert(id, handle);
                self.events_cb.on_bind(conn).await;
                Ok(id)
            }
            Err(e) => {
                warn!("binding {:?} failed: {:#}", conn, e);
                self.events_cb.on_bind_failure(conn.clone()).await;
                Err(HandlerError::BindFailed(format!("{:?}", conn)))
            }
        }
    }

    pub fn listener_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.binds.lock().expect("binds lock poisoned").get(&id).map(|l| l.local_addr)
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing_count
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming_count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn dns_only_count(&self) -> usize {
        self.dns_only.len()
    }

    pub fn bind_count(&self) -> usize {
        self.binds.lock().expect("binds lock poisoned").len()
    }

    pub fn bytes_read(&self) -> u64 {
        self.totals.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.totals.bytes_written.load(Ordering::Relaxed)
    }

    fn alloc_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }

    async fn dispatch(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::RequestOutgoing => self.request_outgoing().await,

            LoopEvent::Resolved { id, addrs } => {
                let tx = self.tx.clone();
                if let Some(attempt) = self.pending.get_mut(&id) {
                    let step = attempt.on_resolved(addrs, &tx);
                    self.apply_step(id, step).await;
                }
            }
            LoopEvent::ResolveFailed { id, error } => {
                let tx = self.tx.clone();
                if let Some(attempt) = self.pending.get_mut(&id) {
                    let step = attempt.on_resolve_failed(error, &tx);
                    self.apply_step(id, step).await;
                }
            }
            LoopEvent::ConnectFinished { id, result } => {
                let tx = self.tx.clone();
                if let Some(attempt) = self.pending.get_mut(&id) {
                    let step = attempt.on_connect_finished(result, &tx);
                    self.apply_step(id, step).await;
                }
            }
            LoopEvent::ProxyDone { id, result } => {
                if let Some(attempt) = self.pending.get_mut(&id) {
                    let step = attempt.on_proxy_done(result);
                    self.apply_step(id, step).await;
                }
            }
            LoopEvent::RetryTimer { id } => {
                let tx = self.tx.clone();
                if let Some(attempt) = self.pending.get_mut(&id) {
                    trace!(%id, "retry timer fired");
                    let step = attempt.connect(&tx);
                    self.apply_step(id, step).await;
                } else if let Some(record) = self.dns_only.get_mut(&id) {
                    record.resolve(id, &tx);
                }
            }

            LoopEvent::IncomingAccepted { listener_id, stream, peer_addr } => {
                self.incoming_accepted(listener_id, stream, peer_addr).await;
            }
            LoopEvent::ListenFailed { listener_id } => {
                let handle = {
                    let mut binds = self.binds.lock().expect("binds lock poisoned");
                    binds.remove(&listener_id)
                };
                if let Some(handle) = handle {
                    handle.cancel();
                    self.events_cb.on_bind_failure(handle.conn.clone()).await;
                }
            }

            LoopEvent::FramesReceived { id, frames, total_bytes } => {
                let known = self.connected.lock().expect("connected lock poisoned").contains_key(&id);
                if !known {
                    return;
                }
                if !self.events_cb.on_receive_messages(id, frames, total_bytes).await {
                    warn!(%id, "application flagged the stream as malformed");
                    self.drop_malformed(id).await;
                }
            }
            LoopEvent::Malformed { id } => self.drop_malformed(id).await,
            LoopEvent::WriteBufferFull { id, buffered } => {
                let known = self.connected.lock().expect("connected lock poisoned").contains_key(&id);
                if known {
                    self.events_cb.on_write_buffer_full(id, buffered).await;
                }
            }
            LoopEvent::WriteBufferReady { id, buffered } => {
                let known = self.connected.lock().expect("connected lock poisoned").contains_key(&id);
                if known {
                    self.events_cb.on_write_buffer_ready(id, buffered).await;
                }
            }
            LoopEvent::PeerClosed { id, cause } => self.handle_peer_closed(id, cause).await,

            LoopEvent::ResolveOnlyDone { id, addrs } => {
                if let Some(record) = self.dns_only.remove(&id) {
                    let results = addrs.iter().map(|a| record.conn.resolved_from(*a)).collect();
                    self.events_cb.on_dns_response(record.conn.clone(), results).await;
                }
            }
            LoopEvent::ResolveOnlyFailed { id, error } => self.resolve_only_failed(id, error).await,

            LoopEvent::Shutdown => self.shutdown_int().await,
        }
    }

    /// The admission pass: asks the application for up to
    ///  `min(MAX_SIMULTANEOUS_CONNECTING, remaining outgoing headroom)`
    ///  candidates and starts an attempt for each set one.
    async fn request_outgoing(&mut self) {
        if self.shutdown || !self.running {
            return;
        }

        let pending_outgoing = self.pending.values().filter(|a| a.is_outgoing()).count();
        let headroom = self.outgoing_limit.saturating_sub(self.outgoing_count + pending_outgoing);
        let need = headroom.min(MAX_SIMULTANEOUS_CONNECTING);
        if need == 0 {
            return;
        }

        let candidates = self.events_cb.on_need_outgoing_connections(need).await;
        for conn in candidates.into_iter().take(need) {
            if !conn.is_set() {
                continue;
            }
            self.start_connection(conn).await;
        }
    }

    async fn start_connection(&mut self, conn: ConnDescriptor) {
        if conn.is_dns() && conn.options.resolve_mode == ResolveMode::ResolveOnly {
            if conn.proxy.is_some() {
                // no meaningful answer exists: the proxy would resolve
                // remotely and cannot report addresses back
                warn!("resolve-only through a proxy is unsupported, skipping {:?}", conn);
                return;
            }
            let id = self.alloc_id();
            let mut record = ResolveOnly::new(conn);
            record.resolve(id, &self.tx);
            self.dns_only.insert(id, record);
            return;
        }

        let id = self.alloc_id();
        debug!(%id, "starting outgoing connection to {:?}", conn);
        let mut attempt = Attempt::outgoing(id, conn);
        let tx = self.tx.clone();
        let step = attempt.connect(&tx);
        self.pending.insert(id, attempt);
        self.apply_step(id, step).await;
    }

    async fn apply_step(&mut self, id: ConnId, step: Step) {
        match step {
            Step::Continue => {}
            Step::Established { stream, resolved } => {
                let Some(attempt) = self.pending.remove(&id) else { return };
                if attempt.is_outgoing() {
                    self.outgoing_established(attempt, stream, resolved).await;
                } else {
                    self.incoming_established(attempt, stream, resolved).await;
                }
            }
            Step::NextAddress { resolved } => {
                // address iteration: the attempt keeps its id and the next
                // resolved address is dialed without a backoff wait
                let Some(attempt) = self.pending.get_mut(&id) else { return };
                let requested = attempt.conn.clone();
                self.events_cb.on_connection_failure(requested, resolved, true).await;

                let tx = self.tx.clone();
                if let Some(attempt) = self.pending.get_mut(&id) {
                    let _step = attempt.connect(&tx);
                    debug_assert!(matches!(_step, Step::Continue));
                }
            }
            Step::Failed { kind, resolved, should_retry } => {
                let Some(attempt) = self.pending.remove(&id) else { return };
                if attempt.is_outgoing() {
                    self.connection_failure(attempt, kind, resolved, should_retry).await;
                }
                // an incoming record that failed to wrap just goes away
            }
        }
    }

    async fn outgoing_established(&mut self, attempt: Attempt, stream: tokio::net::TcpStream, resolved: ConnDescriptor) {
        let id = attempt.id;
        let requested = attempt.conn.clone();
        info!(%id, "outgoing connection established: {:?} via {:?}", requested, resolved);

        let peer = spawn_peer_io(
            id,
            stream,
            requested.clone(),
            Direction::Outbound,
            self.groups.outgoing.clone(),
            self.framing.clone(),
            self.tx.clone(),
            self.totals.clone(),
        );
        self.connected.lock().expect("connected lock poisoned").insert(id, peer);
        self.outgoing_count += 1;

        if !self.events_cb.on_outgoing_connection(id, requested, resolved).await {
            debug!(%id, "application rejected the outgoing connection");
            let peer = self.connected.lock().expect("connected lock poisoned").remove(&id);
            if let Some(peer) = peer {
                peer.cancel();
            }
            self.outgoing_count -= 1;
            self.events_cb.on_disconnected(id, false).await;
            let _ = self.tx.send(LoopEvent::RequestOutgoing);
            return;
        }

        self.events_cb.on_ready_for_first_send(id).await;
    }

    async fn incoming_established(&mut self, attempt: Attempt, stream: tokio::net::TcpStream, peer_desc: ConnDescriptor) {
        let id = attempt.id;
        let listener_conn = attempt.conn.clone();

        if self.incoming_count >= self.config.incoming_limit
            || self.incoming_count + self.outgoing_count >= self.config.total_limit
        {
            debug!(%id, "dropping incoming connection, at capacity");
            return;
        }

        if !self.events_cb.on_incoming_connection(id, listener_conn, peer_desc.clone()).await {
            debug!(%id, "application rejected incoming connection from {}:{}", peer_desc.host, peer_desc.port);
            return;
        }

        info!(%id, "incoming connection established from {}:{}", peer_desc.host, peer_desc.port);
        let peer = spawn_peer_io(
            id,
            stream,
            peer_desc,
            Direction::Inbound,
            self.groups.incoming.clone(),
            self.framing.clone(),
            self.tx.clone(),
            self.totals.clone(),
        );
        self.connected.lock().expect("connected lock poisoned").insert(id, peer);
        self.incoming_count += 1;
    }

    async fn connection_failure(&mut self, mut attempt: Attempt, kind: FailureKind, resolved: ConnDescriptor, should_retry: bool) {
        let retry = should_retry && !self.shutdown;
        let requested = attempt.conn.clone();

        match kind {
            FailureKind::Resolve => self.events_cb.on_dns_failure(resolved, retry).await,
            FailureKind::Connect => self.events_cb.on_connection_failure(requested, resolved, retry).await,
            FailureKind::Proxy => self.events_cb.on_proxy_failure(requested, retry).await,
        }

        if retry {
            let new_id = self.alloc_id();
            debug!(old = %attempt.id, new = %new_id, "re-scheduling attempt");
            let tx = self.tx.clone();
            attempt.retry(new_id, &tx);
            self.pending.insert(new_id, attempt);
        } else {
            let _ = self.tx.send(LoopEvent::RequestOutgoing);
        }
    }

    async fn handle_peer_closed(&mut self, id: ConnId, cause: CloseCause) {
        let peer = self.connected.lock().expect("connected lock poisoned").remove(&id);
        let Some(peer) = peer else {
            // the teardown raced another close; the first one won
            return;
        };
        peer.cancel();
        match peer.direction {
            Direction::Outbound => self.outgoing_count -= 1,
            Direction::Inbound => self.incoming_count -= 1,
        }

        let reconnect = cause == CloseCause::Remote
            && peer.direction == Direction::Outbound
            && peer.conn.options.persistent
            && !self.shutdown;
        info!(%id, ?cause, reconnect, "disconnected");
        self.events_cb.on_disconnected(id, reconnect).await;

        if reconnect {
            let new_id = self.alloc_id();
            let mut attempt = Attempt::outgoing(new_id, peer.conn.clone());
            let tx = self.tx.clone();
            attempt.retry(new_id, &tx);
            self.pending.insert(new_id, attempt);
        } else {
            let _ = self.tx.send(LoopEvent::RequestOutgoing);
        }
    }

    async fn drop_malformed(&mut self, id: ConnId) {
        let peer = self.connected.lock().expect("connected lock poisoned").remove(&id);
        let Some(peer) = peer else { return };
        peer.cancel();
        match peer.direction {
            Direction::Outbound => self.outgoing_count -= 1,
            Direction::Inbound => self.incoming_count -= 1,
        }
        self.events_cb.on_disconnected(id, false).await;
        let _ = self.tx.send(LoopEvent::RequestOutgoing);
    }

    async fn incoming_accepted(&mut self, listener_id: ConnId, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        if self.shutdown {
            return;
        }
        let listener_conn = {
            let binds = self.binds.lock().expect("binds lock poisoned");
            binds.get(&listener_id).map(|l| l.conn.clone())
        };
        let Some(listener_conn) = listener_conn else {
            // accepted just as the listener was being removed
            return;
        };

        let id = self.alloc_id();
        let mut attempt = Attempt::incoming(id, listener_conn, stream, peer_addr);
        let tx = self.tx.clone();
        let step = attempt.connect(&tx);
        self.pending.insert(id, attempt);
        self.apply_step(id, step).await;
    }

    async fn resolve_only_failed(&mut self, id: ConnId, error: String) {
        let Some(record) = self.dns_only.get_mut(&id) else { return };
        debug!(%id, "resolve-only failed: {}", error);
        let retry = record.consume_retry() && !self.shutdown;
        let conn = record.conn.clone();

        self.events_cb.on_dns_failure(conn, retry).await;

        if retry {
            let tx = self.tx.clone();
            if let Some(record) = self.dns_only.get_mut(&id) {
                record.arm_retry(id, &tx);
            }
        } else {
            self.dns_only.remove(&id);
        }
        let _ = self.tx.send(LoopEvent::RequestOutgoing);
    }

    /// Drains everything: cancels all peers and attempts, reports each with
    ///  its retry/reconnect flag clamped to false, and leaves every registry
    ///  empty. The pump notices the flag and finishes with `on_shutdown`.
    async fn shutdown_int(&mut self) {
        if self.shutdown {
            return;
        }
        info!("shutdown started");

        let connected: Vec<(ConnId, EstablishedPeer)> = {
            let mut map = self.connected.lock().expect("connected lock poisoned");
            map.drain().collect()
        };
        let binds: Vec<(ConnId, ListenerHandle)> = {
            let mut map = self.binds.lock().expect("binds lock poisoned");
            map.drain().collect()
        };
        self.shutdown = true;

        for (id, peer) in connected {
            peer.cancel();
            match peer.direction {
                Direction::Outbound => self.outgoing_count -= 1,
                Direction::Inbound => self.incoming_count -= 1,
            }
            self.events_cb.on_disconnected(id, false).await;
        }

        for (_, listener) in binds {
            listener.cancel();
        }

        let pending = std::mem::take(&mut self.pending);
        for (_, mut attempt) in pending {
            attempt.cancel();
            if attempt.is_outgoing() {
                let conn = attempt.conn.clone();
                self.events_cb.on_connection_failure(conn.clone(), conn, false).await;
            }
        }

        for (_, mut record) in std::mem::take(&mut self.dns_only) {
            record.cancel();
        }

        debug_assert_eq!(self.outgoing_count, 0);
        debug_assert_eq!(self.incoming_count, 0);
        info!("shutdown complete");
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for (_, mut attempt) in self.pending.drain() {
            attempt.cancel();
        }
        if let Ok(mut connected) = self.connected.lock() {
            for (_, peer) in connected.drain() {
                peer.cancel();
            }
        }
    }
}
