use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::descriptor::{ConnDescriptor, Direction, RateLimit};
use crate::events::{ConnId, Framing};
use crate::handler::loop_event::{CloseCause, EventTx, LoopEvent};
use crate::rate::RateLimiter;

const READ_CHUNK: usize = 16 * 1024;

/// Byte totals across all peers of one handler.
#[derive(Clone)]
pub(crate) struct IoTotals {
    pub bytes_read: Arc<AtomicU64>,
    pub bytes_written: Arc<AtomicU64>,
}

impl IoTotals {
    pub fn new() -> IoTotals {
        IoTotals {
            bytes_read: Arc::new(AtomicU64::new(0)),
            bytes_written: Arc::new(AtomicU64::new(0)),
        }
    }
}

enum WriteCmd {
    Data(Bytes),
    FlushAndClose,
}

struct OutboundState {
    buffered: usize,
    above_high: bool,
    closing: bool,
}

/// An established peer as kept in the connected registry. The actual I/O runs
///  in a reader task and a writer task; this struct holds the thread-safe
///  primitives the bridge operations delegate to, so they work from any
///  thread while the registry lock is held only briefly.
pub(crate) struct EstablishedPeer {
    pub id: ConnId,
    pub conn: ConnDescriptor,
    pub direction: Direction,
    writer_tx: mpsc::UnboundedSender<WriteCmd>,
    outbound: Arc<Mutex<OutboundState>>,
    pause: watch::Sender<bool>,
    rate: Arc<RateLimiter>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    events: EventTx,
    high_water: usize,
}

/// Wraps a connected stream: splits it, installs the reader and writer tasks,
///  and attaches the per-peer bucket underneath the direction's group bucket.
pub(crate) fn spawn_peer_io(
    id: ConnId,
    stream: TcpStream,
    conn: ConnDescriptor,
    direction: Direction,
    group: Arc<RateLimiter>,
    framing: Arc<dyn Framing>,
    events: EventTx,
    totals: IoTotals,
) -> EstablishedPeer {
    let rate = Arc::new(RateLimiter::new(conn.options.rate_limit));
    let outbound = Arc::new(Mutex::new(OutboundState {
        buffered: 0,
        above_high: false,
        closing: false,
    }));
    let (pause, paused_rx) = watch::channel(false);
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();

    let (read_half, write_half) = stream.into_split();

    let reader = tokio::spawn(read_loop(
        id,
        read_half,
        framing,
        group.clone(),
        rate.clone(),
        paused_rx,
        events.clone(),
        totals.clone(),
    ));
    let writer = tokio::spawn(write_loop(
        id,
        write_half,
        writer_rx,
        outbound.clone(),
        conn.options.write_low_water,
        group,
        rate.clone(),
        events.clone(),
        totals,
    ));

    let high_water = conn.options.write_high_water;
    EstablishedPeer {
        id,
        conn,
        direction,
        writer_tx,
        outbound,
        pause,
        rate,
        reader,
        writer,
        events,
        high_water,
    }
}

impl EstablishedPeer {
    /// Appends to the outbound buffer. False once the peer is winding down or
    ///  gone. Crossing the high-water mark posts a WriteBufferFull event.
    pub fn write(&self, data: Bytes) -> bool {
        if data.is_empty() {
            return true;
        }

        let crossed = {
            let mut outbound = self.outbound.lock().expect("outbound lock poisoned");
            if outbound.closing {
                return false;
            }
            outbound.buffered += data.len();
            if !outbound.above_high && outbound.buffered >= self.high_water {
                outbound.above_high = true;
                Some(outbound.buffered)
            } else {
                None
            }
        };

        // the full event goes out before the data command so the writer task
        // cannot race a buffer-ready event ahead of it
        if let Some(buffered) = crossed {
            let _ = self.events.send(LoopEvent::WriteBufferFull { id: self.id, buffered });
        }
        self.writer_tx.send(WriteCmd::Data(data)).is_ok()
    }

    /// Graceful close: stop accepting writes, flush what is buffered, then
    ///  tear down. The disconnect event arrives once the writer has drained.
    pub fn disconnect_after_write(&self) {
        {
            let mut outbound = self.outbound.lock().expect("outbound lock poisoned");
            if outbound.closing {
                return;
            }
            outbound.closing = true;
        }
        let _ = self.writer_tx.send(WriteCmd::FlushAndClose);
    }

    /// Abrupt close: pending output is discarded.
    pub fn disconnect_now(&self) {
        self.outbound.lock().expect("outbound lock poisoned").closing = true;
        self.reader.abort();
        self.writer.abort();
        let _ = self.events.send(LoopEvent::PeerClosed {
            id: self.id,
            cause: CloseCause::Local,
        });
    }

    pub fn set_paused(&self, paused: bool) {
        let _ = self.pause.send(paused);
    }

    pub fn set_rate_limit(&self, limit: RateLimit) {
        self.rate.set(limit);
    }

    /// Tears the I/O tasks down without posting anything; used when the
    ///  handler has already taken the peer out of the registry.
    pub fn cancel(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    id: ConnId,
    mut read_half: OwnedReadHalf,
    framing: Arc<dyn Framing>,
    group: Arc<RateLimiter>,
    rate: Arc<RateLimiter>,
    mut paused: watch::Receiver<bool>,
    events: EventTx,
    totals: IoTotals,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        while *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                return;
            }
        }

        buf.reserve(READ_CHUNK);
        let n = match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(%id, "peer closed the connection");
                let _ = events.send(LoopEvent::PeerClosed { id, cause: CloseCause::Remote });
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(%id, "read error: {}", e);
                let _ = events.send(LoopEvent::PeerClosed { id, cause: CloseCause::Remote });
                return;
            }
        };

        totals.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        group.claim_read(n as u64).await;
        rate.claim_read(n as u64).await;

        match framing.decode(&mut buf) {
            Ok(frames) => {
                if !frames.is_empty() {
                    let total_bytes = frames.iter().map(|f| f.len()).sum();
                    if events.send(LoopEvent::FramesReceived { id, frames, total_bytes }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(%id, "undecodable data from peer: {}", e);
                let _ = events.send(LoopEvent::Malformed { id });
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_loop(
    id: ConnId,
    mut write_half: OwnedWriteHalf,
    mut cmds: mpsc::UnboundedReceiver<WriteCmd>,
    outbound: Arc<Mutex<OutboundState>>,
    low_water: usize,
    group: Arc<RateLimiter>,
    rate: Arc<RateLimiter>,
    events: EventTx,
    totals: IoTotals,
) {
    while let Some(cmd) = cmds.recv().await {
        match cmd {
            WriteCmd::Data(data) => {
                let n = data.len();
                group.claim_write(n as u64).await;
                rate.claim_write(n as u64).await;

                if let Err(e) = write_half.write_all(&data).await {
                    debug!(%id, "write error: {}", e);
                    let _ = events.send(LoopEvent::PeerClosed { id, cause: CloseCause::Remote });
                    return;
                }
                totals.bytes_written.fetch_add(n as u64, Ordering::Relaxed);

                let drained_to = {
                    let mut outbound = outbound.lock().expect("outbound lock poisoned");
                    outbound.buffered = outbound.buffered.saturating_sub(n);
                    if outbound.above_high && outbound.buffered <= low_water {
                        outbound.above_high = false;
                        Some(outbound.buffered)
                    } else {
                        None
                    }
                };
                if let Some(buffered) = drained_to {
                    let _ = events.send(LoopEvent::WriteBufferReady { id, buffered });
                }
            }
            WriteCmd::FlushAndClose => {
                // commands are processed in order, so everything accepted
                // before the close has already been written out
                let _ = write_half.shutdown().await;
                let _ = events.send(LoopEvent::PeerClosed { id, cause: CloseCause::Local });
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use crate::descriptor::ConnOptions;
    use crate::test_util::ChunkFraming;

    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn test_peer(
        stream: TcpStream,
        high_water: usize,
        low_water: usize,
    ) -> (EstablishedPeer, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut options = ConnOptions::default();
        options.write_high_water = high_water;
        options.write_low_water = low_water;
        let conn = ConnDescriptor::new("127.0.0.1", 1).with_options(options);
        let peer = spawn_peer_io(
            ConnId(1),
            stream,
            conn,
            Direction::Outbound,
            Arc::new(RateLimiter::new(RateLimit::UNLIMITED)),
            Arc::new(ChunkFraming),
            tx,
            IoTotals::new(),
        );
        (peer, rx)
    }

    #[tokio::test]
    async fn test_receive_posts_frames() {
        let (client, server) = connected_pair().await;
        let (peer, mut rx) = test_peer(client, usize::MAX, 0);

        let (mut srv_read, mut srv_write) = server.into_split();
        srv_write.write_all(b"0123456789").await.unwrap();

        match rx.recv().await {
            Some(LoopEvent::FramesReceived { id, frames, total_bytes }) => {
                assert_eq!(id, ConnId(1));
                assert_eq!(total_bytes, 10);
                assert_eq!(frames.concat(), b"0123456789");
            }
            _ => panic!("expected frames"),
        }

        // and the write direction reaches the socket
        assert!(peer.write(Bytes::from_static(b"pong")));
        let mut buf = [0u8; 4];
        srv_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_watermark_events() {
        let (client, server) = connected_pair().await;
        let (peer, mut rx) = test_peer(client, 8, 0);

        assert!(peer.write(Bytes::from_static(b"0123456789")));

        let mut saw_full = false;
        let mut saw_ready = false;
        for _ in 0..2 {
            match rx.recv().await {
                Some(LoopEvent::WriteBufferFull { buffered, .. }) => {
                    assert!(buffered >= 8);
                    assert!(!saw_ready, "full must precede ready");
                    saw_full = true;
                }
                Some(LoopEvent::WriteBufferReady { buffered, .. }) => {
                    assert_eq!(buffered, 0);
                    saw_ready = true;
                }
                _ => panic!("unexpected event"),
            }
        }
        assert!(saw_full && saw_ready);
        drop(server);
    }

    #[tokio::test]
    async fn test_pause_holds_back_reads() {
        let (client, server) = connected_pair().await;
        let (peer, mut rx) = test_peer(client, usize::MAX, 0);

        peer.set_paused(true);
        // give the reader a chance to observe the flag
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_srv_read, mut srv_write) = server.into_split();
        srv_write.write_all(b"held back").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "no frames may arrive while paused");

        peer.set_paused(false);
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(LoopEvent::FramesReceived { frames, .. })) => {
                assert_eq!(frames.concat(), b"held back");
            }
            other => panic!("expected frames after unpause, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_graceful_close_flushes_first() {
        let (client, server) = connected_pair().await;
        let (peer, mut rx) = test_peer(client, usize::MAX, 0);

        let payload = vec![7u8; 256 * 1024];
        assert!(peer.write(Bytes::from(payload.clone())));
        peer.disconnect_after_write();
        assert!(!peer.write(Bytes::from_static(b"too late")));

        let reader = tokio::spawn(async move {
            let (mut srv_read, _srv_write) = server.into_split();
            let mut received = Vec::new();
            srv_read.read_to_end(&mut received).await.unwrap();
            received
        });

        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
                Some(LoopEvent::PeerClosed { cause, .. }) => {
                    assert_eq!(cause, CloseCause::Local);
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed early"),
            }
        }

        let received = reader.await.unwrap();
        assert_eq!(received.len(), payload.len());
    }
}
