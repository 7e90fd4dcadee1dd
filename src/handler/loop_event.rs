use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::events::ConnId;

pub(crate) type EventTx = mpsc::UnboundedSender<LoopEvent>;
pub(crate) type EventRx = mpsc::UnboundedReceiver<LoopEvent>;

/// Why an established peer went away. Only a remote failure is eligible for
///  reconnecting; everything local was asked for.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum CloseCause {
    Remote,
    Local,
}

/// Every I/O completion, timer expiry and cross-thread request is funneled
///  through this one queue and dispatched on the event task. State-machine
///  transitions are exhaustive matches over these, which keeps the set of
///  "installed callbacks" visible in one place.
pub(crate) enum LoopEvent {
    /// Pulse of the admission timer, also posted directly when a slot frees up.
    RequestOutgoing,

    Resolved { id: ConnId, addrs: Vec<SocketAddr> },
    ResolveFailed { id: ConnId, error: String },
    ConnectFinished { id: ConnId, result: std::io::Result<TcpStream> },
    ProxyDone { id: ConnId, result: anyhow::Result<TcpStream> },
    RetryTimer { id: ConnId },

    IncomingAccepted { listener_id: ConnId, stream: TcpStream, peer_addr: SocketAddr },
    ListenFailed { listener_id: ConnId },

    FramesReceived { id: ConnId, frames: Vec<Bytes>, total_bytes: usize },
    Malformed { id: ConnId },
    WriteBufferFull { id: ConnId, buffered: usize },
    WriteBufferReady { id: ConnId, buffered: usize },
    PeerClosed { id: ConnId, cause: CloseCause },

    ResolveOnlyDone { id: ConnId, addrs: Vec<SocketAddr> },
    ResolveOnlyFailed { id: ConnId, error: String },

    Shutdown,
}
