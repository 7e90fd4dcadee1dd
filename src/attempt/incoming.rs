use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::attempt::{Attempt, FailureKind, Step, Variant};

/// An already-accepted socket, held until the handler drives `connect`.
pub(crate) struct IncomingState {
    stream: Option<TcpStream>,
    peer_addr: SocketAddr,
}

impl IncomingState {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> IncomingState {
        IncomingState {
            stream: Some(stream),
            peer_addr,
        }
    }

    pub fn discard(&mut self) {
        self.stream = None;
    }
}

/// No retry and no I/O to wait for: wrap the socket, apply the options, and
///  report established. A failure here just drops the record.
pub(super) fn connect(attempt: &mut Attempt) -> Step {
    let (stream, peer_addr) = match &mut attempt.variant {
        Variant::Incoming(state) => (state.stream.take(), state.peer_addr),
        _ => unreachable!("incoming connect on a non-incoming attempt"),
    };

    match stream {
        Some(stream) => {
            let _ = stream.set_nodelay(true);
            let resolved = attempt.conn.resolved_from(peer_addr);
            Step::Established { stream, resolved }
        }
        None => Step::Failed {
            kind: FailureKind::Connect,
            resolved: attempt.conn.clone(),
            should_retry: false,
        },
    }
}
