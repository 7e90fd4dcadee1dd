use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::descriptor::ConnDescriptor;
use crate::events::ConnId;
use crate::handler::loop_event::{EventTx, LoopEvent};

const ACCEPT_BACKLOG: u32 = 128;

/// A bound listening socket with its accept task. Accepted sockets are
///  forwarded to the handler as IncomingAccepted events and become incoming
///  attempts there.
pub(crate) struct ListenerHandle {
    pub conn: ConnDescriptor,
    pub local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Binds the descriptor's (literal) address with SO_REUSEADDR and starts
///  accepting. Port 0 binds an ephemeral port, reported in `local_addr`.
pub(crate) fn bind_listener(id: ConnId, conn: &ConnDescriptor, events: &EventTx) -> anyhow::Result<ListenerHandle> {
    let addr = conn
        .literal_addr()
        .with_context(|| format!("listener address must be literal: {:?}", conn))?;

    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(ACCEPT_BACKLOG)?;
    let local_addr = listener.local_addr()?;
    debug!(%id, "listening on {}", local_addr);

    let task = tokio::spawn(accept_loop(id, listener, events.clone()));
    Ok(ListenerHandle {
        conn: conn.clone(),
        local_addr,
        task,
    })
}

async fn accept_loop(id: ConnId, listener: TcpListener, events: EventTx) {
    let mut consecutive_errors = 0u32;
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                consecutive_errors = 0;
                debug!(listener = %id, "accepted connection from {}", peer_addr);
                if events
                    .send(LoopEvent::IncomingAccepted {
                        listener_id: id,
                        stream,
                        peer_addr,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                // usually transient resource exhaustion (EMFILE and friends);
                // back off briefly instead of spinning, give up if it never
                // clears
                warn!(listener = %id, "accept error: {}", e);
                consecutive_errors += 1;
                if consecutive_errors >= 8 {
                    let _ = events.send(LoopEvent::ListenFailed { listener_id: id });
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_bind_and_accept() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ConnDescriptor::new("127.0.0.1", 0);
        let handle = bind_listener(ConnId(1), &conn, &tx).unwrap();
        assert_ne!(handle.local_addr.port(), 0);

        let client = tokio::net::TcpStream::connect(handle.local_addr).await.unwrap();
        let client_addr = client.local_addr().unwrap();

        match rx.recv().await {
            Some(LoopEvent::IncomingAccepted { listener_id, peer_addr, .. }) => {
                assert_eq!(listener_id, ConnId(1));
                assert_eq!(peer_addr, client_addr);
            }
            _ => panic!("expected an accepted connection"),
        }
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = bind_listener(ConnId(1), &ConnDescriptor::new("127.0.0.1", 0), &tx).unwrap();

        let taken = ConnDescriptor::new("127.0.0.1", first.local_addr.port());
        assert!(bind_listener(ConnId(2), &taken, &tx).is_err());
    }

    #[tokio::test]
    async fn test_named_host_cannot_bind() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(bind_listener(ConnId(1), &ConnDescriptor::new("localhost", 0), &tx).is_err());
    }
}
