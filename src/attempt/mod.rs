mod direct;
mod dns;
mod incoming;
mod proxy;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::descriptor::ConnDescriptor;
use crate::events::ConnId;
use crate::handler::loop_event::{EventTx, LoopEvent};

pub(crate) use dns::Dial;
pub(crate) use incoming::IncomingState;
pub(crate) use proxy::ProxyState;

/// Lifecycle phase of a pending attempt. Established and later phases live in
///  the connected registry, not here.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum Phase {
    Scheduled,
    Resolving,
    Connecting,
    HandshakingProxy,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum FailureKind {
    Resolve,
    Connect,
    Proxy,
}

/// What the handler should do after feeding an event into an attempt.
pub(crate) enum Step {
    /// The attempt spawned its next I/O and stays pending.
    Continue,
    Established {
        stream: TcpStream,
        resolved: ConnDescriptor,
    },
    /// The current address failed but more resolved addresses remain. This is
    ///  address iteration, not a retry: the failure is reported, the id stays,
    ///  and the next address is dialed right away with no backoff.
    NextAddress {
        resolved: ConnDescriptor,
    },
    Failed {
        kind: FailureKind,
        resolved: ConnDescriptor,
        should_retry: bool,
    },
}

/// The retry counter with its sentinel values separated out, so that a finite
///  counter running down to zero is not mistaken for the infinite sentinel.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum RetryBudget {
    None,
    Infinite,
    Finite(u32),
}

impl RetryBudget {
    pub fn from_count(retry_count: i32) -> RetryBudget {
        if retry_count < 0 {
            RetryBudget::None
        } else if retry_count == 0 {
            RetryBudget::Infinite
        } else {
            RetryBudget::Finite(retry_count as u32)
        }
    }

    /// True if a retry is allowed; a finite budget is decremented.
    pub fn consume(&mut self) -> bool {
        match self {
            RetryBudget::None => false,
            RetryBudget::Infinite => true,
            RetryBudget::Finite(0) => false,
            RetryBudget::Finite(n) => {
                *n -= 1;
                true
            }
        }
    }
}

enum Variant {
    Direct,
    Dns(Dial),
    Proxy(ProxyState),
    Incoming(IncomingState),
}

/// One pending connection attempt: the descriptor, the variant-specific state
///  and the handle of whatever I/O or timer is currently in flight. Events
///  are fed in by the handler; each returns a [Step] describing the outcome.
pub(crate) struct Attempt {
    pub id: ConnId,
    pub conn: ConnDescriptor,
    pub phase: Phase,
    budget: RetryBudget,
    variant: Variant,
    task: Option<JoinHandle<()>>,
}

impl Attempt {
    pub fn outgoing(id: ConnId, conn: ConnDescriptor) -> Attempt {
        let budget = RetryBudget::from_count(conn.options.retry_count);
        let variant = if conn.proxy.is_some() {
            Variant::Proxy(ProxyState::new())
        } else if conn.is_dns() {
            Variant::Dns(Dial::new())
        } else {
            Variant::Direct
        };
        Attempt {
            id,
            conn,
            phase: Phase::Scheduled,
            budget,
            variant,
            task: None,
        }
    }

    pub fn incoming(id: ConnId, listener_conn: ConnDescriptor, stream: TcpStream, peer_addr: SocketAddr) -> Attempt {
        Attempt {
            id,
            conn: listener_conn,
            phase: Phase::Scheduled,
            budget: RetryBudget::None,
            variant: Variant::Incoming(IncomingState::new(stream, peer_addr)),
            task: None,
        }
    }

    pub fn is_outgoing(&self) -> bool {
        !matches!(self.variant, Variant::Incoming(_))
    }

    /// Enters the attempt: spawns the first resolve/connect, or for an
    ///  incoming attempt wraps the already-accepted socket.
    pub fn connect(&mut self, events: &EventTx) -> Step {
        trace!(id = %self.id, conn = ?self.conn, "connect");
        match self.variant {
            Variant::Direct => direct::connect(self, events),
            Variant::Dns(_) => dns::connect(self, events),
            Variant::Proxy(_) => proxy::connect(self, events),
            Variant::Incoming(_) => incoming::connect(self),
        }
    }

    pub fn on_resolved(&mut self, addrs: Vec<SocketAddr>, events: &EventTx) -> Step {
        self.task = None;
        match self.variant {
            Variant::Dns(_) => dns::on_resolved(self, addrs, events),
            Variant::Proxy(_) => proxy::on_resolved(self, addrs, events),
            _ => Step::Continue,
        }
    }

    pub fn on_resolve_failed(&mut self, error: String, _events: &EventTx) -> Step {
        self.task = None;
        debug!(id = %self.id, conn = ?self.conn, "resolution failed: {}", error);
        let should_retry = self.budget.consume();
        Step::Failed {
            kind: FailureKind::Resolve,
            resolved: self.conn.clone(),
            should_retry,
        }
    }

    pub fn on_connect_finished(&mut self, result: std::io::Result<TcpStream>, events: &EventTx) -> Step {
        self.task = None;
        match self.variant {
            Variant::Direct => direct::on_connect_finished(self, result),
            Variant::Dns(_) => dns::on_connect_finished(self, result),
            Variant::Proxy(_) => proxy::on_connect_finished(self, result, events),
            Variant::Incoming(_) => Step::Continue,
        }
    }

    pub fn on_proxy_done(&mut self, result: anyhow::Result<TcpStream>) -> Step {
        self.task = None;
        match self.variant {
            Variant::Proxy(_) => proxy::on_proxy_done(self, result),
            _ => Step::Continue,
        }
    }

    /// Re-links the attempt under a fresh id and arms the retry timer; the
    ///  descriptor and any variant state (like a partially iterated address
    ///  list) carry over untouched.
    pub fn retry(&mut self, new_id: ConnId, events: &EventTx) {
        trace!(old = %self.id, new = %new_id, from = ?self.phase, "re-scheduling");
        self.cancel_task();
        self.id = new_id;
        self.phase = Phase::Scheduled;
        let delay = self.conn.options.retry_interval;
        self.task = Some(spawn_retry_timer(new_id, delay, events.clone()));
    }

    /// Releases everything in flight; the attempt is safe to drop afterwards.
    pub fn cancel(&mut self) {
        self.cancel_task();
        if let Variant::Incoming(state) = &mut self.variant {
            state.discard();
        }
    }

    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn set_task(&mut self, task: JoinHandle<()>) {
        self.cancel_task();
        self.task = Some(task);
    }

    fn consume_retry(&mut self) -> bool {
        self.budget.consume()
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.cancel_task();
    }
}

/// Opens a TCP connection with the configured timeout and reports back as an
///  event. TCP_NODELAY is applied to every successfully connected socket.
pub(crate) fn spawn_connect(id: ConnId, addr: SocketAddr, timeout: Duration, events: EventTx) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")),
        };
        if let Ok(stream) = &result {
            let _ = stream.set_nodelay(true);
        }
        let _ = events.send(LoopEvent::ConnectFinished { id, result });
    })
}

fn spawn_retry_timer(id: ConnId, delay: Duration, events: EventTx) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(LoopEvent::RetryTimer { id });
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_budget_from_count() {
        assert_eq!(RetryBudget::from_count(-1), RetryBudget::None);
        assert_eq!(RetryBudget::from_count(0), RetryBudget::Infinite);
        assert_eq!(RetryBudget::from_count(3), RetryBudget::Finite(3));
    }

    #[test]
    fn test_budget_consumption() {
        let mut budget = RetryBudget::None;
        assert!(!budget.consume());

        let mut budget = RetryBudget::Infinite;
        for _ in 0..1000 {
            assert!(budget.consume());
        }

        let mut budget = RetryBudget::Finite(2);
        assert!(budget.consume());
        assert!(budget.consume());
        // exhausted now, and it must stay exhausted
        assert!(!budget.consume());
        assert!(!budget.consume());
        assert_eq!(budget, RetryBudget::Finite(0));
    }
}
