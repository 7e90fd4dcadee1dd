use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::debug;

use crate::attempt::{spawn_connect, Attempt, FailureKind, Phase, Step, Variant};
use crate::descriptor::ResolveMode;
use crate::handler::loop_event::EventTx;
use crate::resolver;

/// The resolved address list and the position of the address currently being
///  tried. Every resolved address is an independent candidate: iterating to
///  the next one does not consume an outer retry, only a resolve failure or
///  running off the end of the list does.
pub(crate) struct Dial {
    resolved: Vec<SocketAddr>,
    next_ix: usize,
}

impl Dial {
    pub fn new() -> Dial {
        Dial {
            resolved: Vec::new(),
            next_ix: 0,
        }
    }

    pub fn needs_resolve(&self) -> bool {
        self.next_ix >= self.resolved.len()
    }

    pub fn set(&mut self, addrs: Vec<SocketAddr>) {
        self.resolved = addrs;
        self.next_ix = 0;
    }

    pub fn current(&self) -> Option<SocketAddr> {
        self.resolved.get(self.next_ix).copied()
    }

    /// True while there are more addresses to try.
    pub fn advance(&mut self) -> bool {
        self.next_ix += 1;
        self.next_ix < self.resolved.len()
    }

    pub fn reset(&mut self) {
        self.resolved.clear();
        self.next_ix = 0;
    }
}

fn dial_of(attempt: &mut Attempt) -> &mut Dial {
    match &mut attempt.variant {
        Variant::Dns(dial) => dial,
        _ => unreachable!("dns event fed into a non-dns attempt"),
    }
}

pub(super) fn connect(attempt: &mut Attempt, events: &EventTx) -> Step {
    if dial_of(attempt).needs_resolve() {
        if attempt.conn.options.resolve_mode == ResolveMode::NoResolve {
            // numeric-host only: a name that did not parse as a literal has
            // no addresses to offer
            debug!(id = %attempt.id, "{:?} is not numeric and resolution is disabled", attempt.conn);
            let should_retry = attempt.consume_retry();
            return Step::Failed {
                kind: FailureKind::Resolve,
                resolved: attempt.conn.clone(),
                should_retry,
            };
        }
        dial_of(attempt).reset();
        attempt.phase = Phase::Resolving;
        let task = resolver::spawn_resolve(
            attempt.id,
            attempt.conn.host.clone(),
            attempt.conn.port,
            attempt.conn.options.family,
            events.clone(),
        );
        attempt.set_task(task);
        Step::Continue
    } else {
        connect_current(attempt, events)
    }
}

pub(super) fn on_resolved(attempt: &mut Attempt, addrs: Vec<SocketAddr>, events: &EventTx) -> Step {
    if addrs.is_empty() {
        let should_retry = attempt.consume_retry();
        return Step::Failed {
            kind: FailureKind::Resolve,
            resolved: attempt.conn.clone(),
            should_retry,
        };
    }
    debug!(id = %attempt.id, "{:?} resolved to {} addresses", attempt.conn, addrs.len());
    dial_of(attempt).set(addrs);
    connect_current(attempt, events)
}

pub(super) fn on_connect_finished(attempt: &mut Attempt, result: std::io::Result<TcpStream>) -> Step {
    let addr = dial_of(attempt)
        .current()
        .expect("connect completion without a current address");
    let resolved = attempt.conn.resolved_from(addr);

    match result {
        Ok(stream) => Step::Established { stream, resolved },
        Err(e) => {
            debug!(id = %attempt.id, "connect to resolved {} failed: {}", addr, e);
            if dial_of(attempt).advance() {
                Step::NextAddress { resolved }
            } else {
                // the whole list is exhausted: one outer retry pays for the
                // re-resolve on the next connect
                dial_of(attempt).reset();
                let should_retry = attempt.consume_retry();
                Step::Failed {
                    kind: FailureKind::Connect,
                    resolved,
                    should_retry,
                }
            }
        }
    }
}

fn connect_current(attempt: &mut Attempt, events: &EventTx) -> Step {
    let addr = dial_of(attempt).current().expect("no address to connect to");
    attempt.phase = Phase::Connecting;
    let task = spawn_connect(attempt.id, addr, attempt.conn.options.initial_timeout, events.clone());
    attempt.set_task(task);
    Step::Continue
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;

    use crate::descriptor::{ConnDescriptor, ConnOptions};
    use crate::events::ConnId;
    use crate::handler::loop_event::LoopEvent;
    use crate::test_util::{refused_addr, unused_listener};

    use super::*;

    fn dns_attempt(retry_count: i32) -> Attempt {
        let mut options = ConnOptions::default();
        options.retry_count = retry_count;
        Attempt::outgoing(ConnId(1), ConnDescriptor::new("peer.example", 1).with_options(options))
    }

    async fn next_connect_result(rx: &mut mpsc::UnboundedReceiver<LoopEvent>) -> std::io::Result<TcpStream> {
        match rx.recv().await {
            Some(LoopEvent::ConnectFinished { result, .. }) => result,
            _ => panic!("expected a connect completion"),
        }
    }

    #[tokio::test]
    async fn test_iteration_does_not_consume_retries() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut attempt = dns_attempt(1);

        let a = refused_addr().await;
        let b = refused_addr().await;

        // first pass: A fails but B is still in the list, so this is address
        // iteration - same attempt, budget untouched
        assert!(matches!(attempt.on_resolved(vec![a, b], &tx), Step::Continue));
        let result = next_connect_result(&mut rx).await;
        assert!(result.is_err());
        match attempt.on_connect_finished(result, &tx) {
            Step::NextAddress { resolved } => assert_eq!(resolved.host, a.ip().to_string()),
            _ => panic!("expected address iteration"),
        }

        // B fails too: the list is exhausted, which consumes the one retry
        assert!(matches!(attempt.connect(&tx), Step::Continue));
        let result = next_connect_result(&mut rx).await;
        match attempt.on_connect_finished(result, &tx) {
            Step::Failed { kind: FailureKind::Connect, should_retry, .. } => assert!(should_retry),
            _ => panic!("expected failure"),
        }

        // second pass over the same addresses: the budget is gone now
        assert!(matches!(attempt.on_resolved(vec![a, b], &tx), Step::Continue));
        let result = next_connect_result(&mut rx).await;
        assert!(matches!(attempt.on_connect_finished(result, &tx), Step::NextAddress { .. }));

        assert!(matches!(attempt.connect(&tx), Step::Continue));
        let result = next_connect_result(&mut rx).await;
        match attempt.on_connect_finished(result, &tx) {
            Step::Failed { should_retry, .. } => assert!(!should_retry, "budget must be exhausted"),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_second_address_connects() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut attempt = dns_attempt(2);

        let a = refused_addr().await;
        let (listener, b) = unused_listener().await;
        let _accepting = tokio::spawn(async move {
            let _ = listener.accept().await;
            std::future::pending::<()>().await;
        });

        assert!(matches!(attempt.on_resolved(vec![a, b], &tx), Step::Continue));
        let result = next_connect_result(&mut rx).await;
        assert!(matches!(attempt.on_connect_finished(result, &tx), Step::NextAddress { .. }));

        assert!(matches!(attempt.connect(&tx), Step::Continue));
        let result = next_connect_result(&mut rx).await;
        match attempt.on_connect_finished(result, &tx) {
            Step::Established { resolved, .. } => {
                assert_eq!(resolved.host, b.ip().to_string());
                assert_eq!(resolved.port, b.port());
            }
            _ => panic!("expected the second address to connect"),
        }
    }

    #[tokio::test]
    async fn test_empty_resolution_is_a_resolve_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut attempt = dns_attempt(-1);
        match attempt.on_resolved(Vec::new(), &tx) {
            Step::Failed { kind: FailureKind::Resolve, should_retry, .. } => assert!(!should_retry),
            _ => panic!("expected resolve failure"),
        }
    }
}
