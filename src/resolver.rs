use std::net::SocketAddr;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::attempt::RetryBudget;
use crate::descriptor::{AddrFamily, ConnDescriptor};
use crate::events::ConnId;
use crate::handler::loop_event::{EventTx, LoopEvent};

async fn lookup(host: &str, port: u16, family: AddrFamily) -> anyhow::Result<Vec<SocketAddr>> {
    let addrs = tokio::net::lookup_host((host, port))
        .await?
        .filter(|addr| family.matches(addr))
        .collect::<Vec<_>>();
    if addrs.is_empty() {
        anyhow::bail!("no addresses for {} (family {:?})", host, family);
    }
    Ok(addrs)
}

/// Resolves for a pending connection attempt; the result feeds back into its
///  state machine as a Resolved / ResolveFailed event.
pub(crate) fn spawn_resolve(id: ConnId, host: String, port: u16, family: AddrFamily, events: EventTx) -> JoinHandle<()> {
    tokio::spawn(async move {
        trace!(%id, "resolving {}", host);
        let event = match lookup(&host, port, family).await {
            Ok(addrs) => LoopEvent::Resolved { id, addrs },
            Err(e) => LoopEvent::ResolveFailed { id, error: e.to_string() },
        };
        let _ = events.send(event);
    })
}

fn spawn_resolve_only(id: ConnId, host: String, port: u16, family: AddrFamily, events: EventTx) -> JoinHandle<()> {
    tokio::spawn(async move {
        trace!(%id, "resolving {} (resolve-only)", host);
        let event = match lookup(&host, port, family).await {
            Ok(addrs) => LoopEvent::ResolveOnlyDone { id, addrs },
            Err(e) => LoopEvent::ResolveOnlyFailed { id, error: e.to_string() },
        };
        let _ = events.send(event);
    })
}

/// A resolution request with no connect attached: it delivers its addresses
///  to the application and exits. Unlike connect attempts, a retry keeps the
///  same id - the record stays where it is and re-resolves after the
///  configured interval.
pub(crate) struct ResolveOnly {
    pub conn: ConnDescriptor,
    budget: RetryBudget,
    task: Option<JoinHandle<()>>,
}

impl ResolveOnly {
    pub fn new(conn: ConnDescriptor) -> ResolveOnly {
        let budget = RetryBudget::from_count(conn.options.retry_count);
        ResolveOnly {
            conn,
            budget,
            task: None,
        }
    }

    pub fn resolve(&mut self, id: ConnId, events: &EventTx) {
        self.cancel();
        self.task = Some(spawn_resolve_only(
            id,
            self.conn.host.clone(),
            self.conn.port,
            self.conn.options.family,
            events.clone(),
        ));
    }

    pub fn consume_retry(&mut self) -> bool {
        self.budget.consume()
    }

    pub fn arm_retry(&mut self, id: ConnId, events: &EventTx) {
        self.cancel();
        debug!(%id, "re-resolving {:?} in {:?}", self.conn, self.conn.options.retry_interval);
        let delay = self.conn.options.retry_interval;
        let events = events.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(LoopEvent::RetryTimer { id });
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ResolveOnly {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_lookup_localhost() {
        let addrs = lookup("localhost", 8333, AddrFamily::Any).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 8333));
        assert!(addrs.iter().all(|a| a.ip().is_loopback()));
    }

    #[tokio::test]
    async fn test_lookup_family_filter() {
        let addrs = lookup("127.0.0.1", 1, AddrFamily::Ipv6).await;
        assert!(addrs.is_err(), "a v4 literal has no v6 addresses");

        let addrs = lookup("127.0.0.1", 1, AddrFamily::Ipv4).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:1".parse().unwrap()]);
    }
}
