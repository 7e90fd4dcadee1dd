use tokio::net::TcpStream;
use tracing::debug;

use crate::attempt::{spawn_connect, Attempt, FailureKind, Phase, Step};
use crate::handler::loop_event::EventTx;

pub(super) fn connect(attempt: &mut Attempt, events: &EventTx) -> Step {
    match attempt.conn.literal_addr() {
        Some(addr) => {
            attempt.phase = Phase::Connecting;
            let task = spawn_connect(attempt.id, addr, attempt.conn.options.initial_timeout, events.clone());
            attempt.set_task(task);
            Step::Continue
        }
        None => {
            debug!(id = %attempt.id, "not a literal address: {:?}", attempt.conn);
            let should_retry = attempt.consume_retry();
            Step::Failed {
                kind: FailureKind::Connect,
                resolved: attempt.conn.clone(),
                should_retry,
            }
        }
    }
}

pub(super) fn on_connect_finished(attempt: &mut Attempt, result: std::io::Result<TcpStream>) -> Step {
    match result {
        Ok(stream) => Step::Established {
            stream,
            resolved: attempt.conn.clone(),
        },
        Err(e) => {
            debug!(id = %attempt.id, "connect to {:?} failed: {}", attempt.conn, e);
            let should_retry = attempt.consume_retry();
            Step::Failed {
                kind: FailureKind::Connect,
                resolved: attempt.conn.clone(),
                should_retry,
            }
        }
    }
}
