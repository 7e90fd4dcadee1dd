use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::attempt::{spawn_connect, Attempt, Dial, FailureKind, Phase, Step, Variant};
use crate::descriptor::{ConnDescriptor, ProxyAuth};
use crate::events::ConnId;
use crate::handler::loop_event::{EventTx, LoopEvent};
use crate::resolver;

/// Dialing state for the proxy endpoint itself; the handshake that follows
///  names the original destination, which the proxy resolves remotely.
pub(crate) struct ProxyState {
    dial: Dial,
}

impl ProxyState {
    pub fn new() -> ProxyState {
        ProxyState { dial: Dial::new() }
    }
}

fn state_of(attempt: &mut Attempt) -> &mut ProxyState {
    match &mut attempt.variant {
        Variant::Proxy(state) => state,
        _ => unreachable!("proxy event fed into a non-proxy attempt"),
    }
}

fn proxy_desc(attempt: &Attempt) -> ConnDescriptor {
    match &attempt.conn.proxy {
        Some(proxy) => (**proxy).clone(),
        None => unreachable!("proxy attempt without a proxy descriptor"),
    }
}

pub(super) fn connect(attempt: &mut Attempt, events: &EventTx) -> Step {
    if !state_of(attempt).dial.needs_resolve() {
        return connect_current(attempt, events);
    }

    let proxy = proxy_desc(attempt);
    match proxy.literal_addr() {
        Some(addr) => {
            state_of(attempt).dial.set(vec![addr]);
            connect_current(attempt, events)
        }
        None => {
            state_of(attempt).dial.reset();
            attempt.phase = Phase::Resolving;
            let task = resolver::spawn_resolve(
                attempt.id,
                proxy.host.clone(),
                proxy.port,
                proxy.options.family,
                events.clone(),
            );
            attempt.set_task(task);
            Step::Continue
        }
    }
}

pub(super) fn on_resolved(attempt: &mut Attempt, addrs: Vec<SocketAddr>, events: &EventTx) -> Step {
    if addrs.is_empty() {
        let should_retry = attempt.consume_retry();
        return Step::Failed {
            kind: FailureKind::Resolve,
            resolved: proxy_desc(attempt),
            should_retry,
        };
    }
    state_of(attempt).dial.set(addrs);
    connect_current(attempt, events)
}

pub(super) fn on_connect_finished(attempt: &mut Attempt, result: std::io::Result<TcpStream>, events: &EventTx) -> Step {
    let addr = state_of(attempt)
        .dial
        .current()
        .expect("connect completion without a current proxy address");

    match result {
        Ok(stream) => {
            attempt.phase = Phase::HandshakingProxy;
            let proxy = proxy_desc(attempt);
            let task = spawn_handshake(
                attempt.id,
                stream,
                attempt.conn.host.clone(),
                attempt.conn.port,
                proxy.auth,
                attempt.conn.options.initial_timeout,
                events.clone(),
            );
            attempt.set_task(task);
            Step::Continue
        }
        Err(e) => {
            debug!(id = %attempt.id, "connect to proxy {} failed: {}", addr, e);
            let resolved = proxy_desc(attempt).resolved_from(addr);
            if state_of(attempt).dial.advance() {
                Step::NextAddress { resolved }
            } else {
                state_of(attempt).dial.reset();
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

pub(super) fn on_proxy_done(attempt: &mut Attempt, result: anyhow::Result<TcpStream>) -> Step {
    match result {
        Ok(stream) => Step::Established {
            stream,
            // the proxy performed the remote-end resolution, so the original
            // descriptor is the most precise answer available
            resolved: attempt.conn.clone(),
        },
        Err(e) => {
            debug!(id = %attempt.id, "proxy handshake for {:?} failed: {}", attempt.conn, e);
            let should_retry = attempt.consume_retry();
            Step::Failed {
                kind: FailureKind::Proxy,
                resolved: attempt.conn.clone(),
                should_retry,
            }
        }
    }
}

fn connect_current(attempt: &mut Attempt, events: &EventTx) -> Step {
    let addr = state_of(attempt).dial.current().expect("no proxy address to connect to");
    attempt.phase = Phase::Connecting;
    let task = spawn_connect(attempt.id, addr, attempt.conn.options.initial_timeout, events.clone());
    attempt.set_task(task);
    Step::Continue
}

fn spawn_handshake(
    id: ConnId,
    stream: TcpStream,
    host: String,
    port: u16,
    auth: Option<ProxyAuth>,
    timeout: Duration,
    events: EventTx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = match tokio::time::timeout(timeout, socks5_handshake(stream, &host, port, auth.as_ref())).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("proxy handshake timed out")),
        };
        let _ = events.send(LoopEvent::ProxyDone { id, result });
    })
}

/// Drives the SOCKS5 handshake: greeting, optional RFC 1929 username/password
///  sub-negotiation, then the connect request naming the destination.
async fn socks5_handshake(mut stream: TcpStream, host: &str, port: u16, auth: Option<&ProxyAuth>) -> anyhow::Result<TcpStream> {
    if auth.is_some() {
        stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
    } else {
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
    }

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method[0] != 0x05 {
        bail!("not a socks5 proxy");
    }
    match method[1] {
        0x00 => {}
        0x02 => {
            let auth = auth.ok_or_else(|| anyhow!("proxy requires credentials"))?;
            let user = auth.username.as_bytes();
            let pass = auth.password.as_bytes();
            if user.len() > 255 || pass.len() > 255 {
                bail!("credentials too long for socks5");
            }
            let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
            msg.push(0x01);
            msg.push(user.len() as u8);
            msg.extend_from_slice(user);
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass);
            stream.write_all(&msg).await?;

            let mut reply = [0u8; 2];
            stream.read_exact(&mut reply).await?;
            if reply[1] != 0x00 {
                bail!("proxy rejected the credentials");
            }
        }
        m => bail!("proxy selected unsupported auth method {:#04x}", m),
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.len() > 255 {
                bail!("hostname too long for socks5");
            }
            request.push(0x03);
            request.push(name.len() as u8);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != 0x05 {
        bail!("malformed socks5 reply");
    }
    if head[1] != 0x00 {
        bail!("proxy refused the connection (reply code {:#04x})", head[1]);
    }
    let bind_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => bail!("malformed socks5 bind address type {:#04x}", other),
    };
    let mut bind = vec![0u8; bind_len + 2];
    stream.read_exact(&mut bind).await?;

    Ok(stream)
}

#[cfg(test)]
mod test {
    use tokio::net::TcpListener;

    use super::*;

    /// A stub proxy scripted at the byte level: reads what the client is
    ///  expected to send, answers from the script.
    async fn stub_proxy(listener: TcpListener, script: Vec<(usize, Vec<u8>)>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        for (expect_len, reply) in script {
            let mut buf = vec![0u8; expect_len];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&reply).await.unwrap();
        }
        // hold the socket open so the client side stays usable
        std::future::pending::<()>().await;
    }

    async fn proxy_fixture(script: Vec<(usize, Vec<u8>)>) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(stub_proxy(listener, script));
        TcpStream::connect(addr).await.unwrap()
    }

    #[tokio::test]
    async fn test_handshake_with_domain_target() {
        // greeting (3 bytes), then connect request: 4 header + 1 len +
        // 12 name + 2 port
        let stream = proxy_fixture(vec![
            (3, vec![0x05, 0x00]),
            (4 + 1 + 12 + 2, vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]),
        ])
        .await;

        let result = socks5_handshake(stream, "peer.example", 8333, None).await;
        assert!(result.is_ok(), "{:?}", result.err());
    }

    #[tokio::test]
    async fn test_handshake_with_credentials() {
        let stream = proxy_fixture(vec![
            (4, vec![0x05, 0x02]),
            // 1 + 1 + 4 ("user") + 1 + 4 ("pass")
            (11, vec![0x01, 0x00]),
            (4 + 1 + 4 + 2, vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]),
        ])
        .await;

        let auth = ProxyAuth {
            username: "user".into(),
            password: "pass".into(),
        };
        let result = socks5_handshake(stream, "10.0.0.1", 8333, Some(&auth)).await;
        assert!(result.is_ok(), "{:?}", result.err());
    }

    #[tokio::test]
    async fn test_unsupported_method_fails() {
        let stream = proxy_fixture(vec![(3, vec![0x05, 0x01])]).await;
        let result = socks5_handshake(stream, "10.0.0.1", 8333, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_nonzero_reply_code_fails() {
        let stream = proxy_fixture(vec![
            (3, vec![0x05, 0x00]),
            (4 + 4 + 2, vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]),
        ])
        .await;
        let result = socks5_handshake(stream, "10.0.0.1", 8333, None).await;
        assert!(result.is_err());
    }
}
