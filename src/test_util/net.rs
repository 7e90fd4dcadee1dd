use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::events::Framing;

/// Framing that hands every received chunk up as one frame; good enough for
///  tests that only care about the bytes arriving.
pub struct ChunkFraming;

impl Framing for ChunkFraming {
    fn decode(&self, buf: &mut BytesMut) -> anyhow::Result<Vec<Bytes>> {
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![buf.split().freeze()])
    }
}

/// A loopback server echoing every byte back, accepting any number of peers.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let (mut read_half, mut write_half) = stream.split();
                let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
            });
        }
    });
    addr
}

/// Accepts one connection, reads it to EOF and reports how many bytes made
///  it across.
pub async fn sink_server() -> (SocketAddr, oneshot::Receiver<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else { return };
        let mut total = 0usize;
        let mut buf = [0u8; 64 * 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
        let _ = tx.send(total);
    });
    (addr, rx)
}

/// Accepts connections and drops them immediately; the client sees a clean
///  remote close right after establishing.
pub async fn accept_and_drop_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            drop(stream);
        }
    });
    addr
}

/// A SOCKS5 stub that reads the greeting and replies with a method the
///  client never offered, failing every handshake. Counts connects so tests
///  can observe retries.
pub async fn socks_method_reject_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let mut greeting = [0u8; 3];
            if stream.read_exact(&mut greeting).await.is_ok() {
                let _ = stream.write_all(&[0x05, 0x01]).await;
            }
        }
    });
    (addr, connects)
}

/// An address that nothing is listening on; connecting to it gets refused.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A bound listener that tests drive themselves, plus its address.
pub async fn unused_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}
