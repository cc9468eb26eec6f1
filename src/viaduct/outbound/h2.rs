use std::{
    collections::HashMap,
    io,
    pin::Pin,
    task::{Context as TaskContext, Poll},
};

use anyhow::Context;
use bytes::Bytes;
use futures_util::FutureExt;
use h2::{RecvStream, SendStream, client::SendRequest};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::viaduct::dialer::BoxedStream;
use crate::viaduct::outbound::OutboundError;

/// Per-chunk ceiling for request-body frames written through the tunnel.
const WRITE_CHUNK: usize = 16 * 1024;

/// Cached multiplexed clients, one slot per upstream destination.
///
/// The slot owns the client handle; the connection task owns the transport.
/// Staleness is not tracked eagerly: it is detected by the capacity probe at
/// the next reuse, and a later dial-path success simply overwrites the slot.
pub(crate) struct H2ConnCache {
    entries: tokio::sync::Mutex<HashMap<String, H2Entry>>,
}

struct H2Entry {
    sender: SendRequest<Bytes>,
}

impl H2ConnCache {
    pub fn new() -> Self {
        Self {
            entries: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns a ready clone of the cached client for `key` if it can take a
    /// new request right now. The probe is a single non-blocking poll; no
    /// I/O happens under the lock.
    pub async fn ready_sender(&self, key: &str) -> Option<SendRequest<Bytes>> {
        let entries = self.entries.lock().await;
        let e = entries.get(key)?;
        match e.sender.clone().ready().now_or_never() {
            Some(Ok(sender)) => Some(sender),
            // Errored (connection gone) or at capacity: bypass and redial.
            _ => None,
        }
    }

    pub async fn insert(&self, key: String, sender: SendRequest<Bytes>) {
        let mut entries = self.entries.lock().await;
        entries.insert(key, H2Entry { sender });
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Runs the h2 preface over a freshly dialed transport and detaches the
/// connection driver. The returned handle multiplexes all future tunnels to
/// this upstream.
pub(crate) async fn handshake(io: BoxedStream, upstream: &str) -> anyhow::Result<SendRequest<Bytes>> {
    let (sender, connection) = h2::client::handshake(io)
        .await
        .with_context(|| format!("h2 handshake with {upstream}"))?;

    let upstream = upstream.to_string();
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(upstream = %upstream, err = %err, "outbound: h2 connection ended");
            }
        }
    });

    Ok(sender)
}

/// Opens one CONNECT tunnel over a multiplexed client.
///
/// The first payload goes out as the opening request-body frame; h2's
/// connection task pumps it concurrently with the round trip, and a write
/// error fails the negotiation before the response status is consulted.
pub(crate) async fn connect_via(
    sender: SendRequest<Bytes>,
    request: http::Request<()>,
    first_payload: &[u8],
) -> anyhow::Result<H2Tunnel> {
    let mut sender = sender.ready().await.context("h2 client not ready")?;

    let (response, mut send_stream) = sender
        .send_request(request, false)
        .context("h2 send CONNECT")?;

    if !first_payload.is_empty() {
        send_stream
            .send_data(Bytes::copy_from_slice(first_payload), false)
            .context("h2 write first payload")?;
    }

    let response = response.await.context("h2 CONNECT round trip")?;
    if response.status() != http::StatusCode::OK {
        return Err(OutboundError::ProxyStatus(response.status().as_u16()).into());
    }

    Ok(H2Tunnel {
        send: send_stream,
        recv: response.into_body(),
        rbuf: Bytes::new(),
    })
}

/// One CONNECT tunnel scoped to a single h2 stream: reads drain the response
/// body, writes feed the request body. Shutting down ends the request body;
/// dropping either half resets the stream, so close is safe from both copy
/// tasks.
pub struct H2Tunnel {
    send: SendStream<Bytes>,
    recv: RecvStream,
    rbuf: Bytes,
}

fn h2_io_err(err: h2::Error) -> io::Error {
    io::Error::other(err)
}

impl AsyncRead for H2Tunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.rbuf.is_empty() {
                let n = this.rbuf.len().min(buf.remaining());
                buf.put_slice(&this.rbuf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match this.recv.poll_data(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    this.rbuf = data;
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(h2_io_err(err))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for H2Tunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.send.reserve_capacity(buf.len().min(WRITE_CHUNK));
        loop {
            match this.send.poll_capacity(cx) {
                Poll::Ready(Some(Ok(0))) => continue,
                Poll::Ready(Some(Ok(cap))) => {
                    let n = cap.min(buf.len());
                    this.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_io_err)?;
                    return Poll::Ready(Ok(n));
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(h2_io_err(err))),
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "h2 stream closed",
                    )));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        // The connection task flushes frames as they are queued.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        // End the request body; tolerate an already-reset stream.
        let _ = self.get_mut().send.send_data(Bytes::new(), true);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;

    /// CONNECT-terminating h2 upstream that echoes tunnel bytes back.
    async fn serve_h2_echo(ln: TcpListener, accepts: Arc<AtomicUsize>) {
        loop {
            let (sock, _) = match ln.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            accepts.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut conn = h2::server::handshake(sock).await.unwrap();
                while let Some(res) = conn.accept().await {
                    let (req, mut respond) = res.unwrap();
                    tokio::spawn(async move {
                        assert_eq!(req.method(), http::Method::CONNECT);
                        let mut body = req.into_body();
                        let resp = http::Response::builder().status(200).body(()).unwrap();
                        let mut send = respond.send_response(resp, false).unwrap();
                        while let Some(chunk) = poll_fn(|cx| body.poll_data(cx)).await {
                            let chunk = chunk.unwrap();
                            let _ = body.flow_control().release_capacity(chunk.len());
                            send.send_data(chunk, false).unwrap();
                        }
                        let _ = send.send_data(Bytes::new(), true);
                    });
                }
            });
        }
    }

    fn connect_request(authority: &str) -> http::Request<()> {
        http::Request::builder()
            .method(http::Method::CONNECT)
            .uri(authority)
            .body(())
            .unwrap()
    }

    #[tokio::test]
    async fn tunnel_round_trips_first_payload_and_later_writes() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve_h2_echo(ln, accepts.clone()));

        let sock = TcpStream::connect(addr).await.unwrap();
        let sender = handshake(Box::new(sock), "test").await.unwrap();

        let mut tunnel = connect_via(sender, connect_request("1.2.3.4:443"), b"HELLO")
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO");

        tunnel.write_all(b"WORLD").await.unwrap();
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"WORLD");

        tunnel.shutdown().await.unwrap();
        let n = tunnel.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn cache_reuses_one_connection_per_destination() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve_h2_echo(ln, accepts.clone()));

        let cache = H2ConnCache::new();
        let key = "proxy.test:443".to_string();

        assert!(cache.ready_sender(&key).await.is_none());

        let sock = TcpStream::connect(addr).await.unwrap();
        let sender = handshake(Box::new(sock), &key).await.unwrap();
        cache.insert(key.clone(), sender).await;
        assert_eq!(cache.len().await, 1);

        // Two tunnels off the cached client, one TCP connection underneath.
        for payload in [&b"AAAA"[..], &b"BBBB"[..]] {
            let sender = cache.ready_sender(&key).await.expect("cached client ready");
            let mut tunnel = connect_via(sender, connect_request("t:1"), payload)
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            tunnel.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, payload);
            tunnel.shutdown().await.unwrap();
        }

        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);

        // Replacing the slot keeps at most one entry per destination.
        let sock = TcpStream::connect(addr).await.unwrap();
        let sender = handshake(Box::new(sock), &key).await.unwrap();
        cache.insert(key.clone(), sender).await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn dead_connection_is_bypassed_on_probe() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        // Server that accepts the preface and immediately hangs up.
        tokio::spawn(async move {
            let (sock, _) = ln.accept().await.unwrap();
            let conn = h2::server::handshake(sock).await.unwrap();
            drop(conn);
        });

        let cache = H2ConnCache::new();
        let sock = TcpStream::connect(addr).await.unwrap();
        let sender = handshake(Box::new(sock), "dead").await.unwrap();
        cache.insert("dead:443".into(), sender).await;

        // Give the connection task a moment to observe the close.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(cache.ready_sender("dead:443").await.is_none());
    }
}
