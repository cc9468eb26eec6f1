use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use pin_project_lite::pin_project;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::viaduct::dialer::{BoxedStream, Dialer};
use crate::viaduct::net::Destination;
use crate::viaduct::outbound::OutboundError;
use crate::viaduct::outbound::h2 as h2conn;
use crate::viaduct::outbound::picker::UserCredential;
use crate::viaduct::outbound::rewrite;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// A prepared CONNECT request, before protocol-specific encoding.
#[derive(Debug, Clone)]
pub(crate) struct ConnectRequest {
    pub target: Destination,
    /// HTTP/1.1 request-target; normally `host:port`, but the WAP masquerade
    /// writes an opaque form here.
    pub request_target: String,
    /// `Host:` header value for the HTTP/1.1 encoding.
    pub host: String,
    pub headers: Vec<(String, String)>,
    /// Marks a request built for the t5-auth upstreams; the serialized bytes
    /// get the sentinel substitution before hitting the wire.
    pub t5: bool,
}

/// Builds the CONNECT request for `target` as `upstream` expects to see it:
/// credentials, branded headers and masquerades keyed off the upstream
/// identity.
pub(crate) fn prepare_request(
    upstream: &Destination,
    target: &Destination,
    user: Option<&UserCredential>,
) -> ConnectRequest {
    let mut headers = Vec::new();
    if let Some(u) = user {
        let creds = BASE64.encode(format!("{}:{}", u.username, u.password));
        headers.push(("Proxy-Authorization".to_string(), format!("Basic {creds}")));
    }

    let mut request_target = target.authority();
    let mut host = target.authority();
    let mut t5 = false;

    if rewrite::is_t5_upstream(&upstream.host) {
        headers.push(("User-Agent".to_string(), rewrite::T5_USER_AGENT.to_string()));
        headers.push((
            rewrite::T5_AUTH_HEADER.to_string(),
            rewrite::T5_AUTH_SENTINEL.to_string(),
        ));
        t5 = true;
    } else if rewrite::is_wap_upstream(&upstream.host) {
        host = rewrite::WAP_MASQUERADE_HOST.to_string();
        request_target = format!(
            "{}:Host:{}",
            target.authority(),
            rewrite::WAP_MASQUERADE_HOST
        );
    }

    ConnectRequest {
        target: target.clone(),
        request_target,
        host,
        headers,
        t5,
    }
}

pub(crate) fn serialize_http1(req: &ConnectRequest) -> String {
    let mut out = String::with_capacity(256);
    out.push_str(&format!("CONNECT {} HTTP/1.1\r\n", req.request_target));
    out.push_str(&format!("Host: {}\r\n", req.host));
    for (k, v) in &req.headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("Proxy-Connection: Keep-Alive\r\n\r\n");
    out
}

/// The h2 encoding: authority-form URI, no Host header, and the sentinel
/// already resolved to its token (there is no serialized text to rewrite on
/// this path).
fn h2_request(req: &ConnectRequest) -> anyhow::Result<http::Request<()>> {
    let uri: http::Uri = req
        .target
        .authority()
        .parse()
        .with_context(|| format!("invalid CONNECT authority {}", req.target))?;

    let mut builder = http::Request::builder().method(http::Method::CONNECT).uri(uri);
    for (k, v) in &req.headers {
        if req.t5 && k == rewrite::T5_AUTH_HEADER {
            builder = builder.header(k.as_str(), rewrite::auth_token(&req.target.host));
        } else {
            builder = builder.header(k.as_str(), v.as_str());
        }
    }
    builder.body(()).context("build h2 CONNECT request")
}

/// An established tunnel, tagged by negotiated protocol.
///
/// The tag matters to the caller: an HTTP/1.1 tunnel still owes the first
/// payload, while the HTTP/2 flow already carried it in the request body.
pub(crate) enum Tunnel {
    Http1(BoxedStream),
    Http2(h2conn::H2Tunnel),
}

impl Tunnel {
    pub fn into_stream(self) -> BoxedStream {
        match self {
            Tunnel::Http1(s) => s,
            Tunnel::Http2(t) => Box::new(t),
        }
    }
}

/// Establishes a tunnel to `target` through `upstream`.
///
/// A cached multiplexed client with spare capacity is preferred; a reuse
/// failure surfaces as-is, without falling back to a fresh dial. Otherwise
/// the upstream is dialed and the negotiated ALPN picks the sub-flow; a
/// successful fresh h2 negotiation overwrites the cache slot.
pub(crate) async fn negotiate(
    upstream: &Destination,
    target: &Destination,
    user: Option<&UserCredential>,
    dialer: &dyn Dialer,
    first_payload: &[u8],
    cache: &h2conn::H2ConnCache,
) -> anyhow::Result<Tunnel> {
    let req = prepare_request(upstream, target, user);
    let key = upstream.authority();

    if let Some(sender) = cache.ready_sender(&key).await {
        let tunnel = h2conn::connect_via(sender, h2_request(&req)?, first_payload).await?;
        return Ok(Tunnel::Http2(tunnel));
    }

    let conn = dialer
        .dial(upstream)
        .await
        .with_context(|| format!("dial upstream {upstream}"))?;

    let alpn = conn.alpn_str().to_string();
    match alpn.as_str() {
        "" | "http/1.1" => {
            let stream = http1_connect(conn.stream, &req).await?;
            Ok(Tunnel::Http1(stream))
        }
        "h2" => {
            let sender = h2conn::handshake(conn.stream, &key).await?;
            let tunnel = h2conn::connect_via(sender.clone(), h2_request(&req)?, first_payload).await?;
            cache.insert(key, sender).await;
            Ok(Tunnel::Http2(tunnel))
        }
        other => Err(OutboundError::UnsupportedAlpn(other.to_string()).into()),
    }
}

/// HTTP/1.1 sub-flow: write the (possibly rewritten) request, read exactly
/// one response head, hand back the raw transport on 200.
///
/// Bytes read past the head belong to the tunnel (the target may speak
/// first) and are stitched back in front of the returned stream.
async fn http1_connect(mut stream: BoxedStream, req: &ConnectRequest) -> anyhow::Result<BoxedStream> {
    let mut wire = serialize_http1(req);
    if req.t5 {
        wire = rewrite::rewrite_t5_request(&wire);
    }

    stream
        .write_all(wire.as_bytes())
        .await
        .context("write CONNECT request")?;
    stream.flush().await.context("flush CONNECT request")?;

    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut tmp = [0u8; 2048];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            anyhow::bail!("proxy response headers too long");
        }
        let n = stream
            .read(&mut tmp)
            .await
            .context("read CONNECT response")?;
        if n == 0 {
            anyhow::bail!("unexpected eof reading CONNECT response");
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let status = parse_status_line(&buf[..head_end])?;
    if status != 200 {
        return Err(OutboundError::ProxyStatus(status).into());
    }

    let remainder = buf.split_off(head_end + 4);
    if remainder.is_empty() {
        Ok(stream)
    } else {
        Ok(Box::new(PrependedStream {
            prefix: Bytes::from(remainder),
            inner: stream,
        }))
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(head: &[u8]) -> anyhow::Result<u16> {
    let line = head
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or_default();
    let line = std::str::from_utf8(line).context("proxy response is not valid HTTP")?;
    if !line.starts_with("HTTP/") {
        anyhow::bail!("malformed proxy response status line {line:?}");
    }
    line.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed proxy response status line {line:?}"))
}

pin_project! {
    /// A stream with response-head over-read stitched back in front.
    struct PrependedStream {
        prefix: Bytes,
        #[pin]
        inner: BoxedStream,
    }
}

impl tokio::io::AsyncRead for PrependedStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return std::task::Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for PrependedStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, data)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
