pub mod picker;
pub mod retry;
pub mod rewrite;

pub(crate) mod h2;
pub(crate) mod negotiate;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
    time,
};

use crate::viaduct::dialer::{BoxedStream, Dialer};
use crate::viaduct::net::{Destination, Network};
use crate::viaduct::session::{self, PolicyStore};

/// How long the first-payload read waits before negotiating with an empty
/// payload. Kept short: server-speaks-first targets (e.g. MySQL) send
/// nothing, and this delay sits on every connection's critical path.
pub(crate) const FIRST_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(100);

const FIRST_PAYLOAD_BUFFER: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("no target address or non-TCP target")]
    InvalidTarget,
    #[error("no upstream servers configured")]
    NoServer,
    #[error("negotiated unsupported application layer protocol: {0}")]
    UnsupportedAlpn(String),
    #[error("Proxy responded with non 200 code: {0}")]
    ProxyStatus(u16),
}

/// One outbound connection request: where to go, the local payload stream,
/// the caller's cancellation handle and the transport capability to dial
/// with.
pub struct OutboundRequest {
    pub target: Destination,
    pub stream: BoxedStream,
    pub cancel: watch::Receiver<bool>,
    pub dialer: Arc<dyn Dialer>,
}

/// The outbound HTTP-tunneling client.
///
/// Holds the process-wide shared state: the round-robin upstream picker, the
/// per-level policies and the HTTP/2 connection cache. One instance serves
/// all listeners.
pub struct Client {
    picker: picker::ServerPicker,
    policies: PolicyStore,
    h2_cache: h2::H2ConnCache,
}

impl Client {
    pub fn new(servers: Vec<picker::ServerSpec>, policies: PolicyStore) -> anyhow::Result<Self> {
        Ok(Self {
            picker: picker::ServerPicker::new(servers)?,
            policies,
            h2_cache: h2::H2ConnCache::new(),
        })
    }

    /// Tunnels one request: picks an upstream (with retry), negotiates the
    /// CONNECT, then pumps bytes until the session ends.
    pub async fn process(&self, req: OutboundRequest) -> anyhow::Result<()> {
        if req.target.network != Network::Tcp {
            return Err(OutboundError::InvalidTarget.into());
        }
        let OutboundRequest {
            target,
            stream: mut local,
            cancel,
            dialer,
        } = req;

        let first_payload = read_first_payload(&mut local)
            .await
            .context("read first payload")?;

        let (tunnel, level) = retry::exponential(2, Duration::from_millis(100), || async {
            metrics::counter!("viaduct_tunnel_attempts_total").increment(1);

            let server = self.picker.pick();
            let user = server.pick_user();
            let mut tunnel = negotiate::negotiate(
                &server.dest,
                &target,
                user,
                dialer.as_ref(),
                &first_payload,
                &self.h2_cache,
            )
            .await?;

            // The HTTP/1.1 flow returns right after the CONNECT response;
            // the captured payload still has to lead the tunnel. The h2 flow
            // already carried it in the request body.
            if let negotiate::Tunnel::Http1(stream) = &mut tunnel {
                if !first_payload.is_empty() {
                    stream
                        .write_all(&first_payload)
                        .await
                        .context("write first payload to tunnel")?;
                }
            }

            Ok((tunnel, user.map(|u| u.level).unwrap_or(0)))
        })
        .await
        .context("failed to find an available destination")?;

        let policy = self.policies.for_level(level);
        session::run(tunnel.into_stream(), local, &policy, cancel).await
    }
}

/// Grabs up to one buffer of 0-RTT payload from the local stream.
///
/// Nothing arriving within the window is normal (the target protocol may be
/// server-speaks-first); only a genuine read error is one.
async fn read_first_payload(stream: &mut BoxedStream) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; FIRST_PAYLOAD_BUFFER];
    match time::timeout(FIRST_PAYLOAD_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(buf)
        }
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(Vec::new()),
    }
}
