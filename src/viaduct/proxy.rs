use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};

use crate::viaduct::{
    dialer::Dialer,
    net::{self, Destination},
    outbound,
    telemetry,
};

/// One local forward listener: every accepted connection is tunneled to
/// `target` through the shared outbound client.
pub struct ForwardHandlerOptions {
    pub target: Destination,
    pub client: Arc<outbound::Client>,
    pub dialer: Arc<dyn Dialer>,
    pub sessions: telemetry::SharedSessions,
}

pub async fn serve_tcp_with_shutdown(
    listen_addr: &str,
    opts: Arc<ForwardHandlerOptions>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, target = %opts.target, "tcp: listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let o = opts.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "tcp: accepted");
                    }
                    handle_forward(conn, o, shutdown).await;
                });
            }
        }
    }

    Ok(())
}

async fn handle_forward(
    conn: TcpStream,
    opts: Arc<ForwardHandlerOptions>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let sid = telemetry::new_session_id();
    let client_addr = conn.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let target = opts.target.to_string();

    metrics::counter!("viaduct_connections_total", "target" => target.clone()).increment(1);
    metrics::gauge!("viaduct_active_connections").increment(1.0);

    opts.sessions.add(telemetry::SessionInfo {
        id: sid.clone(),
        client: client_addr.clone(),
        target,
        started_at_unix_ms: telemetry::now_unix_ms(),
    });

    let req = outbound::OutboundRequest {
        target: opts.target.clone(),
        stream: Box::new(conn),
        cancel: shutdown,
        dialer: opts.dialer.clone(),
    };

    if let Err(err) = opts.client.process(req).await {
        tracing::debug!(sid = %sid, client = %client_addr, err = %err, "proxy: session ended with error");
    }

    opts.sessions.remove(&sid);
    metrics::gauge!("viaduct_active_connections").decrement(1.0);
}
