use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::viaduct::{
    admin, config,
    dialer::{Dialer, TcpDialer, TlsDialer, TlsDialerOptions},
    logging, net, outbound,
    outbound::picker::{ServerSpec, UserCredential},
    proxy, session, telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let proxy_enabled = !cfg.listeners.is_empty();
    let admin_enabled = !cfg.admin_addr.trim().is_empty() && proxy_enabled;

    if !proxy_enabled {
        anyhow::bail!("config: nothing to run (set listeners and servers)");
    }

    tracing::info!(
        config = %resolved.path.display(),
        admin_addr = %cfg.admin_addr,
        listeners = cfg.listeners.len(),
        servers = cfg.servers.len(),
        tls = cfg.transport.tls.is_some(),
        "viaduct: starting"
    );

    // Shared state for admin endpoints.
    let prom = Arc::new(telemetry::init_prometheus()?);
    let sessions = Arc::new(telemetry::SessionRegistry::new());

    let dialer = build_dialer(&cfg.transport)?;
    let client = Arc::new(build_client(&cfg)?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    // Admin server.
    if admin_enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            sessions: sessions.clone(),
            config_path: resolved.path.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Forward listeners.
    for l in &cfg.listeners {
        let listen_addr = l.listen_addr.clone();
        let opts = Arc::new(proxy::ForwardHandlerOptions {
            target: l.target.clone(),
            client: client.clone(),
            dialer: dialer.clone(),
            sessions: sessions.clone(),
        });
        let shutdown = shutdown_rx.clone();

        tasks.spawn(async move { proxy::serve_tcp_with_shutdown(&listen_addr, opts, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async {
        while let Some(_res) = tasks.join_next().await {
            // Best-effort: tasks are expected to observe shutdown; ignore errors during teardown.
        }
    };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn build_dialer(transport: &config::TransportConfig) -> anyhow::Result<Arc<dyn Dialer>> {
    match &transport.tls {
        Some(tls) => {
            let d = TlsDialer::new(
                transport.dial_timeout,
                TlsDialerOptions {
                    server_name: tls.server_name.clone(),
                    insecure_skip_verify: tls.insecure_skip_verify,
                    alpn: tls.alpn.clone(),
                    ca_file: tls.ca_file.clone(),
                },
            )
            .context("build TLS dialer")?;
            Ok(Arc::new(d))
        }
        None => Ok(Arc::new(TcpDialer::new(transport.dial_timeout))),
    }
}

fn build_client(cfg: &config::Config) -> anyhow::Result<outbound::Client> {
    let servers = cfg
        .servers
        .iter()
        .map(|s| {
            ServerSpec::new(
                net::Destination::tcp(s.address.clone(), s.port),
                s.users
                    .iter()
                    .map(|u| UserCredential {
                        username: u.username.clone(),
                        password: u.password.clone(),
                        level: u.level,
                    })
                    .collect(),
            )
        })
        .collect();

    let mut levels = HashMap::new();
    for p in &cfg.policies {
        levels.insert(
            p.level,
            session::Policy {
                idle_timeout: p.idle_timeout,
                downlink_only_timeout: p.downlink_only_timeout,
                uplink_only_timeout: p.uplink_only_timeout,
            },
        );
    }

    outbound::Client::new(servers, session::PolicyStore::new(levels))
}

/// Resolves once the process is asked to stop: Ctrl-C everywhere, plus
/// SIGTERM on unix so container runtimes get a clean drain.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable, Ctrl-C only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
