use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
};

use crate::viaduct::{dialer::BoxedStream, telemetry};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Per-user-level timeouts for a tunneled session.
///
/// `idle_timeout` governs the session while both directions are open. Once
/// one half-stream finishes, the surviving half gets its own, typically
/// shorter, budget.
#[derive(Debug, Clone)]
pub struct Policy {
    pub idle_timeout: Duration,
    pub downlink_only_timeout: Duration,
    pub uplink_only_timeout: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            downlink_only_timeout: Duration::from_secs(5),
            uplink_only_timeout: Duration::from_secs(2),
        }
    }
}

/// Policies keyed by user level. Level 0 is the default for userless
/// sessions and for levels with no explicit entry.
#[derive(Debug, Default)]
pub struct PolicyStore {
    levels: HashMap<u32, Policy>,
}

impl PolicyStore {
    pub fn new(levels: HashMap<u32, Policy>) -> Self {
        Self { levels }
    }

    pub fn for_level(&self, level: u32) -> Policy {
        self.levels
            .get(&level)
            .or_else(|| self.levels.get(&0))
            .cloned()
            .unwrap_or_default()
    }
}

/// Activity-reset countdown shared by both copy directions.
///
/// `set_timeout(d)` means "cancel unless something happens within `d`".
#[derive(Debug)]
struct IdleTimer {
    last_activity_ms: AtomicU64,
    timeout_ms: AtomicU64,
    rearmed: tokio::sync::Notify,
}

impl IdleTimer {
    fn new(timeout: Duration) -> Self {
        Self {
            last_activity_ms: AtomicU64::new(telemetry::now_unix_ms()),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
            rearmed: tokio::sync::Notify::new(),
        }
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(telemetry::now_unix_ms(), Ordering::Relaxed);
    }

    /// Swaps in a new budget. The watchdog may be sleeping towards a longer
    /// deadline, so it gets kicked to re-read it.
    fn set_timeout(&self, d: Duration) {
        self.timeout_ms
            .store(d.as_millis() as u64, Ordering::Relaxed);
        self.touch();
        self.rearmed.notify_one();
    }

    /// Unix-ms instant at which the session becomes idle, 0 when disabled.
    fn deadline_ms(&self) -> u64 {
        let timeout = self.timeout_ms.load(Ordering::Relaxed);
        if timeout == 0 {
            return 0;
        }
        self.last_activity_ms.load(Ordering::Relaxed) + timeout
    }
}

async fn idle_watchdog(timer: Arc<IdleTimer>, cancel: watch::Sender<bool>) {
    loop {
        let deadline = timer.deadline_ms();
        if deadline == 0 {
            // Disabled until a later set_timeout re-arms it.
            timer.rearmed.notified().await;
            continue;
        }
        let now = telemetry::now_unix_ms();
        if now >= deadline {
            let _ = cancel.send(true);
            return;
        }
        tokio::select! {
            _ = timer.rearmed.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(deadline - now)) => {}
        }
    }
}

/// Shuttles bytes between the tunnel and the local stream until both
/// directions finish, the idle timer fires, or the caller cancels.
///
/// Uplink completion rearms the timer to `downlink_only_timeout`; downlink
/// completion rearms it to `uplink_only_timeout` and closes the local writer.
/// The tunnel is closed on every exit path. Non-EOF copy errors surface as
/// "connection ends".
pub async fn run(
    tunnel: BoxedStream,
    local: BoxedStream,
    policy: &Policy,
    parent_cancel: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let timer = Arc::new(IdleTimer::new(policy.idle_timeout));

    let watchdog = tokio::spawn(idle_watchdog(timer.clone(), cancel_tx.clone()));

    // Caller cancellation folds into the derived channel.
    let relay = tokio::spawn({
        let cancel_tx = cancel_tx.clone();
        let mut parent = parent_cancel;
        async move {
            loop {
                if *parent.borrow() {
                    let _ = cancel_tx.send(true);
                    return;
                }
                if parent.changed().await.is_err() {
                    return;
                }
            }
        }
    });

    let (mut tun_r, mut tun_w) = tokio::io::split(tunnel);
    let (mut loc_r, mut loc_w) = tokio::io::split(local);

    let uplink = async {
        let res = copy_with_activity(&mut loc_r, &mut tun_w, &timer, cancel_rx.clone()).await;
        if res.is_ok() {
            // Local side is done sending; pass the EOF through to the tunnel.
            let _ = tun_w.shutdown().await;
        }
        timer.set_timeout(policy.downlink_only_timeout);
        res
    };

    let downlink = async {
        let res = copy_with_activity(&mut tun_r, &mut loc_w, &timer, cancel_rx.clone()).await;
        timer.set_timeout(policy.uplink_only_timeout);
        let _ = loc_w.shutdown().await;
        res
    };

    let (up_res, down_res) = tokio::join!(uplink, downlink);

    watchdog.abort();
    relay.abort();

    let _ = tun_w.shutdown().await;

    let mut copy_err: Option<io::Error> = None;
    match up_res {
        Ok(n) => metrics::counter!("viaduct_bytes_uplink_total").increment(n),
        Err(err) => copy_err = Some(err),
    }
    match down_res {
        Ok(n) => metrics::counter!("viaduct_bytes_downlink_total").increment(n),
        Err(err) => {
            copy_err.get_or_insert(err);
        }
    }

    if let Some(err) = copy_err {
        return Err(err).context("connection ends");
    }
    Ok(())
}

async fn copy_with_activity<R, W>(
    r: &mut R,
    w: &mut W,
    timer: &IdleTimer,
    mut cancel: watch::Receiver<bool>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "session canceled"));
                }
            }
            res = r.read(&mut buf) => {
                let n = res?;
                if n == 0 {
                    return Ok(total);
                }
                w.write_all(&buf[..n]).await?;
                timer.touch();
                total += n as u64;
            }
        }
    }
}
