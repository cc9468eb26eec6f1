use std::{future::Future, time::Duration};

/// Runs `f` up to `attempts` times, sleeping `base_delay` between attempts and
/// doubling the delay after each failure. Returns the first success or the
/// last error once attempts are exhausted. Retries are invisible to `f`.
pub async fn exponential<T, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    mut f: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = base_delay;
    let mut last_err = None;

    for attempt in 1..=attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if attempt < attempts {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(
                            attempt,
                            err = %err,
                            backoff = %humantime::format_duration(delay),
                            "retry: attempt failed"
                        );
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry: zero attempts requested")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn first_success_short_circuits() {
        let calls = AtomicU32::new(0);
        let v = exponential(2, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(7)
        })
        .await
        .unwrap();
        assert_eq!(v, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_attempt_can_recover() {
        let calls = AtomicU32::new(0);
        let v = exponential(2, Duration::from_millis(1), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient");
            }
            Ok(42)
        })
        .await
        .unwrap();
        assert_eq!(v, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let err = exponential(2, Duration::from_millis(1), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("boom {n}"))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.to_string().contains("boom 1"));
    }
}
