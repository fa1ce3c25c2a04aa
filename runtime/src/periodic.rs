//! Fixed-period background jobs with panic isolation.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use waiting_room_core::Result;

/// Run `job` every `period` until `shutdown` flips to `true`.
///
/// Each run executes in its own task, so a failing or panicking run is
/// logged and the schedule continues with the next tick. A run that
/// overlaps the next tick delays it rather than piling up.
pub async fn run_periodic<J, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: J,
) where
    J: FnMut() -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        job = name,
        period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        "Periodic job started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                match tokio::spawn(job()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(job = name, error = ?e, "Periodic job run failed"),
                    Err(e) if e.is_panic() => {
                        tracing::error!(job = name, "Periodic job run panicked");
                    }
                    Err(e) => tracing::warn!(job = name, error = %e, "Periodic job run cancelled"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(job = name, "Periodic job stopped");
}
