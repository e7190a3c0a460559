use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::handle::ManagerState;

/// Expiry is re-checked at least this often even when the renewal date is
/// far away, guarding against clock jumps and long suspends.
const RECHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const RETRY_BASE_SECS: u64 = 60;
const RETRY_CEILING_SECS: u64 = 3600;

/// Background loop that renews the certificate when it comes due.
///
/// Sleeps until the earlier of the renewal date and the 24 h re-check tick;
/// after a failed attempt it backs off from 1 minute doubling to 1 hour.
/// Setting the shutdown flag ends the loop; an in-flight attempt finishes
/// first.
pub(crate) fn spawn(
    state: Arc<ManagerState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        loop {
            let delay = if failures > 0 {
                retry_delay(failures)
            } else {
                next_check_delay(state.renew_at(), OffsetDateTime::now_utc())
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("auto-renewal stopped");
                        break;
                    }
                }
                () = tokio::time::sleep(delay) => {
                    match state.check_for_renewal().await {
                        Ok(renewed) => {
                            if renewed {
                                info!("scheduled renewal completed");
                            }
                            failures = 0;
                        }
                        Err(err) => {
                            failures += 1;
                            error!(
                                "certificate renewal failed (attempt {failures}, retrying in {}s): {err}",
                                retry_delay(failures).as_secs()
                            );
                        }
                    }
                }
            }
        }
    })
}

/// 1 min, 2 min, 4 min, ... capped at 1 h.
fn retry_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(6);
    Duration::from_secs((RETRY_BASE_SECS << exponent).min(RETRY_CEILING_SECS))
}

fn next_check_delay(renew_at: OffsetDateTime, now: OffsetDateTime) -> Duration {
    let until = Duration::try_from(renew_at - now).unwrap_or(Duration::ZERO);
    until.min(RECHECK_INTERVAL)
}
