//! Polling primitive for "wait until predicate" sites
//!
//! Every blocking wait in the control plane (revision readiness, partition
//! completion, pod deletion) expresses its condition as a probe; the loop,
//! bounded retries, and cancellation live here.

use comp_core::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Poll `probe` every `interval` until it yields a value.
///
/// The probe returns `Ok(Some(value))` when the condition holds,
/// `Ok(None)` to keep waiting, and `Err` to abort immediately. With a
/// `timeout` the wait fails with [`Error::Timeout`] once the deadline
/// passes; without one it only ends on success, probe error, or
/// cancellation ([`Error::Canceled`]).
pub async fn wait_until<T, F, Fut>(
    interval: Duration,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        if cancel.is_cancelled() {
            return Err(Error::canceled("wait aborted by shutdown"));
        }

        if let Some(value) = probe().await? {
            return Ok(value);
        }

        if let Some(deadline) = deadline {
            if Instant::now() + interval > deadline {
                return Err(Error::timeout(format!(
                    "condition not met within {:?}",
                    timeout.unwrap_or_default()
                )));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::canceled("wait aborted by shutdown")),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
