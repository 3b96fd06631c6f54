use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::debug;

/// Retry `f` until it succeeds or `max_attempts` calls have failed.
///
/// Sleeps `delay` *before* every attempt after the first. The last error is
/// returned with `label` attached.
pub fn retry<F, T>(max_attempts: u32, delay: Duration, label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            thread::sleep(delay);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) => {
                debug!(attempt, max_attempts, error = %e, "{} not ready", label);
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| anyhow!("no attempts made"));
    Err(err.context(format!("{} failed after {} attempts", label, max_attempts)))
}
