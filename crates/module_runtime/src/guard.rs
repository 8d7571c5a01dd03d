//! Panic containment for everything executed on a module loop or worker thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::warn;

/// Runs `f`, turning a panic into its message.
pub(crate) fn run_guarded<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(&*payload))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Logs executions that took longer than `threshold`. A zero threshold disables it.
pub(crate) fn warn_if_slow(
    module: &str,
    kind: &str,
    label: &str,
    started: Instant,
    threshold: Duration,
) {
    if threshold.is_zero() {
        return;
    }
    let elapsed = started.elapsed();
    if elapsed > threshold {
        warn!(
            module,
            kind,
            label,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow execution on module loop"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        let err = run_guarded(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(err, "boom 7");

        let err = run_guarded(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(err, "non-string panic payload");

        assert_eq!(run_guarded(|| 5).unwrap(), 5);
    }
}
