//! Blocking operation helper
//!
//! Adapts an asynchronous controller operation into a synchronous call. The
//! caller supplies a step that pumps the host and reports whether the
//! operation is still outstanding; between steps the thread sleeps on the
//! pump signal, so an IRQ ends the sleep early. On timeout nothing is
//! cancelled: whatever flags the controller left set stay set.

use crate::error::{Result, UsbhError};
use crate::pump::PumpSignal;
use std::time::{Duration, Instant};
use tracing::trace;

/// Run `step` until it reports completion or `timeout` passes
///
/// `step` returns `true` while the operation is still pending. It always runs
/// at least once, even with a zero timeout.
pub fn wait_while<F>(timeout: Duration, slice: Duration, signal: &PumpSignal, mut step: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if !step() {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            trace!("Blocking wait gave up after {:?}", timeout);
            return Err(UsbhError::Timeout(timeout));
        }
        signal.wait(slice.min(deadline - now));
    }
}

/// Suspending variant of [`wait_while`] for async callers
///
/// Yields to the runtime between steps instead of parking the thread.
#[cfg(feature = "async")]
pub async fn wait_while_async<F>(timeout: Duration, slice: Duration, mut step: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let polling = async {
        while step() {
            tokio::time::sleep(slice).await;
        }
    };

    tokio::time::timeout(timeout, polling)
        .await
        .map_err(|_| UsbhError::Timeout(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_when_step_clears() {
        let signal = PumpSignal::new();
        let mut remaining = 3;
        let result = wait_while(Duration::from_secs(1), Duration::from_millis(1), &signal, || {
            remaining -= 1;
            remaining > 0
        });
        assert!(result.is_ok());
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_times_out_with_bound() {
        let signal = PumpSignal::new();
        let timeout = Duration::from_millis(10);
        let start = Instant::now();
        let result = wait_while(timeout, Duration::from_millis(1), &signal, || true);
        assert_eq!(result, Err(UsbhError::Timeout(timeout)));
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn test_zero_timeout_still_steps_once() {
        let signal = PumpSignal::new();
        let mut calls = 0;
        let result = wait_while(Duration::ZERO, Duration::from_millis(1), &signal, || {
            calls += 1;
            false
        });
        assert!(result.is_ok());
        assert_eq!(calls, 1);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_async_times_out() {
        let timeout = Duration::from_millis(10);
        let result = wait_while_async(timeout, Duration::from_millis(1), || true).await;
        assert_eq!(result, Err(UsbhError::Timeout(timeout)));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_async_completes() {
        let mut remaining = 2;
        let result = wait_while_async(Duration::from_secs(1), Duration::from_millis(1), || {
            remaining -= 1;
            remaining > 0
        })
        .await;
        assert!(result.is_ok());
    }
}
