use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Start-if-idle flag for an async operation.
///
/// A second caller while one is in flight gets `None` from [`try_begin`]
/// and is not queued; it may [`wait_idle`] for the running one instead.
///
/// [`try_begin`]: InFlight::try_begin
/// [`wait_idle`]: InFlight::wait_idle
#[derive(Debug, Default)]
pub struct InFlight {
    busy: AtomicBool,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flight: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Resolves once nothing is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a guard dropped in between still wakes us.
            notified.as_mut().enable();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }
}

/// Clears the flag on every exit path, including unwinding and cancellation.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a InFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.busy.store(false, Ordering::Release);
        self.flight.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_second_begin_rejected_until_guard_dropped() {
        let flight = InFlight::new();
        let guard = flight.try_begin();
        assert!(guard.is_some());
        assert!(flight.is_busy());
        assert!(flight.try_begin().is_none());

        drop(guard);
        assert!(!flight.is_busy());
        assert!(flight.try_begin().is_some());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_at_once_when_idle() {
        let flight = InFlight::new();
        tokio::time::timeout(Duration::from_millis(100), flight.wait_idle())
            .await
            .expect("idle flight should not block");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_resumes_when_guard_dropped() {
        let flight = InFlight::new();
        let guard = flight.try_begin().unwrap();
        let started = tokio::time::Instant::now();

        let (waited, ()) = tokio::join!(
            async {
                flight.wait_idle().await;
                tokio::time::Instant::now()
            },
            async {
                tokio::time::sleep(Duration::from_millis(250)).await;
                drop(guard);
            }
        );

        assert!(!flight.is_busy());
        assert_eq!(waited.duration_since(started), Duration::from_millis(250));
        assert!(flight.try_begin().is_some());
    }
}
