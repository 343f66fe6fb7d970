//! Background DTL probe
//!
//! Walks the degraded volumes on an interval and asks each to reattach its
//! configured peer. A successful probe moves the volume through Ketchup
//! while the backlog drains and back to Ok.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::DtlState;

/// What the checker needs from a volume
#[async_trait]
pub trait DtlProbe: Send + Sync {
    /// Current DTL state
    fn dtl_state(&self) -> DtlState;

    /// Try to reattach the configured peer and drain the backlog
    async fn reattach_dtl(&self);
}

/// Periodic prober of degraded volumes
pub struct DtlChecker {
    handle: tokio::task::JoinHandle<()>,
}

impl DtlChecker {
    /// Spawn the checker over a provider of probe targets
    pub fn spawn<F>(interval: Duration, targets: F) -> Self
    where
        F: Fn() -> Vec<Arc<dyn DtlProbe>> + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for probe in targets() {
                    if probe.dtl_state() == DtlState::Degraded {
                        probe.reattach_dtl().await;
                    }
                }
            }
        });
        Self { handle }
    }

    /// Stop probing
    pub fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProbe {
        state: Mutex<DtlState>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl DtlProbe for FakeProbe {
        fn dtl_state(&self) -> DtlState {
            *self.state.lock()
        }

        async fn reattach_dtl(&self) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = DtlState::Ok(crate::dtl::DtlMode::Synchronous);
        }
    }

    #[tokio::test]
    async fn degraded_volume_is_reattached() {
        let probe = Arc::new(FakeProbe {
            state: Mutex::new(DtlState::Degraded),
            attempts: AtomicUsize::new(0),
        });
        let target = Arc::clone(&probe);
        let checker = DtlChecker::spawn(Duration::from_millis(10), move || {
            vec![Arc::clone(&target) as Arc<dyn DtlProbe>]
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        checker.stop();

        assert_eq!(probe.attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(probe.dtl_state(), DtlState::Ok(_)));
    }
}
