//! Counter backend health probe
//!
//! One background task pings the counter backend on a fixed interval and
//! keeps a single healthy/unhealthy bit the admission path reads lock-free.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout};

use crate::counter::PendingCounter;

pub struct CounterHealthProbe {
    counter: Arc<dyn PendingCounter>,
    healthy: AtomicBool,
    check_interval: Duration,
    check_timeout: Duration,
}

impl CounterHealthProbe {
    pub fn new(
        counter: Arc<dyn PendingCounter>,
        check_interval: Duration,
        check_timeout: Duration,
    ) -> Self {
        Self {
            counter,
            // Optimistic until the first probe says otherwise.
            healthy: AtomicBool::new(true),
            check_interval,
            check_timeout,
        }
    }

    /// Lock-free read for the admission hot path.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Run one probe and update the bit. Transitions are logged once.
    pub async fn check_now(&self) {
        let healthy = matches!(timeout(self.check_timeout, self.counter.ping()).await, Ok(Ok(())));
        let was_healthy = self.healthy.swap(healthy, Ordering::SeqCst);

        if healthy && !was_healthy {
            log::info!("counter backend is back online");
        } else if !healthy && was_healthy {
            log::warn!("counter backend is down, admissions will take the fallback path");
        }
    }

    /// Probe loop with graceful shutdown.
    pub async fn run_with_shutdown(&self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "health probe started (interval={}ms, timeout={}ms)",
            self.check_interval.as_millis(),
            self.check_timeout.as_millis()
        );

        let mut ticker = interval(self.check_interval);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    log::info!("health probe received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    self.check_now().await;
                }
            }
        }

        log::info!("health probe stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MemoryPendingCounter;

    fn probe(counter: Arc<MemoryPendingCounter>) -> CounterHealthProbe {
        CounterHealthProbe::new(counter, Duration::from_millis(10), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_starts_healthy() {
        let counter = Arc::new(MemoryPendingCounter::new());
        assert!(probe(counter).is_healthy());
    }

    #[tokio::test]
    async fn test_flips_on_outage_and_recovery() {
        let counter = Arc::new(MemoryPendingCounter::new());
        let probe = probe(counter.clone());

        counter.set_available(false);
        probe.check_now().await;
        assert!(!probe.is_healthy());

        counter.set_available(true);
        probe.check_now().await;
        assert!(probe.is_healthy());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let counter = Arc::new(MemoryPendingCounter::new());
        let probe = Arc::new(CounterHealthProbe::new(
            counter,
            Duration::from_millis(5),
            Duration::from_millis(50),
        ));

        let (tx, rx) = watch::channel(false);
        let task = {
            let probe = probe.clone();
            tokio::spawn(async move { probe.run_with_shutdown(rx).await })
        };

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
