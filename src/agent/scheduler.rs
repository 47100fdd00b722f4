use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Fixed-interval cycle timer with optional jitter
///
/// Cycles never overlap: the next interval only starts counting once the
/// previous cycle has returned.
pub struct CycleScheduler {
    base_interval: Duration,
    jitter_range: Duration,
}

impl CycleScheduler {
    /// Create a new cycle scheduler
    ///
    /// # Arguments
    /// * `interval_secs` - Seconds between the end of one cycle and the start of the next
    /// * `jitter_secs` - Maximum extra delay added to each interval
    pub fn new(interval_secs: u64, jitter_secs: u64) -> Self {
        Self {
            base_interval: Duration::from_secs(interval_secs),
            jitter_range: Duration::from_secs(jitter_secs),
        }
    }

    /// Sleep until the next cycle, waking early on shutdown
    ///
    /// Returns `true` when shutdown was requested.
    pub async fn wait_for_next_cycle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return true;
        }

        let sleep_duration = self.calculate_next_interval();
        tracing::info!(
            "Cycle complete. Sleeping {}s until next cycle",
            sleep_duration.as_secs()
        );

        let sleeper = sleep(sleep_duration);
        tokio::pin!(sleeper);

        let signalled = tokio::select! {
            _ = &mut sleeper => false,
            changed = shutdown.changed() => changed.is_ok(),
        };

        // A dropped sender can no longer signal; serve out the full interval
        if !signalled {
            sleeper.await;
        }

        *shutdown.borrow()
    }

    /// Calculate the next cycle start (current time + interval + jitter)
    pub fn next_cycle_time(&self) -> DateTime<Utc> {
        let sleep_duration = self.calculate_next_interval();
        Utc::now() + chrono::Duration::from_std(sleep_duration).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Calculate the next sleep interval with jitter
    fn calculate_next_interval(&self) -> Duration {
        self.base_interval + self.random_jitter()
    }

    /// Generate random jitter in range [0, jitter_range]
    fn random_jitter(&self) -> Duration {
        if self.jitter_range.is_zero() {
            return Duration::ZERO;
        }
        let jitter_secs = rand::thread_rng().gen_range(0..=self.jitter_range.as_secs());
        Duration::from_secs(jitter_secs)
    }
}
