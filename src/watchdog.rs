//! Recovery timer for stalled peer-to-peer discovery.
//!
//! Some Wi-Fi P2P stacks stop reporting services without any error. While
//! armed, the watchdog fires once per period until a service-found event
//! disarms it. It is polled from the controller's event loop, so arming,
//! disarming and firing all happen on one task.

use std::future;
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::warn;

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(120_000);

pub struct RestartWatchdog {
    period: Duration,
    timer: Option<Interval>,
}

impl RestartWatchdog {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            timer: None,
        }
    }

    /// Schedules the timer, first fire one period from now. Returns false
    /// and leaves the running timer untouched if already armed.
    pub fn arm(&mut self) -> bool {
        if self.timer.is_some() {
            return false;
        }

        warn!(period_ms = self.period.as_millis() as u64, "Starting discovery stall watchdog");
        let mut timer = time::interval_at(Instant::now() + self.period, self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);
        true
    }

    /// Cancels the timer. Returns whether it was armed.
    pub fn disarm(&mut self) -> bool {
        if self.timer.take().is_some() {
            warn!("Stopped discovery stall watchdog");
            return true;
        }
        false
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Resolves at the next fire. Never resolves while disarmed.
    ///
    /// Cancel safe, so it can sit in a `select!` next to the event inbox.
    pub async fn fired(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => {
                timer.tick().await;
            }
            None => future::pending::<()>().await,
        }
    }
}

impl Default for RestartWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_each_full_period() {
        let mut watchdog = RestartWatchdog::new(Duration::from_secs(120));
        assert!(watchdog.arm());

        let start = Instant::now();
        watchdog.fired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(120));
        watchdog.fired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(240));
        assert!(watchdog.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn arming_twice_keeps_the_original_schedule() {
        let mut watchdog = RestartWatchdog::new(Duration::from_secs(120));
        let start = Instant::now();
        assert!(watchdog.arm());

        time::advance(Duration::from_secs(60)).await;
        assert!(!watchdog.arm());

        watchdog.fired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_watchdog_never_fires() {
        let mut watchdog = RestartWatchdog::new(Duration::from_secs(120));
        watchdog.arm();
        assert!(watchdog.disarm());
        assert!(!watchdog.disarm());

        let fired = time::timeout(Duration::from_secs(600), watchdog.fired()).await;
        assert!(fired.is_err());
    }
}
