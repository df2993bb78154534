use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Called with the pace label, the elapsed timeframe and the steps counted in it.
pub type PaceReporter = Box<dyn Fn(&str, Duration, u64) + Send + Sync>;

///
/// Counts steps and hands the sum to a reporter once per interval,
/// resetting the count each time.
///
pub struct Pace {
    label: String,
    interval: Duration,
    value: AtomicU64,
    last_report: Mutex<Instant>,
    reporter: PaceReporter,
}

impl Pace {
    pub fn new(label: impl Into<String>, interval: Duration, reporter: PaceReporter) -> Self {
        Self {
            label: label.into(),
            interval,
            value: AtomicU64::new(0),
            last_report: Mutex::new(Instant::now()),
            reporter,
        }
    }

    pub fn step(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Flushes the current count to the reporter.
    pub fn report(&self) {
        let now = Instant::now();
        let timeframe = {
            let mut last = self
                .last_report
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let timeframe = now.duration_since(*last);
            *last = now;
            timeframe
        };
        let value = self.value.swap(0, Ordering::Relaxed);
        (self.reporter)(&self.label, timeframe, value);
    }

    /// Reports every interval until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.report(),
                }
            }
        })
    }
}

/// Rate of `value` over `timeframe`, in units per second.
pub fn per_second(timeframe: Duration, value: u64) -> f64 {
    let secs = timeframe.as_secs_f64();
    if secs > 0.0 {
        value as f64 / secs
    } else {
        0.0
    }
}

/// Reporter writing the pace to the log.
pub fn tracing_reporter() -> PaceReporter {
    Box::new(|label, timeframe, value| {
        info!(
            label,
            value,
            timeframe_secs = timeframe.as_secs(),
            "(Pace) {}: {:.2}/s",
            label,
            per_second(timeframe, value)
        );
    })
}
