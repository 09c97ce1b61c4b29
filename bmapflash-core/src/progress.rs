//! Throttled progress reporting shared by the write and verify phases.
use std::time::{Duration, Instant};

/// Default minimum time between two progress notifications.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// A snapshot of an operation's progress, passed to progress callbacks.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressState {
    /// Bytes processed so far.
    pub transferred: u64,
    /// Bytes the operation will process in total.
    pub total: u64,
    /// `transferred / total` in percent; 100 when `total` is zero.
    pub percentage: f64,
    /// Time since the accumulator was created.
    pub elapsed: Duration,
    /// Estimated time remaining, once anything has been transferred.
    pub eta: Option<Duration>,
    /// Average throughput in bytes per second.
    pub speed: f64,
}

impl ProgressState {
    fn compute(transferred: u64, total: u64, elapsed: Duration) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            (transferred as f64 * 100.0 / total as f64).min(100.0)
        };
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 { transferred as f64 / secs } else { 0.0 };
        let eta = (transferred > 0).then(|| {
            let remaining = total.saturating_sub(transferred);
            elapsed.mul_f64(remaining as f64 / transferred as f64)
        });

        ProgressState {
            transferred,
            total,
            percentage,
            elapsed,
            eta,
            speed,
        }
    }
}

/// Accumulates transferred bytes and notifies `callback` at most once per
/// `interval`.
///
/// A tick that lands inside the throttle window leaves a notification
/// pending; [`Progress::stop`] delivers it before returning, so the final
/// callback always reflects the final byte count.
pub struct Progress<F>
where
    F: FnMut(&ProgressState),
{
    total: u64,
    transferred: u64,
    interval: Duration,
    started: Instant,
    last_notified: Option<Instant>,
    pending: bool,
    callback: F,
}

impl<F> Progress<F>
where
    F: FnMut(&ProgressState),
{
    pub fn new(total: u64, interval: Duration, callback: F) -> Self {
        Self {
            total,
            transferred: 0,
            interval,
            started: Instant::now(),
            last_notified: None,
            pending: false,
            callback,
        }
    }

    /// Records `bytes` more bytes as processed.
    pub fn tick(&mut self, bytes: u64) {
        self.transferred += bytes;
        let now = Instant::now();
        let window_elapsed = self
            .last_notified
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if window_elapsed {
            self.notify(now);
        } else {
            self.pending = true;
        }
    }

    /// Returns `true` while a throttled notification has not been delivered.
    #[cfg(test)]
    fn is_pending(&self) -> bool {
        self.pending
    }

    fn state(&self) -> ProgressState {
        ProgressState::compute(self.transferred, self.total, self.started.elapsed())
    }

    /// Delivers any pending notification and returns the final state.
    ///
    /// Consumes the accumulator; no notification can follow it.
    pub fn stop(mut self) -> ProgressState {
        if self.pending {
            self.notify(Instant::now());
        }
        self.state()
    }

    fn notify(&mut self, now: Instant) {
        self.pending = false;
        self.last_notified = Some(now);
        let state =
            ProgressState::compute(self.transferred, self.total, now.duration_since(self.started));
        (self.callback)(&state);
    }
}
