//! Sliding windows of recent call outcomes.
//!
//! - [`SlidingWindow::count`]: ring of the last N outcomes. Recording the (N+1)th outcome evicts
//!   the oldest.
//! - [`SlidingWindow::time`]: ring of one-second buckets covering the last N seconds. Buckets
//!   older than the window are excluded from snapshots and reused as time moves on.
//!
//! Both keep running totals, so a snapshot of a count window is O(1) and a snapshot of a time
//! window is O(N) in the number of buckets.

use std::time::Duration;

/// One recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    SlowSuccess,
    SlowFailure,
}

impl Outcome {
    pub fn from_call(failed: bool, slow: bool) -> Self {
        match (failed, slow) {
            (false, false) => Outcome::Success,
            (true, false) => Outcome::Failure,
            (false, true) => Outcome::SlowSuccess,
            (true, true) => Outcome::SlowFailure,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Failure | Outcome::SlowFailure)
    }

    pub fn is_slow(self) -> bool {
        matches!(self, Outcome::SlowSuccess | Outcome::SlowFailure)
    }
}

/// Aggregated view of the calls currently in a window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Snapshot {
    pub total_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub slow_failed_calls: u32,
    pub total_duration: Duration,
}

impl Snapshot {
    /// Failed calls as a percentage of all calls; 0 for an empty window.
    pub fn failure_rate(&self) -> f32 {
        percentage(self.failed_calls, self.total_calls)
    }

    /// Slow calls as a percentage of all calls; 0 for an empty window.
    pub fn slow_call_rate(&self) -> f32 {
        percentage(self.slow_calls, self.total_calls)
    }

    pub fn successful_calls(&self) -> u32 {
        self.total_calls - self.failed_calls
    }

    pub fn average_duration(&self) -> Duration {
        if self.total_calls == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.total_calls
        }
    }
}

fn percentage(part: u32, total: u32) -> f32 {
    if total == 0 {
        0.0
    } else {
        part as f32 * 100.0 / total as f32
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    total: u32,
    failed: u32,
    slow: u32,
    slow_failed: u32,
    duration: Duration,
}

impl Tally {
    fn add(&mut self, outcome: Outcome, duration: Duration) {
        self.total += 1;
        self.duration += duration;
        if outcome.is_failure() {
            self.failed += 1;
        }
        if outcome.is_slow() {
            self.slow += 1;
        }
        if outcome == Outcome::SlowFailure {
            self.slow_failed += 1;
        }
    }

    fn remove(&mut self, outcome: Outcome, duration: Duration) {
        self.total = self.total.saturating_sub(1);
        self.duration = self.duration.saturating_sub(duration);
        if outcome.is_failure() {
            self.failed = self.failed.saturating_sub(1);
        }
        if outcome.is_slow() {
            self.slow = self.slow.saturating_sub(1);
        }
        if outcome == Outcome::SlowFailure {
            self.slow_failed = self.slow_failed.saturating_sub(1);
        }
    }

    fn merge(&mut self, other: &Tally) {
        self.total += other.total;
        self.failed += other.failed;
        self.slow += other.slow;
        self.slow_failed += other.slow_failed;
        self.duration += other.duration;
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            total_calls: self.total,
            failed_calls: self.failed,
            slow_calls: self.slow,
            slow_failed_calls: self.slow_failed,
            total_duration: self.duration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixedSizeWindow {
    ring: Vec<Option<(Outcome, Duration)>>,
    head: usize,
    tally: Tally,
}

impl FixedSizeWindow {
    fn new(size: u32) -> Self {
        Self { ring: vec![None; size.max(1) as usize], head: 0, tally: Tally::default() }
    }

    fn record(&mut self, outcome: Outcome, duration: Duration) -> Snapshot {
        if let Some((old, old_duration)) = self.ring[self.head].take() {
            self.tally.remove(old, old_duration);
        }
        self.ring[self.head] = Some((outcome, duration));
        self.tally.add(outcome, duration);
        self.head = (self.head + 1) % self.ring.len();
        self.tally.snapshot()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    epoch_second: u64,
    tally: Tally,
}

#[derive(Debug, Clone)]
pub struct SlidingTimeWindow {
    buckets: Vec<Bucket>,
}

impl SlidingTimeWindow {
    fn new(seconds: u32) -> Self {
        Self { buckets: vec![Bucket::default(); seconds.max(1) as usize] }
    }

    fn span(&self) -> u64 {
        self.buckets.len() as u64
    }

    fn record(&mut self, outcome: Outcome, duration: Duration, now_millis: u64) -> Snapshot {
        let second = now_millis / 1000;
        let idx = (second % self.span()) as usize;
        let bucket = &mut self.buckets[idx];
        if bucket.epoch_second != second {
            *bucket = Bucket { epoch_second: second, tally: Tally::default() };
        }
        bucket.tally.add(outcome, duration);
        self.snapshot(now_millis)
    }

    fn snapshot(&self, now_millis: u64) -> Snapshot {
        let second = now_millis / 1000;
        let oldest = second.saturating_sub(self.span() - 1);
        let mut total = Tally::default();
        for bucket in &self.buckets {
            if bucket.tally.total > 0 && bucket.epoch_second >= oldest && bucket.epoch_second <= second
            {
                total.merge(&bucket.tally);
            }
        }
        total.snapshot()
    }
}

/// Rolling record of recent outcomes, count- or time-based.
#[derive(Debug, Clone)]
pub enum SlidingWindow {
    Count(FixedSizeWindow),
    Time(SlidingTimeWindow),
}

impl SlidingWindow {
    /// Window over the last `size` calls.
    pub fn count(size: u32) -> Self {
        SlidingWindow::Count(FixedSizeWindow::new(size))
    }

    /// Window over the calls of the last `seconds` seconds.
    pub fn time(seconds: u32) -> Self {
        SlidingWindow::Time(SlidingTimeWindow::new(seconds))
    }

    /// Record one outcome and return the updated aggregate.
    pub fn record(&mut self, outcome: Outcome, duration: Duration, now_millis: u64) -> Snapshot {
        match self {
            SlidingWindow::Count(w) => w.record(outcome, duration),
            SlidingWindow::Time(w) => w.record(outcome, duration, now_millis),
        }
    }

    pub fn snapshot(&self, now_millis: u64) -> Snapshot {
        match self {
            SlidingWindow::Count(w) => w.tally.snapshot(),
            SlidingWindow::Time(w) => w.snapshot(now_millis),
        }
    }
}
