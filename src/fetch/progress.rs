//! Throughput and completion tracking for one download.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::strategy::FileSpec;

pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(2);
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

const MIN_SPEED_SPAN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Downloading,
    Completed,
    /// Optional file that could not be fetched.
    Skipped,
    Failed,
}

/// Per-file entry of a download's progress map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProgress {
    pub path: String,
    pub required: bool,
    pub bytes_written: u64,
    pub bytes_expected: Option<u64>,
    pub status: FileStatus,
    pub attempt: u32,
}

impl FileProgress {
    fn fraction(&self) -> f64 {
        match self.status {
            FileStatus::Completed | FileStatus::Skipped => 1.0,
            _ => match self.bytes_expected {
                Some(0) | None => 0.0,
                Some(expected) => (self.bytes_written as f64 / expected as f64).min(1.0),
            },
        }
    }
}

/// Smoothed speed plus aggregate completion, with throttled snapshots.
#[derive(Debug)]
pub struct ProgressTracker {
    files: Vec<FileProgress>,
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    interval: Duration,
    started: Instant,
    last_emit: Option<Instant>,
    high_water: f64,
}

impl ProgressTracker {
    pub fn new(window: Duration, interval: Duration) -> Self {
        Self {
            files: Vec::new(),
            samples: VecDeque::new(),
            window: window.max(MIN_SPEED_SPAN),
            interval,
            started: Instant::now(),
            last_emit: None,
            high_water: 0.0,
        }
    }

    pub fn plan_file(&mut self, spec: &FileSpec) {
        if self.entry(&spec.path).is_some() {
            return;
        }
        self.files.push(FileProgress {
            path: spec.path.clone(),
            required: spec.required,
            bytes_written: 0,
            bytes_expected: None,
            status: FileStatus::Pending,
            attempt: 0,
        });
    }

    pub fn files(&self) -> &[FileProgress] {
        &self.files
    }

    fn entry(&mut self, key: &str) -> Option<&mut FileProgress> {
        self.files.iter_mut().find(|f| f.path == key)
    }

    /// A new attempt restarts the file's byte count.
    pub fn start_attempt(&mut self, key: &str, attempt: u32) {
        if let Some(f) = self.entry(key) {
            f.status = FileStatus::Downloading;
            f.bytes_written = 0;
            f.attempt = attempt;
        }
    }

    pub fn set_expected(&mut self, key: &str, bytes: Option<u64>) {
        if let Some(f) = self.entry(key) {
            f.bytes_expected = bytes;
        }
    }

    pub fn sample(&mut self, key: &str, bytes_delta: u64, at: Instant) {
        if let Some(f) = self.entry(key) {
            f.bytes_written += bytes_delta;
        }
        self.samples.push_back((at, bytes_delta));
        self.prune(at);
    }

    pub fn complete(&mut self, key: &str, bytes: u64) {
        if let Some(f) = self.entry(key) {
            f.status = FileStatus::Completed;
            f.bytes_written = bytes;
            f.bytes_expected.get_or_insert(bytes);
        }
    }

    pub fn skip(&mut self, key: &str) {
        if let Some(f) = self.entry(key) {
            f.status = FileStatus::Skipped;
        }
    }

    pub fn fail(&mut self, key: &str) {
        if let Some(f) = self.entry(key) {
            f.status = FileStatus::Failed;
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.saturating_duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the sliding window ending at `now`.
    pub fn speed_at(&mut self, now: Instant) -> f64 {
        self.prune(now);
        let bytes: u64 = self.samples.iter().map(|(_, b)| b).sum();
        if bytes == 0 {
            return 0.0;
        }
        let span = now
            .saturating_duration_since(self.started)
            .min(self.window)
            .max(MIN_SPEED_SPAN);
        bytes as f64 / span.as_secs_f64()
    }

    pub fn speed(&mut self) -> f64 {
        self.speed_at(Instant::now())
    }

    /// Size-weighted when every planned file's size is known, equal weights
    /// otherwise.
    fn raw_fraction(&self) -> f64 {
        if self.files.is_empty() {
            return 0.0;
        }
        let sizes: Option<Vec<u64>> = self.files.iter().map(|f| f.bytes_expected).collect();
        match sizes {
            Some(sizes) if sizes.iter().sum::<u64>() > 0 => {
                let total: u64 = sizes.iter().sum();
                let done: f64 = self
                    .files
                    .iter()
                    .zip(&sizes)
                    .map(|(f, &size)| f.fraction() * size as f64)
                    .sum();
                done / total as f64
            }
            _ => self.files.iter().map(FileProgress::fraction).sum::<f64>() / self.files.len() as f64,
        }
    }

    /// Aggregate completion in `[0, 1]`. Never decreases.
    pub fn overall_fraction(&mut self) -> f64 {
        let current = self.raw_fraction().clamp(0.0, 1.0);
        if current > self.high_water {
            self.high_water = current;
        }
        self.high_water
    }

    /// True when a throttled snapshot may be published at `now`.
    pub fn snapshot_due(&self, now: Instant) -> bool {
        self.last_emit
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }

    pub fn mark_emitted(&mut self, now: Instant) {
        self.last_emit = Some(now);
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW, DEFAULT_PROGRESS_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(files: &[(&str, bool)]) -> ProgressTracker {
        let mut t = ProgressTracker::default();
        for (path, required) in files {
            let spec = if *required {
                FileSpec::required(*path, 1)
            } else {
                FileSpec::optional(*path, 1)
            };
            t.plan_file(&spec);
        }
        t
    }

    #[test]
    fn test_weighted_when_sizes_known() {
        let mut t = tracker_with(&[("a", true), ("b", true)]);
        t.set_expected("a", Some(900));
        t.set_expected("b", Some(100));
        t.start_attempt("a", 1);
        t.sample("a", 450, Instant::now());
        assert!((t.overall_fraction() - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_equal_weights_when_a_size_is_unknown() {
        let mut t = tracker_with(&[("a", true), ("b", false)]);
        t.set_expected("a", Some(1000));
        t.sample("a", 500, Instant::now());
        assert!((t.overall_fraction() - 0.25).abs() < 1e-9);
        t.skip("b");
        assert!((t.overall_fraction() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_fraction_never_decreases_across_retry() {
        let mut t = tracker_with(&[("a", true)]);
        t.set_expected("a", Some(100));
        t.start_attempt("a", 1);
        t.sample("a", 80, Instant::now());
        assert!((t.overall_fraction() - 0.8).abs() < 1e-9);

        t.start_attempt("a", 2);
        t.sample("a", 10, Instant::now());
        assert!((t.overall_fraction() - 0.8).abs() < 1e-9);

        t.complete("a", 100);
        assert_eq!(t.overall_fraction(), 1.0);
    }

    #[test]
    fn test_speed_uses_window() {
        let mut t = tracker_with(&[("a", true)]);
        let start = t.started;
        t.sample("a", 1000, start + Duration::from_millis(500));
        t.sample("a", 1000, start + Duration::from_millis(1000));
        let speed = t.speed_at(start + Duration::from_millis(1000));
        assert!((speed - 2000.0).abs() < 1.0, "speed {speed}");

        // Old samples fall out of the 2s window.
        let later = t.speed_at(start + Duration::from_millis(3200));
        assert_eq!(later, 0.0);
    }

    #[test]
    fn test_throttle() {
        let mut t = ProgressTracker::new(DEFAULT_SPEED_WINDOW, Duration::from_millis(100));
        let now = Instant::now();
        assert!(t.snapshot_due(now));
        t.mark_emitted(now);
        assert!(!t.snapshot_due(now + Duration::from_millis(50)));
        assert!(t.snapshot_due(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_empty_plan_is_zero() {
        let mut t = ProgressTracker::default();
        assert_eq!(t.overall_fraction(), 0.0);
        assert_eq!(t.speed(), 0.0);
    }
}
