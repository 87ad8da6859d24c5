//! Rotation policy: decides when a partition buffer is ready to flush.

use chrono::{DateTime, Duration, Utc};

use crate::event::FileStats;

/// Injected time source so age-based rotation is testable.
pub type Clock = fn() -> DateTime<Utc>;

/// Composite rotation predicate over a `FileStats` observation. A
/// threshold of zero disables that trigger; any satisfied trigger wins.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    max_size_bytes: u64,
    max_records: usize,
    max_duration: Duration,
    clock: Clock,
}

impl RotationPolicy {
    pub fn new(max_size_bytes: u64, max_records: usize, max_duration: Duration) -> Self {
        Self::with_clock(max_size_bytes, max_records, max_duration, Utc::now)
    }

    pub fn with_clock(
        max_size_bytes: u64,
        max_records: usize,
        max_duration: Duration,
        clock: Clock,
    ) -> Self {
        RotationPolicy {
            max_size_bytes,
            max_records,
            max_duration,
            clock,
        }
    }

    pub fn should_rotate(&self, stats: &FileStats) -> bool {
        if self.max_size_bytes > 0 && stats.size_bytes >= self.max_size_bytes {
            return true;
        }
        if self.max_records > 0 && stats.record_count >= self.max_records {
            return true;
        }
        if self.max_duration > Duration::zero() {
            if let Some(first) = stats.first_write_time {
                if (self.clock)() - first >= self.max_duration {
                    return true;
                }
            }
        }
        false
    }
}
