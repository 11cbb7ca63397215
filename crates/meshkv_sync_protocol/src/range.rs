//! Time ranges and watermark types.

use crate::item::Timestamp;

/// Cursor marking the newest timestamp already exchanged with a peer.
pub type WaterMark = u64;

/// Half-open intervals of timestamps to fetch or send in one sync round.
///
/// The delete range is tracked independently of the live-row range because
/// tombstones and live rows are different result sets with different
/// retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncTimeRange {
    /// Start of the live-row interval (inclusive).
    pub begin_time: Timestamp,
    /// End of the live-row interval (exclusive).
    pub end_time: Timestamp,
    /// Start of the tombstone interval (inclusive).
    pub delete_begin_time: Timestamp,
    /// End of the tombstone interval (exclusive).
    pub delete_end_time: Timestamp,
}

impl SyncTimeRange {
    /// Creates a range covering live rows only; the delete range mirrors it.
    pub fn full(begin: Timestamp, end: Timestamp) -> Self {
        Self {
            begin_time: begin,
            end_time: end,
            delete_begin_time: begin,
            delete_end_time: end,
        }
    }

    /// Creates a range with an independent delete interval.
    pub fn with_delete_range(
        begin: Timestamp,
        end: Timestamp,
        delete_begin: Timestamp,
        delete_end: Timestamp,
    ) -> Self {
        Self {
            begin_time: begin,
            end_time: end,
            delete_begin_time: delete_begin,
            delete_end_time: delete_end,
        }
    }

    /// Returns true if both intervals are well formed.
    pub fn is_valid(&self) -> bool {
        self.begin_time <= self.end_time && self.delete_begin_time <= self.delete_end_time
    }

    /// Returns true if a live-row timestamp falls inside the range.
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.begin_time && ts < self.end_time
    }

    /// Returns true if a tombstone timestamp falls inside the delete range.
    pub fn contains_delete(&self, ts: Timestamp) -> bool {
        ts >= self.delete_begin_time && ts < self.delete_end_time
    }
}

/// Which watermarks a finished round should advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaterMarkUpdate {
    /// Advance the live-row mark.
    pub normal: bool,
    /// Advance the delete-stream mark.
    pub delete: bool,
}
