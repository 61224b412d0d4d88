use chrono::{Duration, NaiveDate};
use serde::Serialize;

/// Default fact-computation window.
pub const CHUNK_DAYS: u32 = 14;

/// Inclusive date window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateChunk {
    pub index: usize,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateChunk {
    /// Stable identifier used in error reports: `start..end`.
    pub fn id(&self) -> String {
        format!("{}..{}", self.start, self.end)
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// Split `[start, end]` into contiguous, non-overlapping windows of
/// `chunk_days`, the last one truncated at `end`.
///
/// Empty when `start > end` or `chunk_days == 0`.
pub fn chunk_range(start: NaiveDate, end: NaiveDate, chunk_days: u32) -> Vec<DateChunk> {
    let mut chunks = Vec::new();
    if start > end || chunk_days == 0 {
        return chunks;
    }

    let step = Duration::days(i64::from(chunk_days));
    let mut cursor = start;
    while cursor <= end {
        let window_end = (cursor + step - Duration::days(1)).min(end);
        chunks.push(DateChunk {
            index: chunks.len(),
            start: cursor,
            end: window_end,
        });
        match window_end.succ_opt() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    chunks
}
