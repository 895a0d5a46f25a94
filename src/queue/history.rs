//! Bounded record of requests that reached a FAILED terminal state.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::Priority;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub request_id: Uuid,
    pub priority: Priority,
    /// Rendered form of the last underlying error.
    pub error: String,
    /// Zero when the request was abandoned before any attempt finished.
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Ring of the most recent failures; the oldest entry is evicted first.
#[derive(Debug)]
pub(crate) struct FailureHistory {
    records: VecDeque<FailureRecord>,
    limit: usize,
}

impl FailureHistory {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(limit.min(1024)),
            limit,
        }
    }

    pub(crate) fn push(&mut self, record: FailureRecord) {
        if self.limit == 0 {
            return;
        }
        while self.records.len() >= self.limit {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub(crate) fn snapshot(&self) -> Vec<FailureRecord> {
        self.records.iter().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
