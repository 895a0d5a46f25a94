//! Priority-ordered waiting list.
//!
//! Two FIFO lanes. Every High entry leaves before any Low entry, so a High
//! request submitted late still jumps ahead of Low requests already waiting.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Request priority. Affects waiting-list position only, never preempts
/// work already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}' (expected high or low)")),
        }
    }
}

#[derive(Debug)]
pub struct WaitList<T> {
    high: VecDeque<T>,
    low: VecDeque<T>,
}

impl<T> Default for WaitList<T> {
    fn default() -> Self {
        Self {
            high: VecDeque::new(),
            low: VecDeque::new(),
        }
    }
}

impl<T> WaitList<T> {
    pub fn push(&mut self, priority: Priority, item: T) {
        match priority {
            Priority::High => self.high.push_back(item),
            Priority::Low => self.low.push_back(item),
        }
    }

    /// Remove the next entry to admit. Low entries are only considered when
    /// `allow_low` is set and no High entry is waiting.
    pub fn pop(&mut self, allow_low: bool) -> Option<(Priority, T)> {
        if let Some(item) = self.high.pop_front() {
            return Some((Priority::High, item));
        }
        if allow_low {
            return self.low.pop_front().map(|item| (Priority::Low, item));
        }
        None
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    pub fn len_of(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high.len(),
            Priority::Low => self.low.len(),
        }
    }
}
