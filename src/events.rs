//! Bounded in-memory event log. The last 500 entries are kept; older
//! ones are evicted. This is the user-visible failure surface together
//! with the live/off flags in the snapshot.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const MAX_EVENTS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Info,
    Signal,
    Buy,
    Sell,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
}

#[derive(Default)]
pub struct EventLog {
    entries: Mutex<VecDeque<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    pub fn push(&self, kind: EventKind, message: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() >= MAX_EVENTS {
            entries.pop_front();
        }
        entries.push_back(Event {
            at: Utc::now(),
            kind,
            message: message.into(),
        });
    }

    /// Most recent `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Event> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_bound() {
        let log = EventLog::new();
        for i in 0..600 {
            log.push(EventKind::Info, format!("event {}", i));
        }
        assert_eq!(log.len(), MAX_EVENTS);

        let recent = log.recent(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent.last().unwrap().message, "event 599");
        assert_eq!(recent.first().unwrap().message, "event 590");
    }

    #[test]
    fn test_recent_more_than_present() {
        let log = EventLog::new();
        log.push(EventKind::Warn, "only one");
        let recent = log.recent(50);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, EventKind::Warn);
    }
}
