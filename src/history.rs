//! Message history tracking for debugging and diagnostics.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::codec::{CommandType, DataPointMap};

/// Which way a recorded frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

/// A recorded frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub direction: Direction,
    pub command: CommandType,
    pub sn: String,
    pub data: DataPointMap,
    /// Seconds since history creation
    pub timestamp: f64,
}

/// Bounded log of the frames a session exchanged with its device.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    counts: HashMap<(Direction, CommandType), usize>,
    last_error: Option<String>,
    start_time: Instant,
    entries: Vec<HistoryEntry>,
    max_entries: usize,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHistory {
    pub const DEFAULT_MAX_ENTRIES: usize = 100;

    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            last_error: None,
            start_time: Instant::now(),
            entries: Vec::new(),
            max_entries: Self::DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Self::new()
        }
    }

    pub fn record(
        &mut self,
        direction: Direction,
        command: CommandType,
        sn: &str,
        data: &DataPointMap,
    ) {
        *self.counts.entry((direction, command)).or_default() += 1;

        self.entries.push(HistoryEntry {
            direction,
            command,
            sn: sn.to_string(),
            data: data.clone(),
            timestamp: self.start_time.elapsed().as_secs_f64(),
        });

        if self.entries.len() > self.max_entries {
            self.entries.remove(0);
        }
    }

    pub fn record_error(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Most recent entry for a command, in either direction.
    pub fn last(&self, command: CommandType) -> Option<&HistoryEntry> {
        self.entries.iter().rev().find(|e| e.command == command)
    }

    /// Total frames seen for a direction and command, including evicted ones.
    pub fn count(&self, direction: Direction, command: CommandType) -> usize {
        self.counts.get(&(direction, command)).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.entries.clear();
        self.last_error = None;
    }

    pub fn summary(&self) -> HistorySummary {
        let total = |d: Direction| -> usize {
            self.counts
                .iter()
                .filter(|((dir, _), _)| *dir == d)
                .map(|(_, n)| n)
                .sum()
        };
        HistorySummary {
            send_count: total(Direction::Send),
            receive_count: total(Direction::Receive),
            push_count: self.count(Direction::Receive, CommandType::Push),
            total_entries: self.entries.len(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Summary of message history for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySummary {
    pub send_count: usize,
    pub receive_count: usize,
    pub push_count: usize,
    pub total_entries: usize,
    pub last_error: Option<String>,
}
