//! Bounded in-memory log of recent broadcasts.
//!
//! The log holds the most recent `max_entries` broadcasts (text and file
//! combined) and only ever records messages that went out; frames that fail
//! to decode never reach it. A file broadcast contributes two entries, its
//! `[FILE]` notification line and the file payload, appended in one
//! critical section so a trim can never separate them in replay order.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::message::FileMessage;

pub const DEFAULT_MAX_HISTORY: usize = 100;

#[derive(Debug, Clone)]
pub enum HistoryEntry {
    /// An already-formatted notification line.
    Text(String),
    /// A file payload to be re-streamed through a file channel on replay.
    File(Arc<FileMessage>),
}

pub struct HistoryLog {
    max_entries: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl HistoryLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn append_text(&self, line: String) {
        let mut entries = self.entries.lock().await;
        entries.push_back(HistoryEntry::Text(line));
        Self::trim(&mut entries, self.max_entries);
    }

    /// Appends a file broadcast's notification line and payload atomically.
    pub async fn append_file_broadcast(&self, line: String, file: Arc<FileMessage>) {
        let mut entries = self.entries.lock().await;
        entries.push_back(HistoryEntry::Text(line));
        entries.push_back(HistoryEntry::File(file));
        Self::trim(&mut entries, self.max_entries);
    }

    /// Locks the log for the duration of a replay so concurrent broadcasts
    /// cannot interleave with the replayed sequence.
    pub async fn lock(&self) -> MutexGuard<'_, VecDeque<HistoryEntry>> {
        self.entries.lock().await
    }

    pub async fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    fn trim(entries: &mut VecDeque<HistoryEntry>, max_entries: usize) {
        while entries.len() > max_entries {
            entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_is_bounded_and_keeps_the_most_recent() {
        let log = HistoryLog::new(3);
        for i in 0..5 {
            log.append_text(format!("line {i}")).await;
        }

        let entries = log.snapshot().await;
        assert_eq!(entries.len(), 3);
        let lines: Vec<_> = entries
            .iter()
            .map(|e| match e {
                HistoryEntry::Text(line) => line.clone(),
                HistoryEntry::File(_) => panic!("unexpected file entry"),
            })
            .collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn file_broadcast_appends_both_entries_in_order() {
        let log = HistoryLog::new(10);
        let file = Arc::new(FileMessage {
            name: "a.bin".into(),
            data: vec![1, 2, 3],
        });
        log.append_file_broadcast("[FILE] notice".into(), Arc::clone(&file))
            .await;

        let entries = log.snapshot().await;
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[0], HistoryEntry::Text(line) if line == "[FILE] notice"));
        assert!(matches!(&entries[1], HistoryEntry::File(f) if f.name == "a.bin"));
    }

    #[tokio::test]
    async fn trim_past_capacity_may_pop_two_for_a_file_pair() {
        let log = HistoryLog::new(2);
        log.append_text("old".into()).await;
        log.append_text("older".into()).await;
        let file = Arc::new(FileMessage {
            name: "f".into(),
            data: vec![],
        });
        log.append_file_broadcast("[FILE] f".into(), file).await;

        let entries = log.snapshot().await;
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[0], HistoryEntry::Text(line) if line == "[FILE] f"));
        assert!(matches!(&entries[1], HistoryEntry::File(_)));
    }
}
