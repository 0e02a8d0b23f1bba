//! Per-session counters for a vault refresh.
//!
//! `SessionStatsRecorder` is shared by the concurrent steps of one fetch session. It counts
//! log chunks queried, logs returned per event kind, blocks resolved and retries taken, and
//! produces a `SessionStats` summary that the tracker logs when the session resolves.

use crate::rpc::EventKind;

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counters shared by the steps of one fetch session
#[derive(Debug, Default)]
pub struct SessionStatsRecorder {
    chunks_queried: AtomicU64,
    deposit_logs: AtomicU64,
    withdrawal_logs: AtomicU64,
    blocks_resolved: AtomicU64,
    retries: AtomicU64,
}

impl SessionStatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful log query covering `chunks` sub-ranges
    pub fn record_logs(&self, kind: EventKind, chunks: usize, logs: usize) {
        self.chunks_queried.fetch_add(chunks as u64, Ordering::Relaxed);
        let counter = match kind {
            EventKind::Deposit => &self.deposit_logs,
            EventKind::Withdrawal => &self.withdrawal_logs,
        };
        counter.fetch_add(logs as u64, Ordering::Relaxed);
    }

    pub fn record_blocks(&self, blocks: usize) {
        self.blocks_resolved.fetch_add(blocks as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the counters
    pub fn get_stats(&self, head_block: u64) -> SessionStats {
        SessionStats {
            head_block,
            chunks_queried: self.chunks_queried.load(Ordering::Relaxed),
            deposit_logs: self.deposit_logs.load(Ordering::Relaxed),
            withdrawal_logs: self.withdrawal_logs.load(Ordering::Relaxed),
            blocks_resolved: self.blocks_resolved.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Statistics of one fetch session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub head_block: u64,
    pub chunks_queried: u64,
    pub deposit_logs: u64,
    pub withdrawal_logs: u64,
    pub blocks_resolved: u64,
    pub retries: u64,
}

impl SessionStats {
    /// Get a human-readable summary of the session statistics
    pub fn summary(&self) -> String {
        format!(
            "Read up to block {}: {} deposits, {} withdrawals, {} blocks resolved over {} log queries{}",
            self.head_block,
            self.deposit_logs,
            self.withdrawal_logs,
            self.blocks_resolved,
            self.chunks_queried,
            if self.retries == 0 {
                String::new()
            } else {
                format!(" ({} retries)", self.retries)
            }
        )
    }

    pub fn log(&self) {
        info!("Session stats: {}", self.summary());
    }
}
