//! Transactions paused at `message_begin`.
//!
//! # Responsibilities
//! - Remember which transactions wait on a key (a connecting upstream host
//!   or an outstanding TRA query)
//! - Resume them all, in arrival order, when the key settles
//!
//! # Design Decisions
//! - One list per worker so that a pool becoming ready resumes waiting
//!   transactions of every downstream connection on that worker
//! - Resuming never calls router code: a `ResumeSink` posts the action to
//!   the owning connection, which re-drives the transaction later

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Pending-list kind used for transactions waiting on a connecting host.
pub const CONNECTION_PENDING: &str = "connection_pending";

/// What the owning connection does with a resumed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeAction {
    /// Run `message_begin` again unchanged.
    Retry,
    /// Use the given host as destination.
    Resolved(String),
    /// Drop the destination and move to the next affinity candidate.
    NextAffinity { fail_when_exhausted: bool },
}

pub trait ResumeSink {
    fn resume(&self, transaction_id: &str, action: ResumeAction);
}

type PendingKey = (String, String);

#[derive(Default)]
pub struct PendingList {
    entries: RefCell<HashMap<PendingKey, Vec<(String, Rc<dyn ResumeSink>)>>>,
}

impl PendingList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, kind: &str, key: &str, transaction_id: &str, sink: Rc<dyn ResumeSink>) {
        let mut entries = self.entries.borrow_mut();
        let waiting = entries.entry((kind.to_string(), key.to_string())).or_default();
        if waiting.iter().any(|(id, _)| id == transaction_id) {
            return;
        }
        waiting.push((transaction_id.to_string(), sink));
    }

    /// Resume every transaction waiting on `(kind, key)`. Returns how many.
    pub fn resume(&self, kind: &str, key: &str, action: ResumeAction) -> usize {
        let waiting = self
            .entries
            .borrow_mut()
            .remove(&(kind.to_string(), key.to_string()))
            .unwrap_or_default();

        tracing::debug!(kind = %kind, key = %key, count = waiting.len(), action = ?action, "Resuming pending transactions");
        for (transaction_id, sink) in &waiting {
            sink.resume(transaction_id, action.clone());
        }
        waiting.len()
    }

    pub fn waiting(&self, kind: &str, key: &str) -> usize {
        self.entries
            .borrow()
            .get(&(kind.to_string(), key.to_string()))
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}
