//! Deferred byte-level edits of a raw SIP message.

/// Kind of a recorded edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Delete,
}

/// An edit against the original raw bytes. Positions always refer to the
/// unmodified message, never to a partially edited one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert { position: usize, value: String },
    Delete { position: usize, length: usize },
}

impl Operation {
    pub fn op_type(&self) -> OperationType {
        match self {
            Operation::Insert { .. } => OperationType::Insert,
            Operation::Delete { .. } => OperationType::Delete,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Operation::Insert { position, .. } | Operation::Delete { position, .. } => *position,
        }
    }
}
