//! Serialization of a (possibly edited) SIP message.

use bytes::Bytes;

use crate::sip::{MessageMetadata, Operation};

/// Apply recorded edits to the original bytes in a single pass.
///
/// Edits run from the highest position down so earlier offsets stay valid.
/// At the same position a delete runs before an insert, so the inserted
/// text lands where the deleted text used to start.
pub fn apply_operations(raw: &[u8], operations: &[Operation]) -> Bytes {
    let mut ordered: Vec<&Operation> = operations.iter().collect();
    ordered.sort_by(|a, b| {
        b.position()
            .cmp(&a.position())
            .then_with(|| delete_first(a).cmp(&delete_first(b)))
    });

    let mut out = raw.to_vec();
    for operation in ordered {
        match operation {
            Operation::Delete { position, length } => {
                let start = (*position).min(out.len());
                let end = (start + length).min(out.len());
                out.drain(start..end);
            }
            Operation::Insert { position, value } => {
                let at = (*position).min(out.len());
                out.splice(at..at, value.bytes());
            }
        }
    }
    Bytes::from(out)
}

fn delete_first(operation: &Operation) -> u8 {
    match operation {
        Operation::Delete { .. } => 0,
        Operation::Insert { .. } => 1,
    }
}

/// Wire bytes for a message with its recorded operations applied.
pub fn encode(metadata: &MessageMetadata) -> Bytes {
    if metadata.operation_list().is_empty() {
        return metadata.raw_msg().clone();
    }
    apply_operations(metadata.raw_msg(), metadata.operation_list())
}
