//! The document merge rule shared by pull application and compaction
//! (§4.6 step 5, §4.7 step 2, §8 invariant 2).

use crate::model::Document;

/// Resolve which of two conflicting copies of a document id survives.
///
/// `None` for `existing` means this is the first time the id has been seen
/// locally: `incoming` always wins. When `existing` is a local pending write
/// (`seq.is_none()`, not yet pushed), an incoming shard-sourced document
/// loses to it unless the incoming `at` is strictly newer — `Document::
/// is_newer_than`'s `(seq, at)` ordering would otherwise always rank a
/// sequenced `incoming` above an unsequenced pending write regardless of
/// timestamp, since `Some(_) > None`. Once `existing` already carries a
/// sequence, ordering falls back to the normal `(seq, at)` comparison (§4.6
/// step 6).
pub fn merge_to_latest_document(incoming: Document, existing: Option<&Document>) -> Document {
    match existing {
        None => incoming,
        Some(existing) if existing.seq.is_none() => {
            if incoming.at > existing.at {
                incoming
            } else {
                existing.clone()
            }
        }
        Some(existing) if !incoming.is_newer_than(existing) => existing.clone(),
        _ => incoming,
    }
}
