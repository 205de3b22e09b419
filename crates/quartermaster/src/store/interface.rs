use core::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Document, StoreError, StoreResult};

/// Result of [`DocumentStore::insert_unique`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The document was stored; the caller now owns its key.
    Inserted,
    /// A document with the same unique key already exists. Nothing changed.
    Duplicate,
}

/// Result of [`DocumentStore::take_front`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TakeOutcome {
    /// The first `n` elements, removed from the array.
    Taken(Vec<i64>),
    /// The array held fewer than `n` elements and was left untouched.
    Insufficient { available: usize },
    /// No document matched the filter.
    Missing,
}

/// Result of [`DocumentStore::insert_sorted`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertSorted {
    Inserted,
    AlreadyPresent,
    /// No document matched the filter.
    Missing,
}

/// One RFC 6902 operation. Paths are RFC 6901 JSON pointers.
///
/// Serializes to the wire form, e.g. `{"op": "add", "path": "/a", "value": 1}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

/// The operations the allocator needs from a document store.
///
/// Collections are addressed by name; documents are JSON objects; filters
/// select documents by top-level field equality (a nested object in a filter
/// must equal the stored value exactly).
///
/// Each method must be atomic with respect to every other call on the same
/// document, from any process. The allocator relies on nothing else for
/// cross-instance correctness.
pub trait DocumentStore: Send + Sync {
    /// Returns the first document matching `filter`.
    fn get_one(
        &self,
        collection: &str,
        filter: &Document,
    ) -> impl Future<Output = StoreResult<Option<Document>>> + Send;

    /// Returns every document matching `filter`.
    fn get_many(
        &self,
        collection: &str,
        filter: &Document,
    ) -> impl Future<Output = StoreResult<Vec<Document>>> + Send;

    /// Replaces the document matching `filter` with `filter` merged with
    /// `data`, creating it if absent.
    ///
    /// Returns `true` when an existing document was replaced.
    fn put_one(
        &self,
        collection: &str,
        filter: &Document,
        data: &Document,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Creates the document (`filter` merged with `data`) only if nothing
    /// matches `filter`.
    ///
    /// Returns `true` when a document already existed, in which case it is
    /// left untouched.
    fn put_one_not_update(
        &self,
        collection: &str,
        filter: &Document,
        data: &Document,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Inserts `document` unless it collides with an existing document on a
    /// unique index (or on `_id`).
    fn insert_unique(
        &self,
        collection: &str,
        document: &Document,
    ) -> impl Future<Output = StoreResult<InsertOutcome>> + Send;

    /// Ensures a unique compound index over `keys`. Idempotent.
    fn create_index(
        &self,
        collection: &str,
        keys: &[&str],
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Adds `by` to the integer `field` of the document matching `filter`,
    /// creating the document with the field at zero first if absent.
    ///
    /// Returns the value after the increment.
    fn increment(
        &self,
        collection: &str,
        filter: &Document,
        field: &str,
        by: i64,
    ) -> impl Future<Output = StoreResult<i64>> + Send;

    /// Deletes the first document matching `filter`. Returns `true` if one
    /// was deleted.
    fn delete_one(
        &self,
        collection: &str,
        filter: &Document,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Deletes every document matching `filter` and returns how many.
    fn delete_many(
        &self,
        collection: &str,
        filter: &Document,
    ) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Applies an RFC 7396 merge patch to the document matching `filter`.
    ///
    /// Fails with [`StoreError::NotFound`](crate::store::StoreError::NotFound)
    /// when nothing matches.
    fn merge_patch(
        &self,
        collection: &str,
        filter: &Document,
        patch: &Document,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Applies an RFC 6902 JSON patch to the document matching `filter`.
    ///
    /// The operations apply in order and all of them or none take effect. A
    /// failed `test` or an unresolvable path is
    /// [`StoreError::Rejected`](crate::store::StoreError::Rejected); no match
    /// is [`StoreError::NotFound`](crate::store::StoreError::NotFound).
    fn json_patch(
        &self,
        collection: &str,
        filter: &Document,
        patch: &[PatchOperation],
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Removes and returns the first `n` elements of the sorted integer array
    /// `field`, but only if it holds at least `n` of them.
    ///
    /// A missing field counts as an empty array.
    fn take_front(
        &self,
        collection: &str,
        filter: &Document,
        field: &str,
        n: usize,
    ) -> impl Future<Output = StoreResult<TakeOutcome>> + Send;

    /// Inserts `value` into the sorted integer array `field`, keeping it
    /// sorted, unless it is already present.
    fn insert_sorted(
        &self,
        collection: &str,
        filter: &Document,
        field: &str,
        value: i64,
    ) -> impl Future<Output = StoreResult<InsertSorted>> + Send;
}

/// Applies an RFC 7396 merge patch to `target` in place.
pub(crate) fn apply_merge_patch(target: &mut Document, patch: &Document) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(inner) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Document::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Document::new());
                }
                if let Value::Object(nested) = entry {
                    apply_merge_patch(nested, inner);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Applies an RFC 6902 patch to `target`. On error `target` is unchanged.
pub(crate) fn apply_json_patch(
    target: &mut Document,
    patch: &[PatchOperation],
) -> StoreResult<()> {
    let mut doc = Value::Object(target.clone());
    for op in patch {
        apply_operation(&mut doc, op)?;
    }
    match doc {
        Value::Object(map) => {
            *target = map;
            Ok(())
        }
        _ => Err(StoreError::rejected(
            "patch replaced the document with a non-object",
        )),
    }
}

fn apply_operation(doc: &mut Value, op: &PatchOperation) -> StoreResult<()> {
    match op {
        PatchOperation::Add { path, value } => add(doc, path, value.clone()),
        PatchOperation::Remove { path } => remove(doc, path).map(drop),
        PatchOperation::Replace { path, value } => {
            let slot = doc.pointer_mut(path).ok_or_else(|| unresolved(path))?;
            *slot = value.clone();
            Ok(())
        }
        PatchOperation::Move { from, path } => {
            if path.starts_with(&format!("{from}/")) {
                return Err(StoreError::rejected(format!(
                    "cannot move `{from}` into its own child `{path}`"
                )));
            }
            let value = remove(doc, from)?;
            add(doc, path, value)
        }
        PatchOperation::Copy { from, path } => {
            let value = doc.pointer(from).cloned().ok_or_else(|| unresolved(from))?;
            add(doc, path, value)
        }
        PatchOperation::Test { path, value } => match doc.pointer(path) {
            Some(current) if current == value => Ok(()),
            _ => Err(StoreError::rejected(format!("test failed at `{path}`"))),
        },
    }
}

fn unresolved(path: &str) -> StoreError {
    StoreError::rejected(format!("path `{path}` does not resolve"))
}

/// Splits a pointer into its parent pointer and unescaped last token.
fn split_pointer(path: &str) -> StoreResult<(&str, String)> {
    let (parent, token) = path.rsplit_once('/').ok_or_else(|| unresolved(path))?;
    if !parent.is_empty() && !parent.starts_with('/') {
        return Err(unresolved(path));
    }
    Ok((parent, token.replace("~1", "/").replace("~0", "~")))
}

fn array_index(token: &str, len: usize, path: &str) -> StoreResult<usize> {
    let leading_zero = token.len() > 1 && token.starts_with('0');
    match token.parse::<usize>() {
        Ok(idx) if !leading_zero && idx <= len => Ok(idx),
        _ => Err(unresolved(path)),
    }
}

fn add(doc: &mut Value, path: &str, value: Value) -> StoreResult<()> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, token) = split_pointer(path)?;
    match doc.pointer_mut(parent) {
        Some(Value::Object(map)) => {
            map.insert(token, value);
            Ok(())
        }
        Some(Value::Array(items)) => {
            let idx = if token == "-" {
                items.len()
            } else {
                array_index(&token, items.len(), path)?
            };
            items.insert(idx, value);
            Ok(())
        }
        _ => Err(unresolved(path)),
    }
}

fn remove(doc: &mut Value, path: &str) -> StoreResult<Value> {
    let (parent, token) = split_pointer(path)?;
    match doc.pointer_mut(parent) {
        Some(Value::Object(map)) => map.remove(&token).ok_or_else(|| unresolved(path)),
        Some(Value::Array(items)) => {
            let idx = array_index(&token, items.len(), path)?;
            if idx == items.len() {
                return Err(unresolved(path));
            }
            Ok(items.remove(idx))
        }
        _ => Err(unresolved(path)),
    }
}
