use core::{fmt, time::Duration};
use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use serde_json::Value;

use crate::store::{
    Document, DocumentStore, InsertOutcome, InsertSorted, PatchOperation, StoreError, StoreResult,
    TakeOutcome,
    interface::{apply_json_patch, apply_merge_patch},
};

/// An in-process [`DocumentStore`].
///
/// All collections sit behind one mutex, so every operation is trivially
/// atomic. Clones share the same collections.
///
/// The store can be taken offline and slowed down, which is how the
/// allocator's behavior under store outages and deadlines is exercised.
///
/// # Example
/// ```
/// use quartermaster::store::{DocumentStore, MemoryStore};
/// use serde_json::{Map, json};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// let filter: Map<_, _> = json!({ "_id": "hits" }).as_object().unwrap().clone();
/// assert_eq!(store.increment("counters", &filter, "count", 1).await.unwrap(), 1);
/// assert_eq!(store.increment("counters", &filter, "count", 1).await.unwrap(), 2);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    collections: Mutex<HashMap<String, Collection>>,
    offline: AtomicBool,
    latency_micros: AtomicU64,
    operations: AtomicU64,
}

#[derive(Default)]
struct Collection {
    documents: Vec<Document>,
    unique: Vec<Vec<String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with
    /// [`StoreError::Unavailable`] until called again with `true`.
    pub fn set_available(&self, available: bool) {
        self.inner.offline.store(!available, Ordering::Relaxed);
    }

    /// Delays every subsequent operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.inner.latency_micros.store(micros, Ordering::Relaxed);
    }

    /// Number of operations issued against this store (and its clones).
    pub fn operation_count(&self) -> u64 {
        self.inner.operations.load(Ordering::Relaxed)
    }

    async fn enter(&self) -> StoreResult<()> {
        self.inner.operations.fetch_add(1, Ordering::Relaxed);
        let latency = self.inner.latency_micros.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
        if self.inner.offline.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable {
                context: "memory store is offline".to_owned(),
            });
        }
        Ok(())
    }

    fn with_collection<T>(&self, name: &str, f: impl FnOnce(&mut Collection) -> T) -> T {
        let mut collections = self.inner.collections.lock();
        f(collections.entry(name.to_owned()).or_default())
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let collections = self.inner.collections.lock();
        f.debug_struct("MemoryStore")
            .field("collections", &collections.len())
            .field("available", &!self.inner.offline.load(Ordering::Relaxed))
            .finish()
    }
}

impl Collection {
    fn position(&self, filter: &Document) -> Option<usize> {
        self.documents.iter().position(|doc| matches(doc, filter))
    }

    fn collides(&self, candidate: &Document) -> bool {
        let id_taken = candidate
            .get("_id")
            .is_some_and(|id| self.documents.iter().any(|doc| doc.get("_id") == Some(id)));

        id_taken
            || self.unique.iter().any(|keys| {
                let values: Option<Vec<&Value>> = keys.iter().map(|k| candidate.get(k)).collect();
                values.is_some_and(|values| {
                    self.documents.iter().any(|doc| {
                        keys.iter()
                            .zip(&values)
                            .all(|(key, value)| doc.get(key) == Some(*value))
                    })
                })
            })
    }

    fn insert(&mut self, document: Document) -> StoreResult<()> {
        if self.collides(&document) {
            return Err(StoreError::Backend {
                context: "duplicate key on upsert".to_owned(),
            });
        }
        self.documents.push(document);
        Ok(())
    }
}

fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, value)| doc.get(key) == Some(value))
}

fn merged(filter: &Document, data: &Document) -> Document {
    let mut doc = filter.clone();
    for (key, value) in data {
        doc.insert(key.clone(), value.clone());
    }
    doc
}

fn int_array<'a>(doc: &'a mut Document, field: &str) -> StoreResult<&'a mut Vec<Value>> {
    let slot = doc
        .entry(field.to_owned())
        .or_insert_with(|| Value::Array(Vec::new()));
    match slot {
        Value::Array(items) => Ok(items),
        _ => Err(StoreError::malformed(format!("`{field}` is not an array"))),
    }
}

fn as_int(value: &Value, field: &str) -> StoreResult<i64> {
    value
        .as_i64()
        .ok_or_else(|| StoreError::malformed(format!("`{field}` holds a non-integer element")))
}

impl DocumentStore for MemoryStore {
    async fn get_one(&self, collection: &str, filter: &Document) -> StoreResult<Option<Document>> {
        self.enter().await?;
        Ok(self.with_collection(collection, |coll| {
            coll.position(filter).map(|idx| coll.documents[idx].clone())
        }))
    }

    async fn get_many(&self, collection: &str, filter: &Document) -> StoreResult<Vec<Document>> {
        self.enter().await?;
        Ok(self.with_collection(collection, |coll| {
            coll.documents
                .iter()
                .filter(|doc| matches(doc, filter))
                .cloned()
                .collect()
        }))
    }

    async fn put_one(
        &self,
        collection: &str,
        filter: &Document,
        data: &Document,
    ) -> StoreResult<bool> {
        self.enter().await?;
        self.with_collection(collection, |coll| match coll.position(filter) {
            Some(idx) => {
                coll.documents[idx] = merged(filter, data);
                Ok(true)
            }
            None => coll.insert(merged(filter, data)).map(|()| false),
        })
    }

    async fn put_one_not_update(
        &self,
        collection: &str,
        filter: &Document,
        data: &Document,
    ) -> StoreResult<bool> {
        self.enter().await?;
        self.with_collection(collection, |coll| match coll.position(filter) {
            Some(_) => Ok(true),
            None => coll.insert(merged(filter, data)).map(|()| false),
        })
    }

    async fn insert_unique(
        &self,
        collection: &str,
        document: &Document,
    ) -> StoreResult<InsertOutcome> {
        self.enter().await?;
        Ok(self.with_collection(collection, |coll| {
            if coll.collides(document) {
                InsertOutcome::Duplicate
            } else {
                coll.documents.push(document.clone());
                InsertOutcome::Inserted
            }
        }))
    }

    async fn create_index(&self, collection: &str, keys: &[&str]) -> StoreResult<()> {
        self.enter().await?;
        let keys: Vec<String> = keys.iter().map(|k| (*k).to_owned()).collect();
        self.with_collection(collection, |coll| {
            if !coll.unique.contains(&keys) {
                coll.unique.push(keys);
            }
        });
        Ok(())
    }

    async fn increment(
        &self,
        collection: &str,
        filter: &Document,
        field: &str,
        by: i64,
    ) -> StoreResult<i64> {
        self.enter().await?;
        self.with_collection(collection, |coll| {
            let idx = match coll.position(filter) {
                Some(idx) => idx,
                None => {
                    coll.insert(filter.clone())?;
                    coll.documents.len() - 1
                }
            };
            let doc = &mut coll.documents[idx];
            let current = match doc.get(field) {
                None => 0,
                Some(value) => as_int(value, field)?,
            };
            let next = current
                .checked_add(by)
                .ok_or_else(|| StoreError::malformed(format!("`{field}` overflowed")))?;
            doc.insert(field.to_owned(), Value::from(next));
            Ok(next)
        })
    }

    async fn delete_one(&self, collection: &str, filter: &Document) -> StoreResult<bool> {
        self.enter().await?;
        Ok(self.with_collection(collection, |coll| match coll.position(filter) {
            Some(idx) => {
                coll.documents.swap_remove(idx);
                true
            }
            None => false,
        }))
    }

    async fn delete_many(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        self.enter().await?;
        Ok(self.with_collection(collection, |coll| {
            let before = coll.documents.len();
            coll.documents.retain(|doc| !matches(doc, filter));
            (before - coll.documents.len()) as u64
        }))
    }

    async fn merge_patch(
        &self,
        collection: &str,
        filter: &Document,
        patch: &Document,
    ) -> StoreResult<()> {
        self.enter().await?;
        self.with_collection(collection, |coll| match coll.position(filter) {
            Some(idx) => {
                apply_merge_patch(&mut coll.documents[idx], patch);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                collection: collection.to_owned(),
            }),
        })
    }

    async fn json_patch(
        &self,
        collection: &str,
        filter: &Document,
        patch: &[PatchOperation],
    ) -> StoreResult<()> {
        self.enter().await?;
        self.with_collection(collection, |coll| match coll.position(filter) {
            Some(idx) => apply_json_patch(&mut coll.documents[idx], patch),
            None => Err(StoreError::NotFound {
                collection: collection.to_owned(),
            }),
        })
    }

    async fn take_front(
        &self,
        collection: &str,
        filter: &Document,
        field: &str,
        n: usize,
    ) -> StoreResult<TakeOutcome> {
        self.enter().await?;
        self.with_collection(collection, |coll| {
            let Some(idx) = coll.position(filter) else {
                return Ok(TakeOutcome::Missing);
            };
            let items = int_array(&mut coll.documents[idx], field)?;
            if items.len() < n {
                return Ok(TakeOutcome::Insufficient {
                    available: items.len(),
                });
            }
            // Parse before draining so a malformed array is left as it was.
            let taken = items[..n]
                .iter()
                .map(|value| as_int(value, field))
                .collect::<StoreResult<Vec<_>>>()?;
            items.drain(..n);
            Ok(TakeOutcome::Taken(taken))
        })
    }

    async fn insert_sorted(
        &self,
        collection: &str,
        filter: &Document,
        field: &str,
        value: i64,
    ) -> StoreResult<InsertSorted> {
        self.enter().await?;
        self.with_collection(collection, |coll| {
            let Some(idx) = coll.position(filter) else {
                return Ok(InsertSorted::Missing);
            };
            let items = int_array(&mut coll.documents[idx], field)?;
            let mut position = None;
            for (i, item) in items.iter().enumerate() {
                let current = as_int(item, field)?;
                if current == value {
                    return Ok(InsertSorted::AlreadyPresent);
                }
                if current > value {
                    position = Some(i);
                    break;
                }
            }
            items.insert(position.unwrap_or(items.len()), Value::from(value));
            Ok(InsertSorted::Inserted)
        })
    }
}
