use futures::TryStreamExt;
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{self, Bson, Document as BsonDocument, doc},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{ClientOptions, IndexOptions, ReturnDocument},
};
use serde_json::Value;

use crate::store::{
    Document, DocumentStore, InsertOutcome, InsertSorted, PatchOperation, StoreError, StoreResult,
    TakeOutcome, interface::apply_json_patch,
};

/// Server error code for a unique index violation.
const DUPLICATE_KEY: i32 = 11000;

/// Read-patch-replace rounds a JSON patch gets before giving up on a
/// document that keeps changing underneath it.
const JSON_PATCH_ATTEMPTS: usize = 8;

/// A [`DocumentStore`] backed by a MongoDB database.
///
/// Each trait operation is one single-document MongoDB command
/// (`findOneAndUpdate`, `insertOne`, `updateOne` with `upsert`, ...), so the
/// server's per-document atomicity is all the allocator relies on. The only
/// extra reads are made after a conditional update matched nothing, to tell a
/// missing document apart from an unmet condition.
///
/// JSON patch has no server-side equivalent. It reads the document, patches it
/// locally and replaces it only if it still equals what was read, retrying a
/// few times if another writer got there first.
#[derive(Clone, Debug)]
pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    /// Connects to `url`, selects `database` and pings it once.
    ///
    /// Wrap this in [`connect_with_retry`](crate::store::connect_with_retry)
    /// to wait for a server that is still starting.
    pub async fn connect(url: &str, database: &str) -> StoreResult<Self> {
        let options = ClientOptions::parse(url).await.map_err(map_err)?;
        let client = Client::with_options(options).map_err(map_err)?;
        let database = client.database(database);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(map_err)?;
        Ok(Self { database })
    }

    /// Wraps an already configured database handle.
    pub fn from_database(database: Database) -> Self {
        Self { database }
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.database.collection(name)
    }
}

fn map_err(err: MongoError) -> StoreError {
    match err.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => StoreError::Unavailable {
            context: err.to_string(),
        },
        _ => StoreError::Backend {
            context: err.to_string(),
        },
    }
}

fn is_duplicate_key(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY
        }
        _ => false,
    }
}

fn to_bson(doc: &Document) -> StoreResult<BsonDocument> {
    bson::to_document(doc).map_err(|err| StoreError::malformed(err.to_string()))
}

fn from_bson(doc: BsonDocument) -> StoreResult<Document> {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::malformed("expected a document")),
    }
}

fn bson_int(value: &Bson, field: &str) -> StoreResult<i64> {
    match value {
        Bson::Int64(v) => Ok(*v),
        Bson::Int32(v) => Ok(i64::from(*v)),
        _ => Err(StoreError::malformed(format!(
            "`{field}` holds a non-integer value"
        ))),
    }
}

fn array_len(doc: &BsonDocument, field: &str) -> usize {
    doc.get_array(field).map_or(0, Vec::len)
}

/// Flattens an RFC 7396 merge patch into `$set` / `$unset` paths.
fn flatten_patch(
    prefix: &str,
    patch: &Document,
    set: &mut BsonDocument,
    unset: &mut BsonDocument,
) -> StoreResult<()> {
    for (key, value) in patch {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Null => {
                unset.insert(path, "");
            }
            Value::Object(inner) => flatten_patch(&path, inner, set, unset)?,
            other => {
                let value =
                    bson::to_bson(other).map_err(|err| StoreError::malformed(err.to_string()))?;
                set.insert(path, value);
            }
        }
    }
    Ok(())
}

impl DocumentStore for MongoStore {
    async fn get_one(&self, collection: &str, filter: &Document) -> StoreResult<Option<Document>> {
        self.collection(collection)
            .find_one(to_bson(filter)?)
            .await
            .map_err(map_err)?
            .map(from_bson)
            .transpose()
    }

    async fn get_many(&self, collection: &str, filter: &Document) -> StoreResult<Vec<Document>> {
        let cursor = self
            .collection(collection)
            .find(to_bson(filter)?)
            .await
            .map_err(map_err)?;
        let docs: Vec<BsonDocument> = cursor.try_collect().await.map_err(map_err)?;
        docs.into_iter().map(from_bson).collect()
    }

    async fn put_one(
        &self,
        collection: &str,
        filter: &Document,
        data: &Document,
    ) -> StoreResult<bool> {
        let mut replacement = to_bson(filter)?;
        for (key, value) in to_bson(data)? {
            replacement.insert(key, value);
        }
        let result = self
            .collection(collection)
            .replace_one(to_bson(filter)?, replacement)
            .upsert(true)
            .await
            .map_err(map_err)?;
        Ok(result.matched_count > 0)
    }

    async fn put_one_not_update(
        &self,
        collection: &str,
        filter: &Document,
        data: &Document,
    ) -> StoreResult<bool> {
        let result = self
            .collection(collection)
            .update_one(to_bson(filter)?, doc! { "$setOnInsert": to_bson(data)? })
            .upsert(true)
            .await
            .map_err(map_err)?;
        Ok(result.matched_count > 0)
    }

    async fn insert_unique(
        &self,
        collection: &str,
        document: &Document,
    ) -> StoreResult<InsertOutcome> {
        match self
            .collection(collection)
            .insert_one(to_bson(document)?)
            .await
        {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_duplicate_key(&err) => Ok(InsertOutcome::Duplicate),
            Err(err) => Err(map_err(err)),
        }
    }

    async fn create_index(&self, collection: &str, keys: &[&str]) -> StoreResult<()> {
        let mut spec = BsonDocument::new();
        for key in keys {
            spec.insert(*key, 1);
        }
        let index = IndexModel::builder()
            .keys(spec)
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.collection(collection)
            .create_index(index)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn increment(
        &self,
        collection: &str,
        filter: &Document,
        field: &str,
        by: i64,
    ) -> StoreResult<i64> {
        let mut inc = BsonDocument::new();
        inc.insert(field, by);
        let updated = self
            .collection(collection)
            .find_one_and_update(to_bson(filter)?, doc! { "$inc": inc })
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(map_err)?
            .ok_or_else(|| StoreError::malformed("upsert returned no document"))?;
        let value = updated
            .get(field)
            .ok_or_else(|| StoreError::malformed(format!("`{field}` missing after $inc")))?;
        bson_int(value, field)
    }

    async fn delete_one(&self, collection: &str, filter: &Document) -> StoreResult<bool> {
        let result = self
            .collection(collection)
            .delete_one(to_bson(filter)?)
            .await
            .map_err(map_err)?;
        Ok(result.deleted_count > 0)
    }

    async fn delete_many(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        let result = self
            .collection(collection)
            .delete_many(to_bson(filter)?)
            .await
            .map_err(map_err)?;
        Ok(result.deleted_count)
    }

    async fn merge_patch(
        &self,
        collection: &str,
        filter: &Document,
        patch: &Document,
    ) -> StoreResult<()> {
        let mut set = BsonDocument::new();
        let mut unset = BsonDocument::new();
        flatten_patch("", patch, &mut set, &mut unset)?;

        let mut update = BsonDocument::new();
        if !set.is_empty() {
            update.insert("$set", set);
        }
        if !unset.is_empty() {
            update.insert("$unset", unset);
        }

        let matched = if update.is_empty() {
            self.get_one(collection, filter).await?.is_some()
        } else {
            let result = self
                .collection(collection)
                .update_one(to_bson(filter)?, update)
                .await
                .map_err(map_err)?;
            result.matched_count > 0
        };

        if matched {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                collection: collection.to_owned(),
            })
        }
    }

    async fn json_patch(
        &self,
        collection: &str,
        filter: &Document,
        patch: &[PatchOperation],
    ) -> StoreResult<()> {
        let coll = self.collection(collection);
        for _ in 0..JSON_PATCH_ATTEMPTS {
            let Some(current) = coll.find_one(to_bson(filter)?).await.map_err(map_err)? else {
                return Err(StoreError::NotFound {
                    collection: collection.to_owned(),
                });
            };
            let mut patched = from_bson(current.clone())?;
            apply_json_patch(&mut patched, patch)?;

            // The whole document as read is the filter, so a concurrent
            // write makes the replace match nothing.
            let result = coll
                .replace_one(current, to_bson(&patched)?)
                .await
                .map_err(map_err)?;
            if result.matched_count > 0 {
                return Ok(());
            }
        }
        Err(StoreError::Backend {
            context: format!(
                "document in `{collection}` kept changing across {JSON_PATCH_ATTEMPTS} json patch attempts"
            ),
        })
    }

    async fn take_front(
        &self,
        collection: &str,
        filter: &Document,
        field: &str,
        n: usize,
    ) -> StoreResult<TakeOutcome> {
        if n == 0 {
            return Ok(match self.get_one(collection, filter).await? {
                Some(_) => TakeOutcome::Taken(Vec::new()),
                None => TakeOutcome::Missing,
            });
        }
        let count = i64::try_from(n).map_err(|_| StoreError::malformed("take count too large"))?;

        // Only match when element `n - 1` exists, so the update is all or
        // nothing.
        let mut guarded = to_bson(filter)?;
        guarded.insert(format!("{field}.{}", n - 1), doc! { "$exists": true });

        let source = format!("${field}");
        let size = doc! { "$size": { "$ifNull": [source.clone(), []] } };
        let remaining = doc! { "$slice": [source, count, { "$max": [1_i64, size] }] };
        let mut set = BsonDocument::new();
        set.insert(field, remaining);

        let before = self
            .collection(collection)
            .find_one_and_update(guarded, vec![doc! { "$set": set }])
            .return_document(ReturnDocument::Before)
            .await
            .map_err(map_err)?;

        match before {
            Some(doc) => {
                let items = doc
                    .get_array(field)
                    .map_err(|err| StoreError::malformed(err.to_string()))?;
                items
                    .iter()
                    .take(n)
                    .map(|value| bson_int(value, field))
                    .collect::<StoreResult<Vec<_>>>()
                    .map(TakeOutcome::Taken)
            }
            None => {
                let current = self
                    .collection(collection)
                    .find_one(to_bson(filter)?)
                    .await
                    .map_err(map_err)?;
                Ok(match current {
                    Some(doc) => TakeOutcome::Insufficient {
                        available: array_len(&doc, field),
                    },
                    None => TakeOutcome::Missing,
                })
            }
        }
    }

    async fn insert_sorted(
        &self,
        collection: &str,
        filter: &Document,
        field: &str,
        value: i64,
    ) -> StoreResult<InsertSorted> {
        let mut guarded = to_bson(filter)?;
        guarded.insert(field, doc! { "$ne": value });
        let mut push = BsonDocument::new();
        push.insert(field, doc! { "$each": [value], "$sort": 1 });

        let result = self
            .collection(collection)
            .update_one(guarded, doc! { "$push": push })
            .await
            .map_err(map_err)?;
        if result.modified_count > 0 {
            return Ok(InsertSorted::Inserted);
        }

        Ok(match self.get_one(collection, filter).await? {
            Some(_) => InsertSorted::AlreadyPresent,
            None => InsertSorted::Missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::document;
    use serde_json::json;

    #[test]
    fn merge_patch_flattens_to_dotted_paths() {
        let patch = document(json!({
            "a": 1,
            "b": { "c": null, "d": "x" },
            "e": null
        }));
        let mut set = BsonDocument::new();
        let mut unset = BsonDocument::new();
        flatten_patch("", &patch, &mut set, &mut unset).unwrap();

        assert_eq!(set, doc! { "a": 1_i64, "b.d": "x" });
        assert_eq!(unset, doc! { "b.c": "", "e": "" });
    }

    #[test]
    fn documents_round_trip_through_bson() {
        let original = document(json!({ "_id": "pool1", "min": 1, "free": [1, 2, 3] }));
        let back = from_bson(to_bson(&original).unwrap()).unwrap();
        assert_eq!(back, original);
    }
}
