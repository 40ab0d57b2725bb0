use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;

use crate::engine::{BlobStore, Collection};
use crate::{Backend, CollectionReader, CollectionWriter, Error, Key, Result};

/// Blob key holding the fallback backend's data.
pub const DATA_KEY: &str = "novelWriterData";
/// Where an unreadable data blob is set aside before starting empty.
pub const CORRUPT_KEY: &str = "novelWriterData-corrupt";

type StoreData = HashMap<String, Vec<Value>>;

/// Emulates the collection contract on top of a single [`BlobStore`] entry.
///
/// All collections live in memory as `{ collectionName: [record, ...] }` and the
/// whole map is written back to the blob synchronously on every mutation. A
/// mutation whose write fails leaves the in-memory state untouched.
pub struct FallbackBackend {
    data: RwLock<StoreData>,
    blobs: Arc<dyn BlobStore>,
}

impl FallbackBackend {
    /// Loads the data blob from `blobs`, starting empty if none exists.
    ///
    /// An unreadable blob is copied to [`CORRUPT_KEY`] and the backend starts empty.
    pub fn load(blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let data = match blobs.get(DATA_KEY)? {
            Some(raw) => match serde_json::from_str::<StoreData>(&raw) {
                Ok(d) => d,
                Err(e) => {
                    warn!(
                        "Could not unmarshal fallback data blob {}, moving it to {}: {}",
                        DATA_KEY, CORRUPT_KEY, e
                    );
                    blobs.set(CORRUPT_KEY, &raw)?;
                    blobs.remove(DATA_KEY)?;
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        Ok(Self {
            data: RwLock::new(data),
            blobs,
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreData>> {
        self.data
            .read()
            .map_err(|_| Error::Internal("fallback lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreData>> {
        self.data
            .write()
            .map_err(|_| Error::Internal("fallback lock poisoned".to_string()))
    }

    /// Applies `f` to a copy of one collection, persists the whole map with the
    /// copy swapped in, and only then commits it.
    fn mutate<T, F>(&self, collection: Collection, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Value>) -> Result<T>,
    {
        let mut data = self.write()?;
        let name = collection.name().to_string();
        let mut records = data.get(&name).cloned().unwrap_or_default();
        let out = f(&mut records)?;

        let previous = data.insert(name.clone(), records);
        let flushed = serde_json::to_string(&*data)
            .map_err(Error::from)
            .and_then(|raw| self.blobs.set(DATA_KEY, &raw));

        if let Err(e) = flushed {
            match previous {
                Some(records) => data.insert(name, records),
                None => data.remove(&name),
            };
            return Err(e);
        }

        debug!("fallback: persisted {} ({} records)", collection, data.get(&name).map_or(0, Vec::len));
        Ok(out)
    }
}

/// Picks an id that is above every existing id and, when the clock allows,
/// equal to the current time in milliseconds.
fn next_id(collection: Collection, records: &[Value]) -> Result<i64> {
    let max = records
        .iter()
        .filter_map(|r| collection.key_of(r)?.as_id())
        .max()
        .unwrap_or(0);
    let above = max
        .checked_add(1)
        .ok_or_else(|| Error::InvalidRecord(format!("no id left above {} in {}", max, collection)))?;
    Ok(chrono::Utc::now().timestamp_millis().max(above))
}

fn position(collection: Collection, records: &[Value], key: &Key) -> Option<usize> {
    records
        .iter()
        .position(|r| collection.key_of(r).as_ref() == Some(key))
}

fn assign_id(collection: Collection, records: &[Value], record: &mut Value) -> Result<Key> {
    let id = next_id(collection, records)?;
    record[collection.key_path()] = Value::from(id);
    Ok(Key::Id(id))
}

/// Equality used for index lookups. Numbers compare by value so `1` matches `1.0`.
pub(crate) fn index_matches(field: Option<&Value>, wanted: &Value) -> bool {
    match (field, wanted) {
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(a), b) => a == b,
        (None, _) => false,
    }
}

#[async_trait]
impl CollectionReader for FallbackBackend {
    async fn get(&self, collection: Collection, key: &Key) -> Result<Option<Value>> {
        let data = self.read()?;
        Ok(data
            .get(collection.name())
            .and_then(|records| records.iter().find(|r| collection.key_of(r).as_ref() == Some(key)))
            .cloned())
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        let data = self.read()?;
        Ok(data.get(collection.name()).cloned().unwrap_or_default())
    }

    async fn get_all_by_index(&self, collection: Collection, index: &str, value: &Value) -> Result<Vec<Value>> {
        collection.check_index(index)?;
        let data = self.read()?;
        Ok(data
            .get(collection.name())
            .map(|records| {
                records
                    .iter()
                    .filter(|r| index_matches(r.get(index), value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl CollectionWriter for FallbackBackend {
    async fn add(&self, collection: Collection, mut record: Value) -> Result<Value> {
        let key = collection.check_record(&record)?;
        self.mutate(collection, |records| {
            match key {
                Some(key) => {
                    if position(collection, records, &key).is_some() {
                        return Err(collection.duplicate(&key));
                    }
                }
                None => {
                    assign_id(collection, records, &mut record)?;
                }
            }
            records.push(record.clone());
            Ok(record)
        })
    }

    async fn update(&self, collection: Collection, mut record: Value) -> Result<Value> {
        let key = collection.check_record(&record)?;
        self.mutate(collection, |records| {
            let key = match key {
                Some(key) => key,
                None => assign_id(collection, records, &mut record)?,
            };
            match position(collection, records, &key) {
                Some(i) => records[i] = record.clone(),
                None => records.push(record.clone()),
            }
            Ok(record)
        })
    }

    async fn delete(&self, collection: Collection, key: &Key) -> Result<()> {
        self.mutate(collection, |records| {
            records.retain(|r| collection.key_of(r).as_ref() != Some(key));
            Ok(())
        })
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        self.mutate(collection, |records| {
            records.clear();
            Ok(())
        })
    }
}

impl Backend for FallbackBackend {
    fn name(&self) -> &'static str {
        "fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryBlobStore;
    use serde_json::json;

    fn backend() -> (Arc<MemoryBlobStore>, FallbackBackend) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let backend = FallbackBackend::load(blobs.clone()).unwrap();
        (blobs, backend)
    }

    #[tokio::test]
    async fn test_add_assigns_increasing_ids() {
        let (_, store) = backend();
        let a = store.add(Collection::Chapters, json!({"title": "A"})).await.unwrap();
        let b = store.add(Collection::Chapters, json!({"title": "B"})).await.unwrap();

        let id_a = a["id"].as_i64().unwrap();
        let id_b = b["id"].as_i64().unwrap();
        assert!(id_b > id_a);
        assert_eq!(store.get(Collection::Chapters, &Key::Id(id_a)).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_keys() {
        let (_, store) = backend();
        store.add(Collection::Settings, json!({"key": "theme", "value": "dark"})).await.unwrap();
        let res = store.add(Collection::Settings, json!({"key": "theme", "value": "light"})).await;
        assert!(matches!(res, Err(Error::DuplicateKey { .. })));
    }

    #[tokio::test]
    async fn test_update_replaces_or_appends() {
        let (_, store) = backend();
        let a = store.add(Collection::Chapters, json!({"title": "A", "content": "x"})).await.unwrap();
        let id = a["id"].clone();

        store.update(Collection::Chapters, json!({"id": id.clone(), "title": "B"})).await.unwrap();
        let got = store.get(Collection::Chapters, &Key::from_json(&id).unwrap()).await.unwrap().unwrap();
        assert_eq!(got["title"], json!("B"));
        assert!(got.get("content").is_none());

        store.update(Collection::Stats, json!({"date": "2024-05-01", "wordCount": 10})).await.unwrap();
        assert_eq!(store.get_all(Collection::Stats).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let (_, store) = backend();
        store.add(Collection::Goals, json!({"title": "Draft"})).await.unwrap();
        store.delete(Collection::Goals, &Key::Id(424242)).await.unwrap();
        assert_eq!(store.get_all(Collection::Goals).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_index_filter() {
        let (_, store) = backend();
        for chapter in [1, 1, 2] {
            store.add(Collection::Scenes, json!({"chapterId": chapter})).await.unwrap();
        }
        assert_eq!(store.get_all_by_index(Collection::Scenes, "chapterId", &json!(1)).await.unwrap().len(), 2);
        assert_eq!(store.get_all_by_index(Collection::Scenes, "chapterId", &json!(2.0)).await.unwrap().len(), 1);
        assert!(matches!(
            store.get_all_by_index(Collection::Scenes, "title", &json!("x")).await,
            Err(Error::UnknownIndex { .. })
        ));
    }

    #[tokio::test]
    async fn test_reload_from_blob() {
        let (blobs, store) = backend();
        store.add(Collection::Research, json!({"title": "Ships"})).await.unwrap();
        store.update(Collection::Settings, json!({"key": "theme", "value": "dark"})).await.unwrap();
        drop(store);

        let reloaded = FallbackBackend::load(blobs).unwrap();
        assert_eq!(reloaded.get_all(Collection::Research).await.unwrap().len(), 1);
        let theme = reloaded.get(Collection::Settings, &Key::from("theme")).await.unwrap().unwrap();
        assert_eq!(theme["value"], json!("dark"));
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_set_aside() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.set(DATA_KEY, "not json").unwrap();
        let store = FallbackBackend::load(blobs.clone()).unwrap();
        assert!(store.get_all(Collection::Chapters).await.unwrap().is_empty());

        store.add(Collection::Chapters, json!({"title": "Fresh"})).await.unwrap();
        assert_eq!(blobs.get(CORRUPT_KEY).unwrap().as_deref(), Some("not json"));
    }

    #[tokio::test]
    async fn test_id_space_exhausted() {
        let (_, store) = backend();
        store.add(Collection::Chapters, json!({"id": i64::MAX, "title": "x"})).await.unwrap();
        let res = store.add(Collection::Chapters, json!({"title": "y"})).await;
        assert!(matches!(res, Err(Error::InvalidRecord(_))));
        assert_eq!(store.get_all(Collection::Chapters).await.unwrap().len(), 1);
    }

    struct BrokenBlobs;

    impl BlobStore for BrokenBlobs {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(Error::Internal("quota exceeded".into()))
        }
        fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_write_is_not_committed() {
        let store = FallbackBackend::load(Arc::new(BrokenBlobs)).unwrap();
        assert!(store.add(Collection::Chapters, json!({"title": "A"})).await.is_err());
        assert!(store.get_all(Collection::Chapters).await.unwrap().is_empty());
    }
}
