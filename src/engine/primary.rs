use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::info;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;

use crate::engine::Collection;
use crate::{Backend, CollectionReader, CollectionWriter, Error, Key, Result};

/// Schema version recorded in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// The indexed primary backend, one SQLite table per collection.
///
/// Records are stored as JSON text in a `body` column next to their key.
/// Auto-keyed collections use an `AUTOINCREMENT` integer `id`; `settings` and
/// `stats` use an explicit text `key`. Each declared secondary index is an
/// expression index over `json_extract(body, '$.<field>')`.
///
/// The connection is guarded by a mutex and every call runs on the blocking
/// pool inside its own short transaction, so calls from one caller are applied
/// in issue order.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Opens (or creates) the database file and defines the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let backend = Self::init(conn)?;
        info!("Opened primary database at {:?}", path);
        Ok(backend)
    }

    /// Opens a private in-memory database with the same schema.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(Error::Initialization(format!(
                "database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }

        let mut ddl = String::new();
        for collection in Collection::ALL {
            let key_def = if collection.auto_increment() {
                "id INTEGER PRIMARY KEY AUTOINCREMENT"
            } else {
                "key TEXT PRIMARY KEY NOT NULL"
            };
            ddl.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {} ({}, body TEXT NOT NULL);\n",
                table(collection),
                key_def
            ));
            for index in collection.indexes() {
                if *index == collection.key_path() {
                    continue;
                }
                ddl.push_str(&format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_{name}_{index}\" ON {table} ({expr});\n",
                    name = collection.name(),
                    index = index,
                    table = table(collection),
                    expr = index_expr(index),
                ));
            }
        }
        conn.execute_batch(&ddl)?;

        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| Error::Internal("sqlite connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("sqlite task failed: {}", e)))?
    }
}

fn table(collection: Collection) -> String {
    format!("\"{}\"", collection.name())
}

fn key_column(collection: Collection) -> &'static str {
    if collection.auto_increment() {
        "id"
    } else {
        "key"
    }
}

fn index_expr(index: &str) -> String {
    format!("json_extract(body, '$.{}')", index)
}

fn key_sql(key: &Key) -> SqlValue {
    match key {
        Key::Id(id) => SqlValue::Integer(*id),
        Key::Name(name) => SqlValue::Text(name.clone()),
    }
}

/// Converts a JSON value to what `json_extract` yields for an equal field.
fn json_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn exists(tx: &Transaction<'_>, collection: Collection, key: &Key) -> Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE {} = ?1", table(collection), key_column(collection));
    Ok(tx
        .query_row(&sql, params![key_sql(key)], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Inserts a record without a key and writes the generated id back into its body.
fn insert_generated(tx: &Transaction<'_>, collection: Collection, record: &mut Value) -> Result<()> {
    let sql = format!("INSERT INTO {} (body) VALUES ('{{}}')", table(collection));
    tx.execute(&sql, [])?;
    let id = tx.last_insert_rowid();
    record[collection.key_path()] = Value::from(id);

    let sql = format!("UPDATE {} SET body = ?1 WHERE id = ?2", table(collection));
    tx.execute(&sql, params![serde_json::to_string(record)?, id])?;
    Ok(())
}

fn upsert(tx: &Transaction<'_>, collection: Collection, key: &Key, record: &Value) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}, body) VALUES (?1, ?2)",
        table(collection),
        key_column(collection)
    );
    tx.execute(&sql, params![key_sql(key), serde_json::to_string(record)?])?;
    Ok(())
}

fn collect_bodies(conn: &Connection, sql: &str, param: Option<SqlValue>) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = match param {
        Some(p) => stmt
            .query_map(params![p], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        None => stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?,
    };
    rows.iter()
        .map(|body| serde_json::from_str(body).map_err(Error::from))
        .collect()
}

#[async_trait]
impl CollectionReader for SqliteBackend {
    async fn get(&self, collection: Collection, key: &Key) -> Result<Option<Value>> {
        let key = key_sql(key);
        self.run(move |conn| {
            let sql = format!("SELECT body FROM {} WHERE {} = ?1", table(collection), key_column(collection));
            let body: Option<String> = conn
                .query_row(&sql, params![key], |row| row.get(0))
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(Error::from))
                .transpose()
        })
        .await
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        self.run(move |conn| {
            let sql = format!("SELECT body FROM {} ORDER BY {}", table(collection), key_column(collection));
            collect_bodies(conn, &sql, None)
        })
        .await
    }

    async fn get_all_by_index(&self, collection: Collection, index: &str, value: &Value) -> Result<Vec<Value>> {
        collection.check_index(index)?;
        let sql = format!(
            "SELECT body FROM {} WHERE {} = ?1 ORDER BY {}",
            table(collection),
            index_expr(index),
            key_column(collection)
        );
        let value = json_sql(value);
        self.run(move |conn| collect_bodies(conn, &sql, Some(value))).await
    }
}

#[async_trait]
impl CollectionWriter for SqliteBackend {
    async fn add(&self, collection: Collection, mut record: Value) -> Result<Value> {
        let key = collection.check_record(&record)?;
        self.run(move |conn| {
            let tx = conn.transaction()?;
            match &key {
                Some(key) => {
                    if exists(&tx, collection, key)? {
                        return Err(collection.duplicate(key));
                    }
                    upsert(&tx, collection, key, &record)?;
                }
                None => insert_generated(&tx, collection, &mut record)?,
            }
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn update(&self, collection: Collection, mut record: Value) -> Result<Value> {
        let key = collection.check_record(&record)?;
        self.run(move |conn| {
            let tx = conn.transaction()?;
            match &key {
                Some(key) => upsert(&tx, collection, key, &record)?,
                None => insert_generated(&tx, collection, &mut record)?,
            }
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn delete(&self, collection: Collection, key: &Key) -> Result<()> {
        let key = key_sql(key);
        self.run(move |conn| {
            let sql = format!("DELETE FROM {} WHERE {} = ?1", table(collection), key_column(collection));
            conn.execute(&sql, params![key])?;
            Ok(())
        })
        .await
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        self.run(move |conn| {
            conn.execute(&format!("DELETE FROM {}", table(collection)), [])?;
            Ok(())
        })
        .await
    }
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_add_get_round_trip() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let added = db
            .add(Collection::Chapters, json!({"title": "Prologue", "order": 0}))
            .await
            .unwrap();
        let id = added["id"].as_i64().unwrap();

        let got = db.get(Collection::Chapters, &Key::Id(id)).await.unwrap().unwrap();
        assert_eq!(got, added);
        assert_eq!(got["title"], json!("Prologue"));
    }

    #[tokio::test]
    async fn test_add_duplicate_explicit_key() {
        let db = SqliteBackend::open_in_memory().unwrap();
        db.add(Collection::Stats, json!({"date": "2024-03-01", "wordCount": 5})).await.unwrap();
        let res = db.add(Collection::Stats, json!({"date": "2024-03-01", "wordCount": 9})).await;
        assert!(matches!(res, Err(Error::DuplicateKey { .. })));

        let added = db.add(Collection::Chapters, json!({"title": "A"})).await.unwrap();
        let res = db.add(Collection::Chapters, added).await;
        assert!(matches!(res, Err(Error::DuplicateKey { .. })));
    }

    #[tokio::test]
    async fn test_update_is_full_replace() {
        let db = SqliteBackend::open_in_memory().unwrap();
        db.add(Collection::Chapters, json!({"id": 1, "title": "A", "content": "x"})).await.unwrap();
        db.update(Collection::Chapters, json!({"id": 1, "title": "B"})).await.unwrap();

        let got = db.get(Collection::Chapters, &Key::Id(1)).await.unwrap().unwrap();
        assert_eq!(got, json!({"id": 1, "title": "B"}));
    }

    #[tokio::test]
    async fn test_index_lookup() {
        let db = SqliteBackend::open_in_memory().unwrap();
        for chapter in [1, 1, 2] {
            db.add(Collection::Scenes, json!({"chapterId": chapter, "order": 0})).await.unwrap();
        }
        let first = db.get_all_by_index(Collection::Scenes, "chapterId", &json!(1)).await.unwrap();
        let second = db.get_all_by_index(Collection::Scenes, "chapterId", &json!(2)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);

        db.add(Collection::Timeline, json!({"title": "Coronation", "date": "1066-12-25"})).await.unwrap();
        let events = db
            .get_all_by_index(Collection::Timeline, "date", &json!("1066-12-25"))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        assert!(matches!(
            db.get_all_by_index(Collection::Goals, "order", &json!(0)).await,
            Err(Error::UnknownIndex { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let a = db.add(Collection::Characters, json!({"name": "Ada"})).await.unwrap();
        db.add(Collection::Characters, json!({"name": "Bo"})).await.unwrap();

        db.delete(Collection::Characters, &Key::Id(9999)).await.unwrap();
        assert_eq!(db.get_all(Collection::Characters).await.unwrap().len(), 2);

        db.delete(Collection::Characters, &Key::from_json(&a["id"]).unwrap()).await.unwrap();
        assert_eq!(db.get_all(Collection::Characters).await.unwrap().len(), 1);

        db.clear(Collection::Characters).await.unwrap();
        assert!(db.get_all(Collection::Characters).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_keeps_data_and_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("novel.db");
        {
            let db = SqliteBackend::open(&path).unwrap();
            db.update(Collection::Settings, json!({"key": "theme", "value": "dark"})).await.unwrap();
        }

        let db = SqliteBackend::open(&path).unwrap();
        let theme = db.get(Collection::Settings, &Key::from("theme")).await.unwrap().unwrap();
        assert_eq!(theme["value"], json!("dark"));

        let conn = Connection::open(&path).unwrap();
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("novel.db");
        let conn = Connection::open(&path).unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        drop(conn);

        assert!(matches!(SqliteBackend::open(&path), Err(Error::Initialization(_))));
    }
}
