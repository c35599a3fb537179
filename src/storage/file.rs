use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::Storage;
use crate::error::{Error, Result};

const DB_FILE: &str = "ferry.db";
const TABLE_PREFIX: &str = "bucket_";
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Durable storage in a single SQLite database with one table per bucket.
///
/// Writes touch only the affected row, so progress updates stay cheap no
/// matter how many tasks are stored.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    db: Mutex<Option<Db>>,
}

#[derive(Debug)]
struct Db {
    conn: Connection,
    buckets: HashSet<String>,
}

impl Db {
    fn table(&self, bucket: &str) -> Result<String> {
        if self.buckets.contains(bucket) {
            Ok(table_name(bucket))
        } else {
            Err(Error::BucketNotFound(bucket.to_string()))
        }
    }
}

fn table_name(bucket: &str) -> String {
    format!("\"{}{}\"", TABLE_PREFIX, bucket)
}

fn valid_bucket(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FileStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(DB_FILE);

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let buckets = {
            let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            names
                .into_iter()
                .filter_map(|name| name.strip_prefix(TABLE_PREFIX).map(str::to_string))
                .collect::<HashSet<_>>()
        };
        debug!("opened storage at {:?} ({} buckets)", path, buckets.len());

        Ok(Self {
            path,
            db: Mutex::new(Some(Db { conn, buckets })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(&self, f: impl FnOnce(&mut Db) -> Result<T>) -> Result<T> {
        let mut guard = self.db.lock();
        let db = guard.as_mut().ok_or(Error::StorageClosed)?;
        f(db)
    }

    /// The database plus its write-ahead log and shared-memory files.
    fn files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.path.clone()];
        for suffix in ["-wal", "-shm"] {
            let mut name = OsString::from(self.path.as_os_str());
            name.push(suffix);
            files.push(PathBuf::from(name));
        }
        files
    }
}

impl Storage for FileStorage {
    fn setup(&self, names: &[&str]) -> Result<()> {
        self.with_db(|db| {
            for name in names {
                if !valid_bucket(name) {
                    return Err(Error::InvalidBucket(name.to_string()));
                }
                if db.buckets.contains(*name) {
                    continue;
                }
                db.conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)",
                    table_name(name)
                ))?;
                db.buckets.insert(name.to_string());
            }
            Ok(())
        })
    }

    fn put(&self, bucket: &str, key: &str, value: Value) -> Result<()> {
        self.with_db(|db| {
            let table = db.table(bucket)?;
            let text = serde_json::to_string(&value)?;
            db.conn
                .prepare_cached(&format!(
                    "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                    table
                ))?
                .execute(params![key, text])?;
            Ok(())
        })
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>> {
        self.with_db(|db| {
            let table = db.table(bucket)?;
            let text: Option<String> = db
                .conn
                .prepare_cached(&format!("SELECT value FROM {} WHERE key = ?1", table))?
                .query_row([key], |row| row.get(0))
                .optional()?;
            Ok(text.map(|t| serde_json::from_str(&t)).transpose()?)
        })
    }

    fn list(&self, bucket: &str) -> Result<Vec<Value>> {
        self.with_db(|db| {
            let table = db.table(bucket)?;
            let mut stmt = db
                .conn
                .prepare_cached(&format!("SELECT value FROM {}", table))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut values = Vec::new();
            for row in rows {
                values.push(serde_json::from_str(&row?)?);
            }
            Ok(values)
        })
    }

    fn pop(&self, bucket: &str, key: &str) -> Result<Option<Value>> {
        self.with_db(|db| {
            let table = db.table(bucket)?;
            let tx = db.conn.transaction()?;
            let text: Option<String> = tx
                .query_row(
                    &format!("SELECT value FROM {} WHERE key = ?1", table),
                    [key],
                    |row| row.get(0),
                )
                .optional()?;
            if text.is_some() {
                tx.execute(&format!("DELETE FROM {} WHERE key = ?1", table), [key])?;
            }
            tx.commit()?;
            Ok(text.map(|t| serde_json::from_str(&t)).transpose()?)
        })
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.with_db(|db| {
            if !db.buckets.contains(bucket) {
                return Ok(());
            }
            db.conn
                .prepare_cached(&format!("DELETE FROM {} WHERE key = ?1", table_name(bucket)))?
                .execute([key])?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        let db = self.db.lock().take();
        if let Some(db) = db {
            db.conn.close().map_err(|(_, e)| e)?;
            debug!("closed storage at {:?}", self.path);
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let db = self.db.lock().take();
        if let Some(db) = db {
            if let Err((_, e)) = db.conn.close() {
                warn!("failed to close storage before clearing: {}", e);
            }
        }
        for file in self.files() {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
