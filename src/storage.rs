use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone)]
pub struct MediaEntry {
    pub id: i64,
    pub url: String,
    pub media_type: String,
    pub file_path: String,
    pub width: i64,
    pub height: i64,
    pub size_bytes: i64,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope<T> {
    stored_at: i64,
    data: T,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "foreign_keys", &"ON")
            .context("storage: enable foreign keys")?;
        conn.pragma_update(None, "busy_timeout", &5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn put_kv(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            bail!("storage: kv key required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO kv (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET
  value = excluded.value,
  updated_at = excluded.updated_at
"#,
            params![key, value, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("storage: query kv")
    }

    pub fn delete_kv(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Store an API payload under `cache:<resource>` with its write time.
    pub fn put_cache<T: Serialize>(&self, resource: &str, data: &T) -> Result<()> {
        let envelope = CacheEnvelope {
            stored_at: Utc::now().timestamp(),
            data,
        };
        let body = serde_json::to_string(&envelope)
            .with_context(|| format!("storage: encode cache {resource}"))?;
        self.put_kv(&cache_key(resource), &body)
    }

    /// Fetch a cached payload if it is still within `ttl`. Stale or
    /// undecodable entries are deleted on the way out.
    pub fn get_cache<T: DeserializeOwned>(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<T>> {
        let key = cache_key(resource);
        let Some(body) = self.get_kv(&key)? else {
            return Ok(None);
        };
        let envelope: CacheEnvelope<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) => {
                self.delete_kv(&key)?;
                return Ok(None);
            }
        };
        let age = Utc::now().timestamp() - envelope.stored_at;
        if age > ttl.as_secs() as i64 {
            self.delete_kv(&key)?;
            return Ok(None);
        }
        Ok(Some(envelope.data))
    }

    pub fn upsert_media_entry(&self, mut entry: MediaEntry) -> Result<i64> {
        if entry.url.is_empty() {
            bail!("storage: media url required");
        }
        if entry.fetched_at.timestamp() == 0 {
            entry.fetched_at = Utc::now();
        }
        let expires = entry.expires_at.map(|dt| dt.timestamp());
        let conn = self.conn.lock();
        let id: i64 = conn.query_row(
            r#"
INSERT INTO media_cache (url, media_type, file_path, width, height, size_bytes, fetched_at, expires_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(url) DO UPDATE SET
  media_type = excluded.media_type,
  file_path = excluded.file_path,
  width = excluded.width,
  height = excluded.height,
  size_bytes = excluded.size_bytes,
  fetched_at = excluded.fetched_at,
  expires_at = excluded.expires_at
RETURNING id
"#,
            params![
                entry.url,
                entry.media_type,
                entry.file_path,
                entry.width,
                entry.height,
                entry.size_bytes,
                entry.fetched_at.timestamp(),
                expires,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_media_entry_by_url(&self, url: &str) -> Result<Option<MediaEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT id, url, media_type, file_path, width, height, size_bytes, fetched_at, expires_at
FROM media_cache
WHERE url = ?1
"#,
            params![url],
            media_entry_from_row,
        )
        .optional()
        .context("storage: query media entry")
    }

    pub fn total_media_size(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let total: Option<i64> = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM media_cache",
            [],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0))
    }

    pub fn list_expired_media(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MediaEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT id, url, media_type, file_path, width, height, size_bytes, fetched_at, expires_at
FROM media_cache
WHERE expires_at IS NOT NULL AND expires_at <= ?1
ORDER BY expires_at ASC
LIMIT ?2
"#,
        )?;
        let rows = stmt
            .query_map(
                params![cutoff.timestamp(), limit as i64],
                media_entry_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_oldest_media(&self, limit: usize) -> Result<Vec<MediaEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT id, url, media_type, file_path, width, height, size_bytes, fetched_at, expires_at
FROM media_cache
ORDER BY fetched_at ASC
LIMIT ?1
"#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], media_entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_media_entries(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(",");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "DELETE FROM media_cache WHERE id IN ({})",
            placeholders
        ))?;
        let params_vec = ids
            .iter()
            .map(|id| id as &dyn rusqlite::ToSql)
            .collect::<Vec<_>>();
        stmt.execute(rusqlite::params_from_iter(params_vec))?;
        Ok(())
    }
}

fn cache_key(resource: &str) -> String {
    format!("cache:{resource}")
}

fn media_entry_from_row(row: &Row<'_>) -> rusqlite::Result<MediaEntry> {
    let fetched: i64 = row.get(7)?;
    let expires: Option<i64> = row.get(8)?;
    Ok(MediaEntry {
        id: row.get(0)?,
        url: row.get(1)?,
        media_type: row.get(2)?,
        file_path: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
        size_bytes: row.get(6)?,
        fetched_at: Utc
            .timestamp_opt(fetched, 0)
            .single()
            .unwrap_or_else(Utc::now),
        expires_at: expires.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS media_cache (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  url TEXT NOT NULL UNIQUE,
  media_type TEXT NOT NULL,
  file_path TEXT NOT NULL,
  width INTEGER,
  height INTEGER,
  size_bytes INTEGER,
  fetched_at INTEGER NOT NULL,
  expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_media_cache_fetched_at ON media_cache(fetched_at);
CREATE INDEX IF NOT EXISTS idx_media_cache_expires_at ON media_cache(expires_at);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chan-tui").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp(dir: &tempfile::TempDir) -> Store {
        Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap()
    }

    #[test]
    fn open_creates_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = Store::open(Options {
            path: Some(path.clone()),
        })
        .unwrap();
        assert!(path.exists());
        store.close().unwrap();
    }

    #[test]
    fn kv_round_trip_and_overwrite() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir);
        assert_eq!(store.get_kv("settings").unwrap(), None);
        store.put_kv("settings", "{\"a\":1}").unwrap();
        store.put_kv("settings", "{\"a\":2}").unwrap();
        assert_eq!(
            store.get_kv("settings").unwrap().as_deref(),
            Some("{\"a\":2}")
        );
        store.delete_kv("settings").unwrap();
        assert_eq!(store.get_kv("settings").unwrap(), None);
    }

    #[test]
    fn cache_serves_fresh_entries() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir);
        store.put_cache("boards", &vec![1u32, 2, 3]).unwrap();
        let hit: Option<Vec<u32>> = store
            .get_cache("boards", Duration::from_secs(3600))
            .unwrap();
        assert_eq!(hit, Some(vec![1, 2, 3]));
    }

    #[test]
    fn cache_discards_stale_entries() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir);
        // stored_at far in the past, so any ttl misses
        store
            .put_kv("cache:boards", "{\"stored_at\":1000,\"data\":[1]}")
            .unwrap();
        let miss: Option<Vec<u32>> = store
            .get_cache("boards", Duration::from_secs(60))
            .unwrap();
        assert_eq!(miss, None);
        assert_eq!(store.get_kv("cache:boards").unwrap(), None);
    }

    #[test]
    fn cache_discards_undecodable_entries() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir);
        store.put_kv("cache:boards", "not json").unwrap();
        let miss: Option<Vec<u32>> = store
            .get_cache("boards", Duration::from_secs(60))
            .unwrap();
        assert_eq!(miss, None);
        assert_eq!(store.get_kv("cache:boards").unwrap(), None);
    }

    #[test]
    fn media_entries_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_temp(&dir);
        let id = store
            .upsert_media_entry(MediaEntry {
                id: 0,
                url: "https://i.example/g/1s.jpg".into(),
                media_type: "image/jpeg".into(),
                file_path: "/tmp/1s.jpg".into(),
                width: 250,
                height: 250,
                size_bytes: 4096,
                fetched_at: Utc::now(),
                expires_at: None,
            })
            .unwrap();
        assert!(id > 0);
        let entry = store
            .get_media_entry_by_url("https://i.example/g/1s.jpg")
            .unwrap()
            .unwrap();
        assert_eq!(entry.width, 250);
        assert_eq!(store.total_media_size().unwrap(), 4096);
        store.delete_media_entries(&[entry.id]).unwrap();
        assert_eq!(store.total_media_size().unwrap(), 0);
    }
}
