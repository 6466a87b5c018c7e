//! Blob store trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::http::{Method, RequestKey, Response};

/// Named-region key/response store.
///
/// Regions are opened by identity string. Keys are returned in insertion
/// order; `put` on an existing key replaces the entry and makes it the
/// newest one.
pub trait BlobStore: Send + Sync {
  /// Ensure a region exists, creating it empty if needed.
  fn open_region(&self, region: &str) -> Result<()>;

  /// All region identities currently present.
  fn region_names(&self) -> Result<Vec<String>>;

  /// Delete a region and all of its entries.
  fn delete_region(&self, region: &str) -> Result<bool>;

  fn get(&self, region: &str, key: &RequestKey) -> Result<Option<Response>>;

  fn put(&self, region: &str, key: &RequestKey, response: &Response) -> Result<()>;

  fn delete(&self, region: &str, key: &RequestKey) -> Result<bool>;

  /// Keys of a region, oldest first.
  fn keys(&self, region: &str) -> Result<Vec<RequestKey>>;

  /// Number of entries in a region.
  fn len(&self, region: &str) -> Result<usize>;

  /// The oldest key of a region, if any.
  fn oldest(&self, region: &str) -> Result<Option<RequestKey>>;
}

/// SQLite-based blob store.
pub struct SqliteBlobStore {
  conn: Mutex<Connection>,
}

impl SqliteBlobStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(BLOB_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for region and entry tables.
const BLOB_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_regions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- seq gives insertion order; a replaced entry gets a fresh seq
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    region TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    range_header TEXT,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (region, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_region ON cache_entries(region, seq);
"#;

impl BlobStore for SqliteBlobStore {
  fn open_region(&self, region: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_regions (name) VALUES (?)",
        params![region],
      )
      .map_err(|e| eyre!("Failed to open region {}: {}", region, e))?;
    Ok(())
  }

  fn region_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_regions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare region query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list regions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read region name: {}", e))?;

    Ok(names)
  }

  fn delete_region(&self, region: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE region = ?", params![region])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", region, e))?;
    let removed = tx
      .execute("DELETE FROM cache_regions WHERE name = ?", params![region])
      .map_err(|e| eyre!("Failed to delete region {}: {}", region, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, region: &str, key: &RequestKey) -> Result<Option<Response>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body FROM cache_entries
         WHERE region = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>)> = stmt
      .query_row(params![region, key.hash()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(Response {
          status,
          headers,
          body,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, region: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_regions (name) VALUES (?)",
      params![region],
    )
    .map_err(|e| eyre!("Failed to open region {}: {}", region, e))?;

    // Replacement moves the entry to the newest position
    tx.execute(
      "DELETE FROM cache_entries WHERE region = ? AND key_hash = ?",
      params![region, key.hash()],
    )
    .map_err(|e| eyre!("Failed to replace entry {}: {}", key, e))?;

    tx.execute(
      "INSERT INTO cache_entries (region, key_hash, method, url, range_header, status, headers, body)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        region,
        key.hash(),
        key.method().as_str(),
        key.url().as_str(),
        key.range(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, region: &str, key: &RequestKey) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE region = ? AND key_hash = ?",
        params![region, key.hash()],
      )
      .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn keys(&self, region: &str) -> Result<Vec<RequestKey>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url, range_header FROM cache_entries
         WHERE region = ?
         ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let rows = stmt
      .query_map(params![region], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, Option<String>>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query keys: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url, range)| row_key(method, url, range))
      .collect()
  }

  fn len(&self, region: &str) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE region = ?",
        params![region],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", region, e))?;
    Ok(count as usize)
  }

  fn oldest(&self, region: &str) -> Result<Option<RequestKey>> {
    let row = self
      .conn()?
      .query_row(
        "SELECT method, url, range_header FROM cache_entries
         WHERE region = ?
         ORDER BY seq
         LIMIT 1",
        params![region],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query oldest entry of {}: {}", region, e))?;

    row
      .map(|(method, url, range)| row_key(method, url, range))
      .transpose()
  }
}

fn row_key(method: String, url: String, range: Option<String>) -> Result<RequestKey> {
  let method = Method::parse(&method).ok_or_else(|| eyre!("Unknown method '{}'", method))?;
  let url = url::Url::parse(&url).map_err(|e| eyre!("Failed to parse url '{}': {}", url, e))?;
  Ok(RequestKey::new(method, url, range))
}
