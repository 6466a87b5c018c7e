//! Durable write-replay queue.
//!
//! Mutating requests that fail at the transport level are stored here and
//! replayed when a reconnect signal arrives. Delivery is at-least-once:
//! an item is removed once a replay attempt got any response, and kept only
//! when the transport failed.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::http::{Method, Request, Response};
use crate::transport::Transport;

/// Header carrying the client-generated idempotency key on replay.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// A write waiting for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedWrite {
  pub id: i64,
  pub method: Method,
  pub url: Url,
  /// Opaque payload; never inspected by the engine
  pub body: serde_json::Value,
  pub idempotency_key: Uuid,
  pub queued_at: DateTime<Utc>,
}

/// A write before the store has assigned it an id.
#[derive(Debug, Clone)]
pub struct NewWrite {
  pub method: Method,
  pub url: Url,
  pub body: serde_json::Value,
  pub idempotency_key: Uuid,
}

/// Durable collection keyed by auto-incrementing id.
pub trait QueueStore: Send + Sync {
  fn add(&self, write: NewWrite) -> Result<QueuedWrite>;

  /// All queued writes, oldest first.
  fn all(&self) -> Result<Vec<QueuedWrite>>;

  fn delete(&self, id: i64) -> Result<bool>;
}

/// SQLite-backed queue store.
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS write_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    body TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    queued_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteQueueStore {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl QueueStore for SqliteQueueStore {
  fn add(&self, write: NewWrite) -> Result<QueuedWrite> {
    let body =
      serde_json::to_string(&write.body).map_err(|e| eyre!("Failed to serialize body: {}", e))?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT INTO write_queue (method, url, body, idempotency_key) VALUES (?, ?, ?, ?)",
      params![
        write.method.as_str(),
        write.url.as_str(),
        body,
        write.idempotency_key.to_string()
      ],
    )
    .map_err(|e| eyre!("Failed to queue write: {}", e))?;
    let id = tx.last_insert_rowid();

    let queued_at: String = tx
      .query_row(
        "SELECT queued_at FROM write_queue WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read queued write {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(QueuedWrite {
      id,
      method: write.method,
      url: write.url,
      body: write.body,
      idempotency_key: write.idempotency_key,
      queued_at: parse_datetime(&queued_at)?,
    })
  }

  fn all(&self) -> Result<Vec<QueuedWrite>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, body, idempotency_key, queued_at FROM write_queue ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, String>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued write: {}", e))?;

    rows
      .into_iter()
      .map(|(id, method, url, body, key, queued_at)| {
        Ok(QueuedWrite {
          id,
          method: Method::parse(&method).ok_or_else(|| eyre!("Unknown method '{}'", method))?,
          url: Url::parse(&url).map_err(|e| eyre!("Failed to parse url '{}': {}", url, e))?,
          body: serde_json::from_str(&body)
            .map_err(|e| eyre!("Failed to deserialize body of write {}: {}", id, e))?,
          idempotency_key: Uuid::parse_str(&key)
            .map_err(|e| eyre!("Failed to parse idempotency key '{}': {}", key, e))?,
          queued_at: parse_datetime(&queued_at)?,
        })
      })
      .collect()
  }

  fn delete(&self, id: i64) -> Result<bool> {
    let removed = self
      .conn()?
      .execute("DELETE FROM write_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete queued write {}: {}", id, e))?;
    Ok(removed > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Interest in the reconnect signal, registered whenever a write is queued.
pub struct SyncRegistration {
  tag: String,
  pending: AtomicBool,
  notify: Notify,
}

impl SyncRegistration {
  pub fn new(tag: impl Into<String>) -> Self {
    Self {
      tag: tag.into(),
      pending: AtomicBool::new(false),
      notify: Notify::new(),
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn register(&self) {
    self.pending.store(true, Ordering::SeqCst);
    self.notify.notify_one();
  }

  pub fn is_pending(&self) -> bool {
    self.pending.load(Ordering::SeqCst)
  }

  fn clear(&self) {
    self.pending.store(false, Ordering::SeqCst);
  }

  /// Wait until a registration is made.
  pub async fn registered(&self) {
    while !self.is_pending() {
      self.notify.notified().await;
    }
  }
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub delivered: usize,
  pub retained: usize,
}

/// Queue of failed writes plus the replay logic.
#[derive(Clone)]
pub struct WriteQueue {
  store: Arc<dyn QueueStore>,
  transport: Arc<dyn Transport>,
  sync: Arc<SyncRegistration>,
}

impl WriteQueue {
  pub fn new(
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    sync: Arc<SyncRegistration>,
  ) -> Self {
    Self {
      store,
      transport,
      sync,
    }
  }

  pub fn sync(&self) -> &Arc<SyncRegistration> {
    &self.sync
  }

  pub fn pending(&self) -> Result<Vec<QueuedWrite>> {
    self.store.all()
  }

  /// Queue a write whose transport failed and register for the reconnect
  /// signal. Returns `None` when the body is not JSON and cannot be queued.
  pub fn enqueue(&self, request: &Request) -> Result<Option<QueuedWrite>> {
    let body = match request.body.as_deref() {
      None | Some([]) => serde_json::Value::Null,
      Some(raw) => match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(e) => {
          warn!(url = %request.url, error = %e, "write body is not JSON, not queueing");
          return Ok(None);
        }
      },
    };

    let queued = self.store.add(NewWrite {
      method: request.method,
      url: request.url.clone(),
      body,
      idempotency_key: Uuid::new_v4(),
    })?;
    self.sync.register();

    info!(id = queued.id, method = %queued.method, url = %queued.url, "queued write for replay");
    Ok(Some(queued))
  }

  /// Replay every queued write as one concurrent batch.
  ///
  /// Each item succeeds or fails on its own; failures stay queued and the
  /// sync registration is renewed so another drain happens later.
  pub async fn drain(&self) -> Result<DrainReport> {
    self.sync.clear();
    let items = self.store.all()?;
    if items.is_empty() {
      return Ok(DrainReport::default());
    }

    let results = join_all(items.into_iter().map(|item| self.replay(item))).await;
    let delivered = results.iter().filter(|ok| **ok).count();
    let report = DrainReport {
      delivered,
      retained: results.len() - delivered,
    };

    if report.retained > 0 {
      self.sync.register();
    }
    info!(
      delivered = report.delivered,
      retained = report.retained,
      "drained write queue"
    );
    Ok(report)
  }

  async fn replay(&self, item: QueuedWrite) -> bool {
    let mut request = Request::get(item.url.clone())
      .with_method(item.method)
      .with_header(IDEMPOTENCY_HEADER, &item.idempotency_key.to_string());
    if !item.body.is_null() {
      request = request
        .with_header("content-type", "application/json")
        .with_body(item.body.to_string());
    }

    // Any response, whatever its status, completes the delivery
    match self.transport.fetch(&request).await {
      Ok(resp) => self.acknowledge(&item, &resp),
      Err(e) => {
        debug!(id = item.id, error = %e, "replay transport failure, keeping");
        false
      }
    }
  }

  fn acknowledge(&self, item: &QueuedWrite, resp: &Response) -> bool {
    match self.store.delete(item.id) {
      Ok(_) => {
        debug!(
          id = item.id,
          status = resp.status,
          age_secs = (Utc::now() - item.queued_at).num_seconds(),
          "replayed write"
        );
        true
      }
      Err(e) => {
        warn!(id = item.id, error = %e, "failed to remove replayed write");
        false
      }
    }
  }
}
