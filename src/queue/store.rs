//! Queue store trait and SQLite implementation.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::entry::{EntryStatus, NewScanEntry, PendingScanEntry};
use crate::db::Database;

/// Durable store of scan submissions awaiting delivery.
pub trait QueueStore: Send + Sync {
  /// Append an entry under a fresh id. The entry is durable once this returns.
  fn add(&self, entry: NewScanEntry) -> Result<PendingScanEntry>;

  /// All entries with the given status, in enqueue order.
  fn get_all(&self, status: EntryStatus) -> Result<Vec<PendingScanEntry>>;

  /// Remove an entry. Deleting an unknown id is a no-op; returns whether a row went away.
  fn delete(&self, id: &str) -> Result<bool>;

  /// Number of entries with the given status.
  fn len(&self, status: EntryStatus) -> Result<usize>;
}

/// SQLite-backed queue, sharing the process database with the cache.
pub struct SqliteQueueStore {
  db: Arc<Database>,
}

impl SqliteQueueStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

type Row = (
  String,
  String,
  String,
  String,
  String,
  Option<Vec<u8>>,
  i64,
);

impl QueueStore for SqliteQueueStore {
  fn add(&self, entry: NewScanEntry) -> Result<PendingScanEntry> {
    let conn = self.db.conn()?;
    let id = uuid::Uuid::new_v4().to_string();
    let timestamp = Utc::now().timestamp_millis();
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO pending_requests (id, status, url, method, headers, body, timestamp)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          id,
          EntryStatus::Pending.as_str(),
          entry.url,
          entry.method,
          headers,
          entry.body,
          timestamp
        ],
      )
      .map_err(|e| eyre!("Failed to queue request to {}: {}", entry.url, e))?;

    Ok(PendingScanEntry {
      id,
      status: EntryStatus::Pending,
      url: entry.url,
      method: entry.method,
      headers: entry.headers,
      body: entry.body,
      timestamp,
    })
  }

  fn get_all(&self, status: EntryStatus) -> Result<Vec<PendingScanEntry>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, status, url, method, headers, body, timestamp FROM pending_requests
         WHERE status = ?
         ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<Row> = stmt
      .query_map(params![status.as_str()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query pending requests: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read pending request: {}", e))?;

    rows
      .into_iter()
      .map(|(id, status, url, method, headers, body, timestamp)| {
        let status = EntryStatus::parse(&status)
          .ok_or_else(|| eyre!("Unknown status '{}' for entry {}", status, id))?;
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", id, e))?;
        Ok(PendingScanEntry {
          id,
          status,
          url,
          method,
          headers,
          body,
          timestamp,
        })
      })
      .collect()
  }

  fn delete(&self, id: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM pending_requests WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete queued request {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn len(&self, status: EntryStatus) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM pending_requests WHERE status = ?",
        params![status.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count queued requests: {}", e))?;
    Ok(count as usize)
  }
}
