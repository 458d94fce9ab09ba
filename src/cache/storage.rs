//! SQLite implementation of the cache store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::traits::{CacheGeneration, CacheStorage, GenerationState, RequestKey, StoredResponse};
use crate::db::Database;
use crate::net::{HeaderList, Response};

/// SQLite-based cache storage, sharing the process database with the queue.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn install_generation(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Reinstalling keeps the state of an existing generation
    tx.execute(
      "INSERT INTO cache_generations (name, state) VALUES (?, ?)
       ON CONFLICT(name) DO NOTHING",
      params![generation, GenerationState::Installed.as_str()],
    )
    .map_err(|e| eyre!("Failed to record generation {}: {}", generation, e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to clear generation {}: {}", generation, e))?;

    for (key, response) in entries {
      let headers = encode_headers(&response.headers)?;
      tx.execute(
        "INSERT OR REPLACE INTO cache_entries
           (generation, key_hash, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          generation,
          key.cache_hash(),
          key.method,
          key.url,
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit generation {}: {}", generation, e))?;

    Ok(())
  }

  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND key_hash = ?",
        params![generation, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at)) => Ok(Some(StoredResponse {
        status,
        headers: decode_headers(&headers)?,
        body,
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<bool> {
    let conn = self.db.conn()?;
    let headers = encode_headers(&response.headers)?;

    // First snapshot wins; stored responses are never rewritten
    let written = conn
      .execute(
        "INSERT OR IGNORE INTO cache_entries
           (generation, key_hash, method, url, status, headers, body, cached_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now')
         WHERE EXISTS (SELECT 1 FROM cache_generations WHERE name = ?1)",
        params![
          generation,
          key.cache_hash(),
          key.method,
          key.url,
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

    Ok(written > 0)
  }

  fn generations(&self) -> Result<Vec<CacheGeneration>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT name, state FROM cache_generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, state)| {
        let state = GenerationState::parse(&state)
          .ok_or_else(|| eyre!("Unknown state '{}' for generation {}", state, name))?;
        Ok(CacheGeneration { name, state })
      })
      .collect()
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;
    let removed = tx
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit deletion of {}: {}", generation, e))?;

    Ok(removed > 0)
  }

  fn mark_active(&self, generation: &str) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE cache_generations SET state = ?1 WHERE state = ?2 AND name != ?3",
      params![
        GenerationState::Installed.as_str(),
        GenerationState::Active.as_str(),
        generation
      ],
    )
    .map_err(|e| eyre!("Failed to demote previous generation: {}", e))?;

    let updated = tx
      .execute(
        "UPDATE cache_generations SET state = ? WHERE name = ?",
        params![GenerationState::Active.as_str(), generation],
      )
      .map_err(|e| eyre!("Failed to activate generation {}: {}", generation, e))?;

    if updated == 0 {
      return Err(eyre!("Generation {} is not installed", generation));
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit activation of {}: {}", generation, e))?;

    Ok(())
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", generation, e))?;
    Ok(count as usize)
  }
}

fn encode_headers(headers: &HeaderList) -> Result<String> {
  serde_json::to_string(headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))
}

fn decode_headers(s: &str) -> Result<HeaderList> {
  serde_json::from_str(s).map_err(|e| eyre!("Failed to deserialize headers: {}", e))
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<chrono::DateTime<chrono::Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
