//! Replay of queued scan submissions.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::net::HttpClient;
use crate::queue::{EntryStatus, PendingScanEntry, QueueStore};

/// What happened during one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Entry ids in the order they were resent
  pub attempted: Vec<String>,
  /// Entries delivered and removed from the queue
  pub delivered: usize,
  /// Entries whose resend failed; still queued
  pub failed: usize,
  /// Entries delivered but whose removal failed; resent on the next drain
  pub removal_failed: usize,
  /// Ids still queued after this drain, in the order the next drain resends them
  pub remaining: Vec<String>,
}

/// Drains the queue once connectivity is back.
///
/// Entries are resent one at a time in enqueue order. An entry is removed only
/// after the server acknowledged it, so a crash mid-drain at worst resends an entry
/// that was already delivered.
pub struct SyncCoordinator {
  queue: Arc<dyn QueueStore>,
  http: HttpClient,
  tag: String,
  /// Serializes drains started by overlapping triggers
  drain_lock: Mutex<()>,
}

impl SyncCoordinator {
  pub fn new(queue: Arc<dyn QueueStore>, http: HttpClient, tag: impl Into<String>) -> Self {
    Self {
      queue,
      http,
      tag: tag.into(),
      drain_lock: Mutex::new(()),
    }
  }

  /// Whether anything is waiting to be resent.
  pub fn has_pending(&self) -> Result<bool> {
    Ok(self.queue.len(EntryStatus::Pending)? > 0)
  }

  /// Handle a background sync signal. Signals for other workflows are ignored.
  pub async fn handle_sync(&self, tag: &str) -> Result<Option<DrainReport>> {
    if tag != self.tag {
      debug!(tag, "ignoring sync for another workflow");
      return Ok(None);
    }
    self.drain().await.map(Some)
  }

  /// Resend every pending entry. Only a failure to read the queue is an error;
  /// individual delivery failures are logged and left for the next drain.
  #[instrument(skip(self))]
  pub async fn drain(&self) -> Result<DrainReport> {
    let _guard = self.drain_lock.lock().await;

    let entries = self.queue.get_all(EntryStatus::Pending)?;
    let mut report = DrainReport::default();

    if entries.is_empty() {
      debug!("nothing queued");
      return Ok(report);
    }

    info!(pending = entries.len(), "draining queued submissions");

    for entry in entries {
      report.attempted.push(entry.id.clone());

      if !self.resend(&entry).await {
        report.failed += 1;
        report.remaining.push(entry.id);
        continue;
      }

      match self.queue.delete(&entry.id) {
        Ok(_) => report.delivered += 1,
        Err(e) => {
          report.removal_failed += 1;
          warn!(id = %entry.id, error = %e, "delivered but could not remove from queue");
          report.remaining.push(entry.id);
        }
      }
    }

    info!(
      delivered = report.delivered,
      failed = report.failed,
      removal_failed = report.removal_failed,
      "drain finished"
    );

    Ok(report)
  }

  /// Returns whether the server acknowledged the entry.
  async fn resend(&self, entry: &PendingScanEntry) -> bool {
    let request = match entry.to_request() {
      Ok(request) => request,
      Err(e) => {
        warn!(id = %entry.id, error = %e, "queued entry cannot be rebuilt");
        return false;
      }
    };

    match self.http.send(&request).await {
      Ok(response) if response.is_ok() => {
        debug!(id = %entry.id, status = response.status, "queued submission delivered");
        true
      }
      Ok(response) => {
        warn!(
          id = %entry.id,
          status = response.status,
          age_secs = entry.age().num_seconds(),
          "queued submission rejected, will retry"
        );
        false
      }
      Err(e) => {
        warn!(
          id = %entry.id,
          error = %e,
          age_secs = entry.age().num_seconds(),
          "queued submission failed, will retry"
        );
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::net::test_support::unreachable_url;
  use crate::queue::{NewScanEntry, SqliteQueueStore};
  use color_eyre::eyre::eyre;
  use std::collections::BTreeMap;
  use std::time::Duration;
  use wiremock::matchers::{method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn scan(url: String, n: &str) -> NewScanEntry {
    NewScanEntry {
      url: format!("{}?n={}", url, n),
      method: "POST".into(),
      headers: BTreeMap::from([("X-Token-Id".to_string(), "tok".to_string())]),
      body: Some(n.as_bytes().to_vec()),
    }
  }

  fn coordinator(queue: Arc<dyn QueueStore>) -> SyncCoordinator {
    SyncCoordinator::new(
      queue,
      HttpClient::new(Duration::from_secs(5)).unwrap(),
      "scan-submissions",
    )
  }

  fn memory_queue() -> Arc<SqliteQueueStore> {
    Arc::new(SqliteQueueStore::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )))
  }

  #[tokio::test]
  async fn test_failed_entry_kept_and_rest_delivered_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v1/scan"))
      .and(query_param("n", "1"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/api/v1/scan"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;

    let queue = memory_queue();
    let base = format!("{}/api/v1/scan", server.uri());
    let e1 = queue.add(scan(base.clone(), "1")).unwrap();
    let e2 = queue.add(scan(base.clone(), "2")).unwrap();
    let e3 = queue.add(scan(base, "3")).unwrap();

    let report = coordinator(queue.clone()).drain().await.unwrap();

    assert_eq!(report.attempted, vec![e1.id.clone(), e2.id, e3.id]);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, vec![e1.id.clone()]);
    assert_eq!(queue.get_all(EntryStatus::Pending).unwrap(), vec![e1]);

    // Resends hit the server in enqueue order
    let order: Vec<String> = server
      .received_requests()
      .await
      .unwrap()
      .iter()
      .map(|r| String::from_utf8(r.body.clone()).unwrap())
      .collect();
    assert_eq!(order, vec!["1", "2", "3"]);
  }

  #[tokio::test]
  async fn test_entry_kept_until_success() {
    let queue = memory_queue();
    let entry = queue
      .add(scan(unreachable_url("/api/v1/scan").to_string(), "1"))
      .unwrap();
    let sync = coordinator(queue.clone());

    for _ in 0..2 {
      let report = sync.drain().await.unwrap();
      assert_eq!(report.failed, 1);
      assert_eq!(queue.get_all(EntryStatus::Pending).unwrap(), vec![entry.clone()]);
    }
  }

  #[tokio::test]
  async fn test_replay_preserves_method_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .and(path("/api/v1/scan"))
      .and(wiremock::matchers::header("x-token-id", "tok"))
      .and(wiremock::matchers::body_bytes(b"payload".to_vec()))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;

    let queue = memory_queue();
    queue
      .add(NewScanEntry {
        url: format!("{}/api/v1/scan", server.uri()),
        method: "PUT".into(),
        headers: BTreeMap::from([("X-Token-Id".to_string(), "tok".to_string())]),
        body: Some(b"payload".to_vec()),
      })
      .unwrap();

    let report = coordinator(queue.clone()).drain().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(queue.len(EntryStatus::Pending).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_sync_for_other_tag_ignored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200))
      .expect(0)
      .mount(&server)
      .await;

    let queue = memory_queue();
    queue
      .add(scan(format!("{}/api/v1/scan", server.uri()), "1"))
      .unwrap();
    let sync = coordinator(queue.clone());

    assert!(sync.handle_sync("other-tag").await.unwrap().is_none());
    assert_eq!(queue.len(EntryStatus::Pending).unwrap(), 1);
  }

  /// Queue whose deletes always fail, wrapping a real store.
  struct StickyQueue(Arc<SqliteQueueStore>);

  impl QueueStore for StickyQueue {
    fn add(&self, entry: NewScanEntry) -> Result<PendingScanEntry> {
      self.0.add(entry)
    }

    fn get_all(&self, status: EntryStatus) -> Result<Vec<PendingScanEntry>> {
      self.0.get_all(status)
    }

    fn delete(&self, _id: &str) -> Result<bool> {
      Err(eyre!("database is locked"))
    }

    fn len(&self, status: EntryStatus) -> Result<usize> {
      self.0.len(status)
    }
  }

  #[tokio::test]
  async fn test_removal_failure_keeps_entry_for_next_drain() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;

    let inner = memory_queue();
    let entry = inner
      .add(scan(format!("{}/api/v1/scan", server.uri()), "1"))
      .unwrap();

    let report = coordinator(Arc::new(StickyQueue(inner.clone())))
      .drain()
      .await
      .unwrap();

    assert_eq!(report.removal_failed, 1);
    assert_eq!(report.delivered, 0);
    assert_eq!(report.remaining, vec![entry.id.clone()]);
    assert_eq!(inner.get_all(EntryStatus::Pending).unwrap(), vec![entry]);
  }

  #[tokio::test]
  async fn test_overlapping_drains_send_each_entry_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v1/scan"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
      .expect(1)
      .mount(&server)
      .await;

    let queue = memory_queue();
    queue
      .add(scan(format!("{}/api/v1/scan", server.uri()), "1"))
      .unwrap();
    let sync = coordinator(queue.clone());
    assert!(sync.has_pending().unwrap());

    let (first, second) = tokio::join!(sync.drain(), sync.drain());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.delivered + second.delivered, 1);
    assert_eq!(first.attempted.len() + second.attempted.len(), 1);
    assert!(!sync.has_pending().unwrap());
  }
}
