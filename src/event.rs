use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, FetchInterceptor};
use crate::context::{ConnectivityState, ProcessContext};
use crate::lifecycle::{ActivateReport, InstallReport, LifecycleManager};
use crate::net::{Request, Response};
use crate::sync::{DrainReport, SyncCoordinator};

/// Platform triggers delivered to the background worker
#[derive(Debug)]
pub enum Event {
  /// A new cache generation should be populated
  Install,
  /// The installed generation should take over
  Activate,
  /// An outbound request was intercepted
  Fetch(Request),
  /// Background sync fired for a tag
  Sync { tag: String },
  /// Connectivity observation from the platform
  Connectivity(ConnectivityState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Sync,
  Connectivity,
}

impl Event {
  pub fn kind(&self) -> EventKind {
    match self {
      Event::Install => EventKind::Install,
      Event::Activate => EventKind::Activate,
      Event::Fetch(_) => EventKind::Fetch,
      Event::Sync { .. } => EventKind::Sync,
      Event::Connectivity(_) => EventKind::Connectivity,
    }
  }
}

/// Result of handling one event
#[derive(Debug)]
pub enum EventOutcome {
  Installed(InstallReport),
  Activated(ActivateReport),
  Response(CacheResult<Response>),
  Drained(DrainReport),
  /// Connectivity recorded with nothing to replay
  ConnectivityRecorded,
  /// Event not meant for this worker
  Ignored,
}

/// The background worker: one handler per event kind, sharing a process context.
pub struct Worker {
  context: Arc<ProcessContext>,
  lifecycle: LifecycleManager,
  interceptor: Arc<FetchInterceptor>,
  sync: SyncCoordinator,
}

impl Worker {
  pub fn new(
    context: Arc<ProcessContext>,
    lifecycle: LifecycleManager,
    interceptor: Arc<FetchInterceptor>,
    sync: SyncCoordinator,
  ) -> Self {
    Self {
      context,
      lifecycle,
      interceptor,
      sync,
    }
  }

  /// Route an event to its handler and run it to completion.
  pub async fn dispatch(&self, event: Event) -> Result<EventOutcome> {
    match event {
      Event::Install => self.lifecycle.install().await.map(EventOutcome::Installed),
      Event::Activate => self.lifecycle.activate().await.map(EventOutcome::Activated),
      Event::Fetch(request) => self
        .interceptor
        .fetch(&request)
        .await
        .map(EventOutcome::Response),
      Event::Sync { tag } => Ok(match self.sync.handle_sync(&tag).await? {
        Some(report) => EventOutcome::Drained(report),
        None => EventOutcome::Ignored,
      }),
      Event::Connectivity(state) => self.on_connectivity(state).await,
    }
  }

  /// Coming back online is the widget's cue to ask for a sync. While online, a
  /// repeated signal replays whatever is still queued.
  async fn on_connectivity(&self, state: ConnectivityState) -> Result<EventOutcome> {
    let previous = self.context.set_connectivity(state);

    if state == ConnectivityState::Offline {
      return Ok(EventOutcome::ConnectivityRecorded);
    }

    if previous == ConnectivityState::Offline {
      info!("back online, replaying queued submissions");
    } else if !self.sync.has_pending()? {
      return Ok(EventOutcome::ConnectivityRecorded);
    }

    self.sync.drain().await.map(EventOutcome::Drained)
  }

  /// Handle events one at a time until every sender is gone.
  pub async fn run(&self, mut events: EventHandler) {
    while let Some(event) = events.next().await {
      let kind = event.kind();
      match self.dispatch(event).await {
        Ok(outcome) => debug!(?kind, ?outcome, "event handled"),
        Err(e) => warn!(?kind, error = %e, "event handler failed"),
      }
    }
  }
}

/// Queue of events waiting for the worker
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create the event queue and the sender event sources (connectivity monitor,
  /// CLI triggers) feed it through. The queue ends once every sender is dropped.
  pub fn channel() -> (mpsc::UnboundedSender<Event>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, CacheStorage, SqliteStorage};
  use crate::db::Database;
  use crate::net::HttpClient;
  use crate::queue::{EntryStatus, NewScanEntry, QueueStore, SqliteQueueStore};
  use crate::submit::{ScanSubmitter, SubmissionTarget, SubmitOutcome};
  use crate::tasks::SideTasks;
  use std::collections::BTreeMap;
  use std::time::Duration;
  use url::Url;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  struct Harness {
    worker: Worker,
    interceptor: Arc<FetchInterceptor>,
    context: Arc<ProcessContext>,
    queue: Arc<SqliteQueueStore>,
    storage: Arc<SqliteStorage>,
    tasks: SideTasks,
  }

  fn harness(server: &MockServer) -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let queue = Arc::new(SqliteQueueStore::new(db));
    let http = HttpClient::new(Duration::from_secs(5)).unwrap();
    let context = Arc::new(ProcessContext::new("card-scanner-v2"));
    let tasks = SideTasks::new();
    let manifest = vec![Url::parse(&format!("{}/index.html", server.uri())).unwrap()];

    let interceptor = Arc::new(FetchInterceptor::new(
      storage.clone(),
      http.clone(),
      context.clone(),
      tasks.clone(),
      "/api/",
    ));
    let worker = Worker::new(
      context.clone(),
      LifecycleManager::new(storage.clone(), http.clone(), context.clone(), manifest),
      interceptor.clone(),
      SyncCoordinator::new(queue.clone(), http, "scan-submissions"),
    );

    Harness {
      worker,
      interceptor,
      context,
      queue,
      storage,
      tasks,
    }
  }

  async fn server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/index.html"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/api/v1/scan"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    server
  }

  fn queued_scan(server: &MockServer) -> NewScanEntry {
    NewScanEntry {
      url: format!("{}/api/v1/scan", server.uri()),
      method: "POST".into(),
      headers: BTreeMap::new(),
      body: Some(b"{}".to_vec()),
    }
  }

  #[test]
  fn test_event_kinds() {
    assert_eq!(Event::Install.kind(), EventKind::Install);
    assert_eq!(
      Event::Sync { tag: "x".into() }.kind(),
      EventKind::Sync
    );
    assert_eq!(
      Event::Connectivity(ConnectivityState::Online).kind(),
      EventKind::Connectivity
    );
  }

  #[tokio::test]
  async fn test_install_activate_then_fetch_from_cache() {
    let server = server().await;
    let h = harness(&server);

    let outcome = h.worker.dispatch(Event::Install).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Installed(ref r) if r.assets == 1));
    let outcome = h.worker.dispatch(Event::Activate).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Activated(_)));

    let request = Request::get(Url::parse(&format!("{}/index.html", server.uri())).unwrap());
    let outcome = h.worker.dispatch(Event::Fetch(request)).await.unwrap();
    let EventOutcome::Response(result) = outcome else {
      panic!("expected a response");
    };
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"<html>");
    assert_eq!(h.storage.entry_count("card-scanner-v2").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_sync_event_drains_queue() {
    let server = server().await;
    let h = harness(&server);
    h.queue.add(queued_scan(&server)).unwrap();

    let outcome = h
      .worker
      .dispatch(Event::Sync {
        tag: "scan-submissions".into(),
      })
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Drained(ref r) if r.delivered == 1));
    assert_eq!(h.queue.len(EntryStatus::Pending).unwrap(), 0);

    let outcome = h
      .worker
      .dispatch(Event::Sync {
        tag: "something-else".into(),
      })
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Ignored));
  }

  #[tokio::test]
  async fn test_online_transition_triggers_drain() {
    let server = server().await;
    let h = harness(&server);
    h.queue.add(queued_scan(&server)).unwrap();

    let outcome = h
      .worker
      .dispatch(Event::Connectivity(ConnectivityState::Offline))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::ConnectivityRecorded));
    assert_eq!(h.queue.len(EntryStatus::Pending).unwrap(), 1);

    let outcome = h
      .worker
      .dispatch(Event::Connectivity(ConnectivityState::Online))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Drained(ref r) if r.delivered == 1));
    assert_eq!(h.context.connectivity(), ConnectivityState::Online);

    // Still online with nothing queued
    let outcome = h
      .worker
      .dispatch(Event::Connectivity(ConnectivityState::Online))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::ConnectivityRecorded));
  }

  #[tokio::test]
  async fn test_scan_queued_while_online_is_replayed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v1/scan"))
      .respond_with(ResponseTemplate::new(500))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/api/v1/scan"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    let h = harness(&server);

    h.worker
      .dispatch(Event::Connectivity(ConnectivityState::Online))
      .await
      .unwrap();

    let (tx, mut events) = EventHandler::channel();
    let submitter = ScanSubmitter::new(
      h.interceptor.clone(),
      h.queue.clone(),
      SubmissionTarget {
        url: Url::parse(&format!("{}/api/v1/scan", server.uri())).unwrap(),
        access_token: "secret".into(),
        token_id: "tok-1".into(),
      },
    )
    .with_sync(tx, "scan-submissions");

    let outcome = submitter.submit(b"{}".to_vec()).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
    assert_eq!(h.queue.len(EntryStatus::Pending).unwrap(), 1);

    // Queueing asks for a sync
    let event = events.next().await.unwrap();
    assert!(matches!(event, Event::Sync { ref tag } if tag == "scan-submissions"));
    let outcome = h.worker.dispatch(event).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Drained(ref r) if r.delivered == 1));
    assert_eq!(h.queue.len(EntryStatus::Pending).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_repeated_online_signal_replays_leftovers() {
    let server = server().await;
    let h = harness(&server);

    h.worker
      .dispatch(Event::Connectivity(ConnectivityState::Online))
      .await
      .unwrap();
    h.queue.add(queued_scan(&server)).unwrap();

    let outcome = h
      .worker
      .dispatch(Event::Connectivity(ConnectivityState::Online))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Drained(ref r) if r.delivered == 1));
    assert_eq!(h.queue.len(EntryStatus::Pending).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_run_processes_events_until_senders_drop() {
    let server = server().await;
    let h = harness(&server);
    h.queue.add(queued_scan(&server)).unwrap();

    let (tx, events) = EventHandler::channel();
    tx.send(Event::Install).unwrap();
    tx.send(Event::Activate).unwrap();
    tx.send(Event::Sync {
      tag: "scan-submissions".into(),
    })
    .unwrap();
    drop(tx);

    h.worker.run(events).await;
    h.tasks.settle().await;

    assert_eq!(
      h.context.active_generation().as_deref(),
      Some("card-scanner-v2")
    );
    assert_eq!(h.queue.len(EntryStatus::Pending).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_stopping_sources_lets_in_flight_drain_finish() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v1/scan"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
      .expect(1)
      .mount(&server)
      .await;
    let h = harness(&server);
    h.queue.add(queued_scan(&server)).unwrap();

    let (tx, events) = EventHandler::channel();
    let cancel = tokio_util::sync::CancellationToken::new();
    let source = {
      let cancel = cancel.clone();
      tokio::spawn(async move {
        tx.send(Event::Sync {
          tag: "scan-submissions".into(),
        })
        .unwrap();
        cancel.cancelled().await;
      })
    };

    // Stop the source while the resend is still waiting on the server
    let stopper = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      cancel.cancel();
    });

    h.worker.run(events).await;
    source.await.unwrap();
    stopper.await.unwrap();

    assert_eq!(h.queue.len(EntryStatus::Pending).unwrap(), 0);
  }
}
