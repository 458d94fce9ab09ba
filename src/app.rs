use crate::cache::{CacheSource, CacheStorage, FetchInterceptor, SqliteStorage};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::context::{ConnectivityState, ProcessContext};
use crate::db::Database;
use crate::event::{Event, EventHandler, EventOutcome, Worker};
use crate::lifecycle::LifecycleManager;
use crate::net::{HttpClient, Request};
use crate::queue::{EntryStatus, QueueStore, SqliteQueueStore};
use crate::submit::{ScanSubmitter, SubmissionTarget, SubmitOutcome};
use crate::sync::{DrainReport, SyncCoordinator};
use crate::tasks::SideTasks;
use color_eyre::{eyre::eyre, Result};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wires the stores, the process context and the worker together for one process.
pub struct App {
  config: Config,
  context: Arc<ProcessContext>,
  storage: Arc<dyn CacheStorage>,
  queue: Arc<dyn QueueStore>,
  interceptor: Arc<FetchInterceptor>,
  worker: Worker,
  tasks: SideTasks,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let db = Arc::new(Database::open(config.database.as_deref())?);
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::new(db.clone()));
    let queue: Arc<dyn QueueStore> = Arc::new(SqliteQueueStore::new(db));
    let http = HttpClient::new(REQUEST_TIMEOUT)?;
    let tasks = SideTasks::new();

    let context = Arc::new(ProcessContext::bootstrap(
      config.cache.generation(),
      storage.as_ref(),
    )?);

    let interceptor = Arc::new(FetchInterceptor::new(
      storage.clone(),
      http.clone(),
      context.clone(),
      tasks.clone(),
      config.cache.api_segment.clone(),
    ));

    let worker = Worker::new(
      context.clone(),
      LifecycleManager::new(
        storage.clone(),
        http.clone(),
        context.clone(),
        config.manifest_urls()?,
      ),
      interceptor.clone(),
      SyncCoordinator::new(queue.clone(), http, config.sync.tag.clone()),
    );

    Ok(Self {
      config,
      context,
      storage,
      queue,
      interceptor,
      worker,
      tasks,
    })
  }

  pub async fn install(&self) -> Result<()> {
    if let EventOutcome::Installed(report) = self.worker.dispatch(Event::Install).await? {
      println!(
        "installed {} ({} assets)",
        report.generation, report.assets
      );
    }
    Ok(())
  }

  pub async fn activate(&self) -> Result<()> {
    if let EventOutcome::Activated(report) = self.worker.dispatch(Event::Activate).await? {
      println!("activated {}", report.generation);
      for stale in report.purged {
        println!("  purged {}", stale);
      }
    }
    Ok(())
  }

  /// Fetch a URL through the interceptor and write the body to `output` or stdout.
  pub async fn fetch(&self, url: Url, output: Option<&Path>) -> Result<()> {
    let result = match self.worker.dispatch(Event::Fetch(Request::get(url))).await? {
      EventOutcome::Response(result) => result,
      other => return Err(eyre!("Unexpected fetch outcome: {:?}", other)),
    };

    let source = match result.source {
      CacheSource::Cache => "cache",
      CacheSource::Network => "network",
    };
    info!(
      status = result.data.status,
      source,
      content_type = result.data.header("content-type").unwrap_or("-"),
      cached_at = ?result.cached_at,
      "fetched"
    );

    match output {
      Some(path) => std::fs::write(path, &result.data.body)
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
      None => std::io::stdout()
        .write_all(&result.data.body)
        .map_err(|e| eyre!("Failed to write response body: {}", e))?,
    }

    self.shutdown().await;
    Ok(())
  }

  /// Submit a scan payload read from `payload` ("-" for stdin).
  pub async fn submit(&self, payload: &Path) -> Result<()> {
    let body = if payload == Path::new("-") {
      let mut buf = Vec::new();
      std::io::stdin()
        .read_to_end(&mut buf)
        .map_err(|e| eyre!("Failed to read payload from stdin: {}", e))?;
      buf
    } else {
      std::fs::read(payload)
        .map_err(|e| eyre!("Failed to read payload {}: {}", payload.display(), e))?
    };

    let submitter = ScanSubmitter::new(
      self.interceptor.clone(),
      self.queue.clone(),
      SubmissionTarget {
        url: self.config.submission.url.clone(),
        access_token: Config::get_access_token()?,
        token_id: self.config.submission.token_id.clone(),
      },
    );

    match submitter.submit(body).await? {
      SubmitOutcome::Delivered(response) => println!("delivered ({})", response.status),
      SubmitOutcome::Queued { entry, reason } => {
        println!("queued {} ({}); it will be sent on the next sync", entry.id, reason)
      }
    }
    Ok(())
  }

  pub async fn sync(&self, tag: Option<String>) -> Result<()> {
    let tag = tag.unwrap_or_else(|| self.config.sync.tag.clone());
    match self.worker.dispatch(Event::Sync { tag: tag.clone() }).await? {
      EventOutcome::Drained(report) => print_drain(&report),
      _ => println!("no handler for sync tag '{}'", tag),
    }
    Ok(())
  }

  pub fn queue(&self) -> Result<()> {
    let entries = self.queue.get_all(EntryStatus::Pending)?;
    if entries.is_empty() {
      println!("queue is empty");
      return Ok(());
    }

    for entry in entries {
      println!(
        "{}  {} {}  queued {} ({}m ago)",
        entry.id,
        entry.method,
        entry.url,
        entry.enqueued_at().format("%Y-%m-%d %H:%M:%S"),
        entry.age().num_minutes()
      );
    }
    Ok(())
  }

  pub fn status(&self) -> Result<()> {
    println!("target generation: {}", self.context.generation());
    match self.context.active_generation() {
      Some(active) => println!("active generation: {}", active),
      None => println!("active generation: none"),
    }

    for generation in self.storage.generations()? {
      println!(
        "  {} [{}] {} entries",
        generation.name,
        generation.state.as_str(),
        self.storage.entry_count(&generation.name)?
      );
    }

    println!(
      "pending submissions: {}",
      self.queue.len(EntryStatus::Pending)?
    );
    Ok(())
  }

  /// Run the background worker until interrupted: probe connectivity and replay the
  /// queue whenever the connection comes back.
  ///
  /// Ctrl-C only stops the event sources. The worker finishes the events already
  /// queued, so a drain in flight is never cut short.
  pub async fn watch(&self) -> Result<()> {
    let (tx, events) = EventHandler::channel();
    let cancel = CancellationToken::new();

    let monitor = ConnectivityMonitor::new(
      self.config.probe_url(),
      self.config.connectivity.interval(),
      self.config.connectivity.timeout(),
    )?
    .with_sync(self.queue.clone(), self.config.sync.tag.clone());
    let probe = monitor.spawn(tx, cancel.clone());

    let stop = cancel.clone();
    let signals = tokio::spawn(async move {
      tokio::select! {
        _ = stop.cancelled() => {}
        result = tokio::signal::ctrl_c() => match result {
          Ok(()) => {
            info!("shutting down after the current event");
            stop.cancel();
          }
          Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        },
      }
    });

    // Passive connectivity indicator, the only status surfaced to the user
    let mut connectivity = self.context.watch_connectivity();
    let indicator = tokio::spawn(async move {
      while connectivity.changed().await.is_ok() {
        let state = *connectivity.borrow_and_update();
        match state {
          ConnectivityState::Online => eprintln!("[online]"),
          ConnectivityState::Offline => eprintln!("[offline] scans will be queued"),
        }
      }
    });

    info!(generation = self.context.generation(), "worker running");

    // Ends once the probe loop has stopped and dropped its sender
    self.worker.run(events).await;

    cancel.cancel();
    let _ = probe.await;
    let _ = signals.await;
    indicator.abort();
    self.shutdown().await;
    info!(
      connectivity = self.context.connectivity().as_str(),
      "worker stopped"
    );
    Ok(())
  }

  /// Let best-effort cache writes finish before the process exits.
  async fn shutdown(&self) {
    debug!(in_flight = self.tasks.in_flight(), "waiting for side tasks");
    self.tasks.settle().await;

    let failed = self.tasks.failures();
    if failed > 0 {
      warn!(failed, "some responses could not be cached");
    }
  }
}

fn print_drain(report: &DrainReport) {
  println!(
    "attempted {}, delivered {}, failed {}",
    report.attempted.len(),
    report.delivered,
    report.failed
  );
  if report.removal_failed > 0 {
    println!(
      "{} delivered entries could not be removed and will be resent",
      report.removal_failed
    );
  }
  for id in &report.remaining {
    println!("  still queued {}", id);
  }
}
