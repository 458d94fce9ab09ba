//! Connectivity signal source.
//!
//! Probes a URL on an interval and reports online/offline transitions as events.
//! Any HTTP response counts as online; only a transport failure counts as offline.
//! While online, entries queued by other processes are picked up by asking for a sync
//! on each tick that finds the queue non-empty.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::context::ConnectivityState;
use crate::event::Event;
use crate::net::{HttpClient, Request};
use crate::queue::{EntryStatus, QueueStore};

pub struct ConnectivityMonitor {
  http: HttpClient,
  probe_url: Url,
  interval: Duration,
  pending: Option<(Arc<dyn QueueStore>, String)>,
}

impl ConnectivityMonitor {
  pub fn new(probe_url: Url, interval: Duration, timeout: Duration) -> Result<Self> {
    Ok(Self {
      http: HttpClient::new(timeout)?,
      probe_url,
      interval,
      pending: None,
    })
  }

  /// Ask for a sync with `tag` on every online tick while `queue` holds pending entries.
  pub fn with_sync(mut self, queue: Arc<dyn QueueStore>, tag: impl Into<String>) -> Self {
    self.pending = Some((queue, tag.into()));
    self
  }

  /// Sync to request after a steady online tick, if anything is waiting.
  fn pending_sync(&self) -> Option<Event> {
    let (queue, tag) = self.pending.as_ref()?;
    match queue.len(EntryStatus::Pending) {
      Ok(0) => None,
      Ok(pending) => {
        debug!(pending, "queued submissions waiting while online");
        Some(Event::Sync { tag: tag.clone() })
      }
      Err(e) => {
        warn!(error = %e, "Failed to read queue size");
        None
      }
    }
  }

  /// Probe once.
  pub async fn probe(&self) -> ConnectivityState {
    match self.http.send(&Request::get(self.probe_url.clone())).await {
      Ok(response) => {
        debug!(status = response.status, "connectivity probe answered");
        ConnectivityState::Online
      }
      Err(e) => {
        debug!(error = %e, "connectivity probe failed");
        ConnectivityState::Offline
      }
    }
  }

  /// Spawn the probe loop. The first observation is always sent; after that only
  /// changes are, plus sync requests while online. Stops when cancelled or when the
  /// event receiver is gone.
  pub fn spawn(self, tx: mpsc::UnboundedSender<Event>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      let mut last: Option<ConnectivityState> = None;

      loop {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          _ = ticker.tick() => {}
        }

        let state = self.probe().await;
        let event = if last == Some(state) {
          match state {
            ConnectivityState::Online => self.pending_sync(),
            ConnectivityState::Offline => None,
          }
        } else {
          info!(state = state.as_str(), "connectivity changed");
          last = Some(state);
          Some(Event::Connectivity(state))
        };

        if let Some(event) = event {
          if tx.send(event).is_err() {
            break;
          }
        }
      }
    })
  }
}
