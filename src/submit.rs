//! Widget-side scan submission with queue fallback.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::FetchInterceptor;
use crate::event::Event;
use crate::net::{Request, Response};
use crate::queue::{NewScanEntry, PendingScanEntry, QueueStore};

/// Where and as whom scans are submitted, as configured on the widget.
#[derive(Debug, Clone)]
pub struct SubmissionTarget {
  pub url: Url,
  pub access_token: String,
  pub token_id: String,
}

impl SubmissionTarget {
  /// Build the outbound request for a JSON scan payload.
  pub fn request(&self, payload: Vec<u8>) -> Request {
    Request::new(Method::POST, self.url.clone())
      .with_header("Content-Type", "application/json")
      .with_header("Authorization", format!("Bearer {}", self.access_token))
      .with_header("X-Token-Id", self.token_id.clone())
      .with_body(payload)
  }
}

#[derive(Debug)]
pub enum SubmitOutcome {
  /// The server accepted the scan
  Delivered(Response),
  /// Delivery failed; the scan waits in the queue for the next sync
  Queued {
    entry: PendingScanEntry,
    reason: String,
  },
}

pub struct ScanSubmitter {
  interceptor: Arc<FetchInterceptor>,
  queue: Arc<dyn QueueStore>,
  target: SubmissionTarget,
  /// Where to register a sync once something is queued
  sync: Option<(mpsc::UnboundedSender<Event>, String)>,
}

impl ScanSubmitter {
  pub fn new(
    interceptor: Arc<FetchInterceptor>,
    queue: Arc<dyn QueueStore>,
    target: SubmissionTarget,
  ) -> Self {
    Self {
      interceptor,
      queue,
      target,
      sync: None,
    }
  }

  /// Register a background sync for `tag` with the worker whenever a scan is queued.
  pub fn with_sync(mut self, events: mpsc::UnboundedSender<Event>, tag: impl Into<String>) -> Self {
    self.sync = Some((events, tag.into()));
    self
  }

  /// Submit a scan. Network failures and non-success statuses are absorbed by queueing;
  /// failing to queue is returned as an error since the scan would otherwise be lost.
  pub async fn submit(&self, payload: Vec<u8>) -> Result<SubmitOutcome> {
    let request = self.target.request(payload);

    let reason = match self.interceptor.fetch(&request).await {
      Ok(result) if result.data.is_ok() => {
        info!(status = result.data.status, "scan delivered");
        return Ok(SubmitOutcome::Delivered(result.data));
      }
      Ok(result) => format!("server returned {}", result.data.status),
      Err(e) => e.to_string(),
    };

    let entry = self
      .queue
      .add(NewScanEntry::from(&request))
      .map_err(|e| eyre!("Scan could not be delivered ({}) nor queued: {}", reason, e))?;

    warn!(id = %entry.id, %reason, "scan queued for retry");

    if let Some((events, tag)) = &self.sync {
      if events.send(Event::Sync { tag: tag.clone() }).is_err() {
        debug!(%tag, "worker gone, queued scan waits for the next sync");
      }
    }

    Ok(SubmitOutcome::Queued { entry, reason })
  }
}
