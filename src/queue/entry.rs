use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::collections::BTreeMap;
use url::Url;

use crate::net::Request;

/// Partition of the queue an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  /// Waiting for a successful replay
  Pending,
}

impl EntryStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(Self::Pending),
      _ => None,
    }
  }
}

/// A scan submission to be queued; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewScanEntry {
  pub url: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl From<&Request> for NewScanEntry {
  fn from(request: &Request) -> Self {
    Self {
      url: request.url.to_string(),
      method: request.method.as_str().to_string(),
      headers: request.headers.iter().cloned().collect(),
      body: request.body.clone(),
    }
  }
}

/// A durably queued scan submission that has not been delivered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingScanEntry {
  pub id: String,
  pub status: EntryStatus,
  pub url: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  /// Milliseconds since the Unix epoch
  pub timestamp: i64,
}

impl PendingScanEntry {
  /// Rebuild the original request for replay.
  pub fn to_request(&self) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Entry {} has invalid method '{}': {}", self.id, self.method, e))?;
    let url = Url::parse(&self.url)
      .map_err(|e| eyre!("Entry {} has invalid url '{}': {}", self.id, self.url, e))?;

    Ok(Request {
      method,
      url,
      headers: self
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
      body: self.body.clone(),
    })
  }

  pub fn enqueued_at(&self) -> DateTime<Utc> {
    Utc
      .timestamp_millis_opt(self.timestamp)
      .single()
      .unwrap_or_default()
  }

  pub fn age(&self) -> chrono::Duration {
    Utc::now() - self.enqueued_at()
  }
}
