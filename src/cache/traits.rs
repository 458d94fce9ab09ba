//! Core traits and types for the asset cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::net::{HeaderList, Request, Response};

/// Canonical identity of a request: method plus absolute URL, query included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn from_request(request: &Request) -> Self {
    let mut url = request.url.clone();
    // Fragments never reach the server
    url.set_fragment(None);
    Self {
      method: request.method.as_str().to_uppercase(),
      url: url.into(),
    }
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Immutable snapshot of a successful response.
#[derive(Debug, Clone)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: HeaderList,
  pub body: Vec<u8>,
  pub cached_at: DateTime<Utc>,
}

impl StoredResponse {
  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  /// Fully populated, not yet serving
  Installed,
  /// The generation requests are served from
  Active,
}

impl GenerationState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installed => "installed",
      Self::Active => "active",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "installed" => Some(Self::Installed),
      "active" => Some(Self::Active),
      _ => None,
    }
  }
}

/// A versioned set of stored responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
  pub name: String,
  pub state: GenerationState,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Atomically write a whole generation. Either every entry is stored and the
  /// generation is recorded as installed, or nothing changes.
  fn install_generation(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Look up a stored response in a generation.
  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Store a response unless the key is already present. Returns whether a row was written;
  /// writes into unknown generations are dropped.
  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<bool>;

  /// All known generations, oldest first.
  fn generations(&self) -> Result<Vec<CacheGeneration>>;

  /// Delete a generation and every entry it owns. Returns whether it existed.
  fn delete_generation(&self, generation: &str) -> Result<bool>;

  /// Make an installed generation the active one.
  fn mark_active(&self, generation: &str) -> Result<()>;

  /// Number of stored responses in a generation.
  fn entry_count(&self, generation: &str) -> Result<usize>;

  /// The generation currently serving requests, if any.
  fn active_generation(&self) -> Result<Option<String>> {
    Ok(
      self
        .generations()?
        .into_iter()
        .find(|g| g.state == GenerationState::Active)
        .map(|g| g.name),
    )
  }
}

/// Result from an intercepted fetch, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the network
  Network,
  /// Served from the active cache generation
  Cache,
}
