//! Process-lifecycle state shared by every component of one process.

use color_eyre::Result;
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;

use crate::cache::CacheStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  Online,
  Offline,
}

impl ConnectivityState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Online => "online",
      Self::Offline => "offline",
    }
  }
}

/// Explicit replacement for ambient globals: which generation this build installs,
/// which one is serving, and the last known connectivity.
pub struct ProcessContext {
  generation: String,
  active: RwLock<Option<String>>,
  connectivity: watch::Sender<ConnectivityState>,
}

impl ProcessContext {
  /// Connectivity starts out offline until a signal says otherwise, so the first
  /// online observation counts as a transition.
  pub fn new(generation: impl Into<String>) -> Self {
    let (connectivity, _) = watch::channel(ConnectivityState::Offline);
    Self {
      generation: generation.into(),
      active: RwLock::new(None),
      connectivity,
    }
  }

  /// Build a context and pick up the generation a previous process activated.
  pub fn bootstrap(generation: impl Into<String>, storage: &dyn CacheStorage) -> Result<Self> {
    let context = Self::new(generation);
    if let Some(active) = storage.active_generation()? {
      context.set_active_generation(active);
    }
    Ok(context)
  }

  /// Generation this build installs and activates.
  pub fn generation(&self) -> &str {
    &self.generation
  }

  /// Generation currently serving cached responses.
  pub fn active_generation(&self) -> Option<String> {
    self
      .active
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn set_active_generation(&self, name: String) {
    *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(name);
  }

  pub fn connectivity(&self) -> ConnectivityState {
    *self.connectivity.borrow()
  }

  /// Record a connectivity observation, returning the previous state.
  pub fn set_connectivity(&self, state: ConnectivityState) -> ConnectivityState {
    self.connectivity.send_replace(state)
  }

  /// Receiver that observes connectivity transitions.
  pub fn watch_connectivity(&self) -> watch::Receiver<ConnectivityState> {
    self.connectivity.subscribe()
  }
}
