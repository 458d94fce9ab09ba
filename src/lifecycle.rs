//! Cache generation install and activation.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{info, instrument};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::context::ProcessContext;
use crate::net::{HttpClient, Request};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub generation: String,
  pub assets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
  pub generation: String,
  /// Generations deleted during activation
  pub purged: Vec<String>,
}

/// Moves the configured generation through install and activation.
pub struct LifecycleManager {
  storage: Arc<dyn CacheStorage>,
  http: HttpClient,
  context: Arc<ProcessContext>,
  manifest: Vec<Url>,
}

impl LifecycleManager {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    http: HttpClient,
    context: Arc<ProcessContext>,
    manifest: Vec<Url>,
  ) -> Self {
    Self {
      storage,
      http,
      context,
      manifest,
    }
  }

  /// Pre-cache every manifest asset into the new generation.
  ///
  /// All assets are fetched before anything is written; one failed fetch fails the
  /// install and leaves storage untouched.
  #[instrument(skip(self), fields(generation = %self.context.generation()))]
  pub async fn install(&self) -> Result<InstallReport> {
    let generation = self.context.generation().to_string();
    let name = generation.as_str();

    let fetches = self.manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = self
        .http
        .send(&request)
        .await
        .map_err(|e| eyre!("Install of {} failed: {}", name, e))?;
      if !response.is_ok() {
        return Err(eyre!(
          "Install of {} failed: {} returned {}",
          name,
          url,
          response.status
        ));
      }
      Ok((RequestKey::from_request(&request), response))
    });
    let entries = try_join_all(fetches).await?;

    self.storage.install_generation(&generation, &entries)?;
    info!(assets = entries.len(), "generation installed");

    Ok(InstallReport {
      generation,
      assets: entries.len(),
    })
  }

  /// Purge every other generation, then start serving the new one.
  #[instrument(skip(self), fields(generation = %self.context.generation()))]
  pub async fn activate(&self) -> Result<ActivateReport> {
    let generation = self.context.generation().to_string();
    let existing = self.storage.generations()?;

    if !existing.iter().any(|g| g.name == generation) {
      return Err(eyre!(
        "Cannot activate {}: generation is not installed",
        generation
      ));
    }

    let mut purged = Vec::new();
    for stale in existing.into_iter().filter(|g| g.name != generation) {
      self.storage.delete_generation(&stale.name)?;
      info!(stale = %stale.name, "purged cache generation");
      purged.push(stale.name);
    }

    self.storage.mark_active(&generation)?;
    self.context.set_active_generation(generation.clone());
    info!(purged = purged.len(), "generation active");

    Ok(ActivateReport { generation, purged })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::{CacheGeneration, GenerationState};
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::net::test_support::unreachable_url;
  use std::time::Duration;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn storage() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )))
  }

  fn manager(
    storage: Arc<SqliteStorage>,
    generation: &str,
    manifest: Vec<Url>,
  ) -> (LifecycleManager, Arc<ProcessContext>) {
    let context = Arc::new(ProcessContext::new(generation));
    let manager = LifecycleManager::new(
      storage,
      HttpClient::new(Duration::from_secs(5)).unwrap(),
      context.clone(),
      manifest,
    );
    (manager, context)
  }

  async fn asset_server() -> MockServer {
    let server = MockServer::start().await;
    for (p, body) in [("/", "<html>"), ("/styles.css", "body{}"), ("/scanner.js", "js")] {
      Mock::given(method("GET"))
        .and(path(p))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    }
    server
  }

  fn manifest(server: &MockServer, paths: &[&str]) -> Vec<Url> {
    let base = Url::parse(&server.uri()).unwrap();
    paths.iter().map(|p| base.join(p).unwrap()).collect()
  }

  #[tokio::test]
  async fn test_install_stores_every_asset() {
    let server = asset_server().await;
    let storage = storage();
    let urls = manifest(&server, &["/", "/styles.css", "/scanner.js"]);
    let (manager, context) = manager(storage.clone(), "v1", urls.clone());

    let report = manager.install().await.unwrap();
    assert_eq!(report.assets, 3);
    assert_eq!(storage.entry_count("v1").unwrap(), 3);

    let css = storage
      .get("v1", &RequestKey::from_request(&Request::get(urls[1].clone())))
      .unwrap()
      .unwrap();
    assert_eq!(css.body, b"body{}");

    // Installed is not yet serving
    assert!(context.active_generation().is_none());
    assert_eq!(
      storage.generations().unwrap()[0].state,
      GenerationState::Installed
    );
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let server = asset_server().await;
    Mock::given(method("GET"))
      .and(path("/gone.png"))
      .respond_with(ResponseTemplate::new(404))
      .mount(&server)
      .await;
    let storage = storage();

    let mut urls = manifest(&server, &["/", "/styles.css", "/gone.png"]);
    let (m, _) = manager(storage.clone(), "v1", urls.clone());
    assert!(m.install().await.is_err());

    urls.push(unreachable_url("/cdn.js"));
    urls.retain(|u| u.path() != "/gone.png");
    let (m, _) = manager(storage.clone(), "v1", urls);
    assert!(m.install().await.is_err());

    assert!(storage.generations().unwrap().is_empty());
    assert_eq!(storage.entry_count("v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activate_purges_other_generations() {
    let server = asset_server().await;
    let storage = storage();
    storage.install_generation("v1", &[]).unwrap();
    storage.install_generation("v2", &[]).unwrap();
    storage.mark_active("v2").unwrap();

    let (m, context) = manager(storage.clone(), "v3", manifest(&server, &["/styles.css"]));
    m.install().await.unwrap();
    let report = m.activate().await.unwrap();

    let mut purged = report.purged.clone();
    purged.sort();
    assert_eq!(purged, vec!["v1", "v2"]);
    assert_eq!(
      storage.generations().unwrap(),
      vec![CacheGeneration {
        name: "v3".into(),
        state: GenerationState::Active
      }]
    );
    assert_eq!(context.active_generation().as_deref(), Some("v3"));
    assert_eq!(storage.entry_count("v3").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_activate_without_install_fails() {
    let storage = storage();
    storage.install_generation("v1", &[]).unwrap();
    storage.mark_active("v1").unwrap();

    let (m, context) = manager(storage.clone(), "v2", Vec::new());
    assert!(m.activate().await.is_err());

    // The old generation keeps serving
    assert_eq!(storage.active_generation().unwrap().as_deref(), Some("v1"));
    assert!(context.active_generation().is_none());
  }
}
