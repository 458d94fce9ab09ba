//! Fetch interceptor: cache-first lookups with opportunistic population.

use color_eyre::Result;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{CacheResult, CacheStorage, RequestKey};
use crate::context::ProcessContext;
use crate::net::{HttpClient, Request, Response};
use crate::tasks::SideTasks;

/// Sits in front of every outbound request.
///
/// A request that was stored in the active generation is answered from the cache
/// without touching the network, for as long as that generation lives. Misses go to
/// the network, and plain 200 responses for non-API paths are stored in the
/// background.
pub struct FetchInterceptor {
  storage: Arc<dyn CacheStorage>,
  http: HttpClient,
  context: Arc<ProcessContext>,
  tasks: SideTasks,
  api_segment: String,
}

impl FetchInterceptor {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    http: HttpClient,
    context: Arc<ProcessContext>,
    tasks: SideTasks,
    api_segment: impl Into<String>,
  ) -> Self {
    Self {
      storage,
      http,
      context,
      tasks,
      api_segment: api_segment.into(),
    }
  }

  /// Only GET requests outside the API namespace ever touch the cache.
  fn is_cacheable(&self, request: &Request) -> bool {
    request.method == Method::GET && !request.is_api(&self.api_segment)
  }

  /// Produce a response for `request`.
  ///
  /// 1. Active generation hit: return it, no network
  /// 2. Miss: fetch from network; transport failures propagate
  /// 3. Cacheable and status 200: store a copy in the background
  pub async fn fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    let generation = self.context.active_generation();
    let cacheable = self.is_cacheable(request);
    let key = RequestKey::from_request(request);

    if let (true, Some(generation)) = (cacheable, generation.as_deref()) {
      match self.storage.get(generation, &key) {
        Ok(Some(stored)) => {
          debug!(%key, generation, "serving from cache");
          return Ok(CacheResult::from_cache(stored.to_response(), stored.cached_at));
        }
        Ok(None) => {}
        // A broken cache read degrades to a network fetch
        Err(e) => warn!(%key, error = %e, "cache lookup failed"),
      }
    }

    let response = self.http.send(request).await?;

    if cacheable && response.status == 200 {
      if let Some(generation) = generation {
        self.store_in_background(generation, key, response.clone());
      }
    }

    Ok(CacheResult::from_network(response))
  }

  fn store_in_background(&self, generation: String, key: RequestKey, response: Response) {
    let storage = Arc::clone(&self.storage);
    self.tasks.spawn("cache-put", async move {
      if storage.put(&generation, &key, &response)? {
        debug!(%key, %generation, "cached response");
      }
      Ok(())
    });
  }
}
