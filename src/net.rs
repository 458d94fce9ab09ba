//! Request/response snapshots and the HTTP client every component sends through.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Header list in wire order.
pub type HeaderList = Vec<(String, String)>;

/// An outbound request as seen by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderList,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  /// Whether the request targets the submission API namespace.
  pub fn is_api(&self, api_segment: &str) -> bool {
    self.url.path().contains(api_segment)
  }
}

/// A fully buffered response. Cloning it is how a response is both stored and returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: HeaderList,
  pub body: Vec<u8>,
}

impl Response {
  /// 2xx status, the platform's notion of an "ok" response.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Thin wrapper over reqwest that buffers bodies into [`Response`] snapshots.
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("scan-offline/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// Send a request. Any response, whatever its status, is `Ok`; only transport
  /// failures (unreachable host, timeout, broken body) are errors.
  pub async fn send(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    debug!(method = %request.method, url = %request.url, "sending request");

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("{} {} failed: {}", request.method, request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    debug!(method = %request.method, url = %request.url, status, "received response");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
pub(crate) mod test_support {
  use std::net::TcpListener;
  use url::Url;

  /// A URL on a local port nothing listens on, so requests fail with ECONNREFUSED.
  pub fn unreachable_url(path: &str) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{}{}", addr, path)).unwrap()
  }
}
