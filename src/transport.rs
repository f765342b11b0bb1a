//! Request/response envelope and the live-call transport.
//!
//! The core is protocol-agnostic: it only needs to know whether a call produced
//! a response (any status) or never reached the backend at all.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Create/update/delete semantics. These are queued when offline.
  pub fn is_mutating(self) -> bool {
    matches!(
      self,
      Method::Post | Method::Put | Method::Patch | Method::Delete
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

/// A logical request as issued by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
  pub method: Method,
  /// Path relative to the API base, optionally with a query string
  pub target: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
}

impl Request {
  pub fn new(method: Method, target: impl Into<String>) -> Self {
    Self {
      method,
      target: target.into(),
      payload: None,
      headers: BTreeMap::new(),
    }
  }

  pub fn get(target: impl Into<String>) -> Self {
    Self::new(Method::Get, target)
  }

  pub fn post(target: impl Into<String>, payload: Value) -> Self {
    Self::new(Method::Post, target).with_payload(payload)
  }

  pub fn with_payload(mut self, payload: Value) -> Self {
    self.payload = Some(payload);
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }
}

/// A response that actually came back from the backend, whatever its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  pub body: Value,
}

impl Response {
  pub fn new(status: u16, body: Value) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  /// No response reached us: DNS, refused connection, reset, timeout.
  #[error("backend unreachable: {0}")]
  Unreachable(String),
  /// The request could not be built at all.
  #[error("invalid request: {0}")]
  Invalid(String),
}

/// Performs live calls against the backend.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

/// reqwest-backed transport with a bounded per-call timeout.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: String,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> color_eyre::Result<Self> {
    Url::parse(base_url)
      .map_err(|e| color_eyre::eyre::eyre!("Invalid base URL {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .connect_timeout(timeout)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
    })
  }

  fn url_for(&self, target: &str) -> Result<Url, TransportError> {
    let joined = if target.starts_with('/') {
      format!("{}{}", self.base_url, target)
    } else {
      format!("{}/{}", self.base_url, target)
    };
    Url::parse(&joined).map_err(|e| TransportError::Invalid(format!("{}: {}", joined, e)))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &Request) -> Result<Response, TransportError> {
    let url = self.url_for(&request.target)?;
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| TransportError::Invalid(e.to_string()))?;

    let mut builder = self.client.request(method, url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(payload) = &request.payload {
      builder = builder.json(payload);
    }

    let response = builder.send().await.map_err(classify)?;

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

    // A status line arrived, so this is a response even if the body is cut off
    let body = match response.bytes().await {
      Ok(bytes) => decode_body(&bytes),
      Err(e) => {
        warn!(
          method = %request.method,
          path = %request.target,
          status,
          error = %e,
          "response body lost"
        );
        Value::Null
      }
    };
    debug!(method = %request.method, path = %request.target, status, "live call completed");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

fn classify(e: reqwest::Error) -> TransportError {
  if e.is_builder() {
    TransportError::Invalid(e.to_string())
  } else if e.is_timeout() {
    TransportError::Unreachable(format!("timed out: {}", e))
  } else {
    TransportError::Unreachable(e.to_string())
  }
}

fn decode_body(bytes: &[u8]) -> Value {
  if bytes.is_empty() {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_mutating_methods() {
    assert!(Method::Post.is_mutating());
    assert!(Method::Put.is_mutating());
    assert!(Method::Patch.is_mutating());
    assert!(Method::Delete.is_mutating());
    assert!(!Method::Get.is_mutating());
    assert!(!Method::Head.is_mutating());
  }

  #[test]
  fn test_method_parse_is_case_insensitive() {
    assert_eq!("patch".parse::<Method>(), Ok(Method::Patch));
    assert!("TRACE".parse::<Method>().is_err());
  }

  #[test]
  fn test_url_for_keeps_base_path() {
    let transport =
      HttpTransport::new("http://localhost:8001/api/v1/", Duration::from_secs(1)).unwrap();
    assert_eq!(
      transport.url_for("/loans/42").unwrap().as_str(),
      "http://localhost:8001/api/v1/loans/42"
    );
    assert_eq!(
      transport.url_for("payments/").unwrap().as_str(),
      "http://localhost:8001/api/v1/payments/"
    );
  }

  #[test]
  fn test_decode_body_falls_back_to_text() {
    assert_eq!(decode_body(b""), Value::Null);
    assert_eq!(decode_body(br#"{"id":1}"#), json!({"id": 1}));
    assert_eq!(decode_body(b"Bad Gateway"), json!("Bad Gateway"));
  }

  #[tokio::test]
  async fn test_refused_connection_is_unreachable() {
    // Bind then drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = HttpTransport::new(
      &format!("http://127.0.0.1:{}/api", port),
      Duration::from_secs(2),
    )
    .unwrap();

    let err = transport.send(&Request::get("/loans/")).await.unwrap_err();
    assert!(matches!(err, TransportError::Unreachable(_)));
  }

  /// Read one request off the socket: headers plus a Content-Length body.
  async fn read_request(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
    use tokio::io::AsyncReadExt;

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
      let n = stream.read(&mut buf).await.unwrap();
      if n == 0 {
        return received;
      }
      received.extend_from_slice(&buf[..n]);

      let text = String::from_utf8_lossy(&received).to_string();
      if let Some(end) = text.find("\r\n\r\n") {
        let body_len = text[..end]
          .lines()
          .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name
              .eq_ignore_ascii_case("content-length")
              .then(|| value.trim().parse::<usize>().ok())
              .flatten()
          })
          .unwrap_or(0);
        if received.len() >= end + 4 + body_len {
          return received;
        }
      }
    }
  }

  #[tokio::test]
  async fn test_truncated_body_still_yields_the_status() {
    use tokio::io::AsyncWriteExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      read_request(&mut stream).await;
      // Promises 100 bytes of body, sends six, then hangs up
      let head = "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n";
      stream.write_all(head.as_bytes()).await.unwrap();
      stream.write_all(br#"{"id":"#).await.unwrap();
      stream.flush().await.unwrap();
      stream.shutdown().await.unwrap();
    });

    let transport = HttpTransport::new(
      &format!("http://127.0.0.1:{}/api", port),
      Duration::from_secs(2),
    )
    .unwrap();

    let response = transport
      .send(&Request::post("/payments/create", json!({ "amount": 250 })))
      .await
      .unwrap();
    assert_eq!(response.status, 201);
    assert!(response.is_success());
    assert_eq!(response.body, Value::Null);
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_silent_backend_times_out_as_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    // Accept and hold the connection without ever answering
    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(5)).await;
      drop(stream);
    });

    let transport = HttpTransport::new(
      &format!("http://127.0.0.1:{}/api", port),
      Duration::from_millis(100),
    )
    .unwrap();

    let err = transport.send(&Request::get("/loans/")).await.unwrap_err();
    match err {
      TransportError::Unreachable(reason) => assert!(reason.starts_with("timed out")),
      other => panic!("expected unreachable, got {:?}", other),
    }
    server.abort();
  }
}
