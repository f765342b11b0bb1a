//! Auth context attached to outgoing calls.
//!
//! Token issuance and refresh belong to the session manager; the core only asks
//! for whatever bearer token is current at call time.

use crate::transport::Request;

pub trait AuthProvider: Send + Sync {
  fn bearer_token(&self) -> Option<String>;
}

/// No credentials.
pub struct Anonymous;

impl AuthProvider for Anonymous {
  fn bearer_token(&self) -> Option<String> {
    None
  }
}

/// Fixed token, e.g. handed over by the session manager at startup.
pub struct StaticToken(pub String);

impl AuthProvider for StaticToken {
  fn bearer_token(&self) -> Option<String> {
    Some(self.0.clone())
  }
}

/// Reads the token from an environment variable on every call.
pub struct EnvToken {
  var: String,
}

impl EnvToken {
  pub fn new(var: impl Into<String>) -> Self {
    Self { var: var.into() }
  }
}

impl AuthProvider for EnvToken {
  fn bearer_token(&self) -> Option<String> {
    std::env::var(&self.var).ok().filter(|t| !t.is_empty())
  }
}

/// Returns a copy of `request` carrying the current auth context.
pub(crate) fn authorize(request: &Request, auth: &dyn AuthProvider) -> Request {
  let mut outgoing = request.clone();
  if let Some(token) = auth.bearer_token() {
    outgoing
      .headers
      .retain(|k, _| !k.eq_ignore_ascii_case("authorization"));
    outgoing
      .headers
      .insert("Authorization".to_string(), format!("Bearer {}", token));
  }
  if outgoing.payload.is_some() && !has_header(&outgoing, "content-type") {
    outgoing
      .headers
      .insert("Content-Type".to_string(), "application/json".to_string());
  }
  outgoing
}

fn has_header(request: &Request, name: &str) -> bool {
  request.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_authorize_replaces_stale_token() {
    let request = Request::get("/auth/me").with_header("Authorization", "Bearer old");
    let outgoing = authorize(&request, &StaticToken("fresh".into()));
    assert_eq!(outgoing.headers["Authorization"], "Bearer fresh");
  }

  #[test]
  fn test_authorize_adds_json_content_type_for_payloads() {
    let request = Request::post("/loans/apply", json!({"amount": 1000}));
    let outgoing = authorize(&request, &Anonymous);
    assert_eq!(outgoing.headers["Content-Type"], "application/json");
    assert!(!outgoing.headers.contains_key("Authorization"));

    let form = Request::post("/auth/login", json!("a=b"))
      .with_header("content-type", "application/x-www-form-urlencoded");
    let outgoing = authorize(&form, &Anonymous);
    assert!(!outgoing.headers.contains_key("Content-Type"));
  }
}
