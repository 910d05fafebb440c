use cookie::Cookie;
use hyper::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use std::sync::Arc;
use url::Url;

use super::balance::{same_url, Backend};
use super::error::BoxError;

#[derive(Debug, thiserror::Error)]
pub enum StickyError {
  #[error("invalid sticky cookie url: {0}")]
  InvalidCookieUrl(#[source] url::ParseError),
}

/// Cookie session affinity: maps a cookie value (a backend URL) back to a
/// live backend of the pool. Stateless besides the cookie name.
#[derive(Debug, Clone)]
pub struct StickySession {
  cookie_name: String,
}

impl StickySession {
  pub fn new(cookie_name: impl Into<String>) -> Self {
    Self {
      cookie_name: cookie_name.into(),
    }
  }

  pub fn cookie_name(&self) -> &str {
    &self.cookie_name
  }

  /// The backend the request's sticky cookie points at, iff that backend is
  /// still among `servers`. No cookie or a stale cookie resolves to `None`;
  /// a cookie value that is not a URL is an error.
  pub fn resolve(
    &self,
    headers: &HeaderMap,
    servers: &[Arc<Backend>],
  ) -> Result<Option<Arc<Backend>>, StickyError> {
    let value = match self.cookie_value(headers) {
      Some(value) => value,
      None => return Ok(None),
    };

    let url = Url::parse(&value).map_err(StickyError::InvalidCookieUrl)?;

    Ok(servers.iter().find(|s| same_url(&url, s.url())).cloned())
  }

  /// Annotate the response with a sticky cookie for `backend`. The value is
  /// the backend URL verbatim; path and expiry are the caller's concern.
  pub fn stick(&self, backend: &Backend, headers: &mut HeaderMap) {
    let cookie = Cookie::new(self.cookie_name.clone(), backend.url().to_string());
    if let Ok(value) = HeaderValue::try_from(cookie.to_string()) {
      headers.append(SET_COOKIE, value);
    }
  }

  fn cookie_value(&self, headers: &HeaderMap) -> Option<String> {
    for header in headers.get_all(COOKIE) {
      let raw = match header.to_str() {
        Ok(raw) => raw,
        Err(_) => continue,
      };

      for cookie in Cookie::split_parse(raw) {
        let cookie = match cookie {
          Ok(cookie) => cookie,
          Err(_) => continue,
        };

        if cookie.name() == self.cookie_name {
          return Some(cookie.value().to_string());
        }
      }
    }

    None
  }
}

/// What a verified signed token exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
  pub group_id: u32,
}

/// A signed header token as the balancer consumes it: an opaque object that
/// yields its claims and verifies against a candidate HMAC key.
pub trait SignedToken: Send + Sync {
  fn retrieve(&self) -> TokenClaims;
  fn verify(&self, key: &[u8]) -> bool;
}

/// Extracts a signed token from request headers. `Ok(None)` when no token
/// is present; parse failures are errors (observational, never fatal).
pub trait TokenParser: Send + Sync {
  fn from_headers(&self, headers: &HeaderMap) -> Result<Option<Box<dyn SignedToken>>, BoxError>;
}
