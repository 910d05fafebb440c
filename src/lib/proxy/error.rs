use http::StatusCode;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, Uri};
use std::error::Error as StdError;

use super::header::TEXT_PLAIN;
use crate::body::Body;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
  #[error("error forwarding to {url}: {source}")]
  RoundTrip {
    url: Uri,
    #[source]
    source: BoxError,
  },

  #[error("error dialing {addr}: {source}")]
  Dial {
    addr: String,
    #[source]
    source: std::io::Error,
  },

  #[error("unable to hijack the connection: upgrade not supported here")]
  NotHijackable,

  #[error("unable to copy request to target: {0}")]
  HandshakeWrite(#[source] std::io::Error),

  #[error("error reading handshake response: {0}")]
  HandshakeRead(#[source] std::io::Error),

  #[error("invalid handshake response: {0}")]
  HandshakeParse(httparse::Error),

  #[error("invalid handshake response head")]
  HandshakeResponse,

  #[error("handshake response head too large")]
  HandshakeHeadTooLarge,

  #[error("missing host in target url")]
  MissingTargetHost,

  #[error("incoming body error: {0}")]
  IncomingBody(#[source] hyper::Error),

  #[error("error copying upstream response body: {0}")]
  BodyCopy(#[source] BoxError),

  #[error("error relaying upstream connection: {0}")]
  Relay(#[source] std::io::Error),
}

/// Renders an error into the response sent to the client. Only consulted
/// before response headers are committed.
pub trait ErrorHandler: Send + Sync {
  fn render(&self, err: &(dyn StdError + 'static)) -> Response<Body>;
}

/// Timeouts render as 504, other transport failures as 502, anything else
/// as 500.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
  fn render(&self, err: &(dyn StdError + 'static)) -> Response<Body> {
    status_response(status_for(err))
  }
}

fn status_for(err: &(dyn StdError + 'static)) -> StatusCode {
  let mut found_transport = false;

  let mut current: Option<&(dyn StdError + 'static)> = Some(err);
  while let Some(e) = current {
    if let Some(io) = e.downcast_ref::<std::io::Error>() {
      return match io.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
          StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::BAD_GATEWAY,
      };
    }

    if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
      if hyper_err.is_timeout() {
        return StatusCode::GATEWAY_TIMEOUT;
      }
      found_transport = true;
    }

    if e.downcast_ref::<hyper_util::client::legacy::Error>().is_some() {
      found_transport = true;
    }

    current = e.source();
  }

  if found_transport {
    StatusCode::BAD_GATEWAY
  } else {
    StatusCode::INTERNAL_SERVER_ERROR
  }
}

pub fn status_response(status: StatusCode) -> Response<Body> {
  let body = format!(
    "{} {}\n",
    status.as_str(),
    status.canonical_reason().unwrap_or("")
  );

  let mut res = Response::new(Body::full(body));
  *res.status_mut() = status;
  res.headers_mut().insert(CONTENT_TYPE, TEXT_PLAIN);
  res
}
