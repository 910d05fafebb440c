#![allow(clippy::declare_interior_mutable_const)]
use hyper::header::{
  HeaderName, HeaderValue, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
  TRANSFER_ENCODING, UPGRADE,
};
use hyper::HeaderMap;

use crate::util::trim;

pub const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
// the legacy plural spelling some agents still send
pub const TRAILERS: HeaderName = HeaderName::from_static("trailers");

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_SERVER: HeaderName = HeaderName::from_static("x-forwarded-server");

pub const CONNECTION_UPGRADE: HeaderValue = HeaderValue::from_static("upgrade");
pub const TEXT_PLAIN: HeaderValue = HeaderValue::from_static("text/plain; charset=utf-8");

/// Strip the hop-by-hop set: these headers describe a single transport hop
/// and must never be relayed.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
  headers.remove(CONNECTION);
  headers.remove(KEEP_ALIVE);
  headers.remove(PROXY_AUTHENTICATE);
  headers.remove(PROXY_AUTHORIZATION);
  headers.remove(TE);
  headers.remove(TRAILER);
  headers.remove(TRAILERS);
  headers.remove(TRANSFER_ENCODING);
  headers.remove(UPGRADE);
}

/// split a comma separated header value, trimmed, empty items dropped
pub fn list(header: &[u8]) -> impl Iterator<Item = &[u8]> {
  header
    .split(|c| *c == b',')
    .map(trim)
    .filter(|item| !item.is_empty())
}

/// whether a comma separated header value lists `value`, case insensitive
pub fn list_contains(header: &[u8], value: &[u8]) -> bool {
  list(header).any(|item| item.eq_ignore_ascii_case(value))
}

/// The media type of a `Content-Type` value: everything before the first
/// `;`, trimmed and lowercased. None for missing or non-ascii values.
pub fn media_type(value: Option<&HeaderValue>) -> Option<String> {
  let value = value?.to_str().ok()?;
  let mime = value.split(';').next()?;
  Some(mime.trim().to_ascii_lowercase())
}
