use hyper::header::{CONNECTION, UPGRADE};
use hyper::HeaderMap;

use crate::proxy::header::list_contains;

// matched case insensitive against the comma lists in both headers
const UPGRADE_ITEM: &[u8] = b"upgrade";
const WEBSOCKET_ITEM: &[u8] = b"websocket";

/// Whether the request is a websocket handshake: the `Connection` header
/// lists `upgrade` and the `Upgrade` header lists `websocket`, both matched
/// as trimmed, case-insensitive comma-list items.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
  let connection = match headers.get(CONNECTION) {
    Some(connection) => connection,
    None => return false,
  };

  if !list_contains(connection.as_bytes(), UPGRADE_ITEM) {
    return false;
  }

  match headers.get(UPGRADE) {
    Some(upgrade) => list_contains(upgrade.as_bytes(), WEBSOCKET_ITEM),
    None => false,
  }
}
