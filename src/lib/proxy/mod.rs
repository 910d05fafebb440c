pub mod balance;
pub mod context;
pub mod error;
pub mod forward;
pub mod handler;
pub mod header;
pub mod recorder;
pub mod sticky;
pub mod websocket;

use futures::future::BoxFuture;
use hyper::{Request, Response};
use std::net::SocketAddr;

use crate::body::Body;

/// Remote address of the accepted client connection. Server glue inserts
/// this into request extensions so the default header rewriter can emit
/// `x-forwarded-for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

/// A link in the middleware chain: the balancer delegates to its next
/// handler (normally the forwarder) through this.
pub trait Handler: Send + Sync + 'static {
  fn serve(&self, req: Request<Body>) -> BoxFuture<'static, Response<Body>>;
}
