use futures::future::BoxFuture;
use http::Version;
use hyper::body::Body as HyperBody;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::error::{BoxError, DefaultErrorHandler, ErrorHandler, ForwardError};
use super::header::{
  media_type, remove_hop_headers, X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO,
  X_FORWARDED_SERVER,
};
use super::recorder::{Finalizer, ResponseRecorder};
use super::{Handler, RemoteAddr};
use crate::body::Body;
use crate::buffer::BufferPool;
use crate::metrics::{Counter, MetricsSink};
use crate::upgrade::is_websocket_request;

const EVENT_STREAM: &str = "text/event-stream";

/// Round-trips one request to the already-rewritten target URL.
pub trait Transport: Send + Sync {
  fn round_trip(&self, req: Request<Body>)
    -> BoxFuture<'static, Result<Response<Body>, BoxError>>;
}

/// What the websocket relay needs from a backend connection.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// Opens a raw connection to `host:port` for the websocket relay.
pub trait Dialer: Send + Sync {
  fn dial(&self, addr: String) -> BoxFuture<'static, std::io::Result<Box<dyn Conn>>>;
}

/// Mutates the outbound request before it leaves, e.g. to emit
/// `x-forwarded-*` headers.
pub trait HeaderRewriter: Send + Sync {
  fn rewrite(&self, req: &mut Request<Body>);
}

struct HyperTransport {
  client: Client<HttpConnector, Body>,
}

impl HyperTransport {
  fn new() -> Self {
    Self {
      client: Client::builder(TokioExecutor::new()).build_http(),
    }
  }
}

impl Transport for HyperTransport {
  fn round_trip(
    &self,
    req: Request<Body>,
  ) -> BoxFuture<'static, Result<Response<Body>, BoxError>> {
    let fut = self.client.request(req);
    Box::pin(async move {
      let response = fut.await.map_err(|e| Box::new(e) as BoxError)?;
      Ok(response.map(Body::incoming))
    })
  }
}

struct TcpDialer;

impl Dialer for TcpDialer {
  fn dial(&self, addr: String) -> BoxFuture<'static, std::io::Result<Box<dyn Conn>>> {
    Box::pin(async move {
      let stream = TcpStream::connect(&*addr).await?;
      Ok(Box::new(stream) as Box<dyn Conn>)
    })
  }
}

/// The default rewriter: scrubs request-side hop-by-hop headers and fills
/// the `x-forwarded-*` family, naming this host in `x-forwarded-server`.
#[derive(Debug, Clone)]
pub struct ForwardedRewriter {
  pub hostname: String,
  pub trust_forward_header: bool,
}

impl ForwardedRewriter {
  pub fn new() -> Self {
    let hostname = hostname::get()
      .ok()
      .and_then(|h| h.into_string().ok())
      .unwrap_or_else(|| "localhost".to_string());

    Self {
      hostname,
      trust_forward_header: true,
    }
  }
}

impl Default for ForwardedRewriter {
  fn default() -> Self {
    Self::new()
  }
}

impl HeaderRewriter for ForwardedRewriter {
  fn rewrite(&self, req: &mut Request<Body>) {
    let remote = req.extensions().get::<RemoteAddr>().copied();
    let host = req.headers().get(HOST).cloned();

    match remote {
      Some(RemoteAddr(addr)) => {
        let ip = addr.ip().to_string();
        let value = match req.headers().get(X_FORWARDED_FOR) {
          Some(prev) if self.trust_forward_header => match prev.to_str() {
            Ok(prev) => format!("{prev}, {ip}"),
            Err(_) => ip,
          },
          _ => ip,
        };
        if let Ok(value) = HeaderValue::try_from(value) {
          req.headers_mut().insert(X_FORWARDED_FOR, value);
        }
      }

      None => {
        if !self.trust_forward_header {
          req.headers_mut().remove(X_FORWARDED_FOR);
        }
      }
    }

    if !req.headers().contains_key(X_FORWARDED_PROTO) {
      req
        .headers_mut()
        .insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if let Some(host) = host {
      req.headers_mut().insert(X_FORWARDED_HOST, host);
    }

    if let Ok(server) = HeaderValue::try_from(self.hostname.as_str()) {
      req.headers_mut().insert(X_FORWARDED_SERVER, server);
    }

    remove_hop_headers(req.headers_mut());
  }
}

/// Dual-mode request relay: plain HTTP through the transport, websocket
/// handshakes through a raw dial plus bidirectional pump. All pluggable
/// behavior is injected at construction with working defaults.
#[derive(Clone)]
pub struct Forwarder {
  pub(crate) inner: Arc<ForwarderInner>,
}

pub(crate) struct ForwarderInner {
  pub(crate) transport: Arc<dyn Transport>,
  pub(crate) dialer: Arc<dyn Dialer>,
  pub(crate) rewriter: Arc<dyn HeaderRewriter>,
  pub(crate) websocket_rewriter: Option<Arc<dyn HeaderRewriter>>,
  pub(crate) error_handler: Arc<dyn ErrorHandler>,
  pub(crate) pass_host: bool,
  pub(crate) stream_response: bool,
  pub(crate) metrics: Option<MetricsSink>,
  pub(crate) buffer_pool: BufferPool,
}

#[derive(Default)]
pub struct ForwarderBuilder {
  transport: Option<Arc<dyn Transport>>,
  dialer: Option<Arc<dyn Dialer>>,
  rewriter: Option<Arc<dyn HeaderRewriter>>,
  websocket_rewriter: Option<Arc<dyn HeaderRewriter>>,
  error_handler: Option<Arc<dyn ErrorHandler>>,
  pass_host: bool,
  stream_response: bool,
  metrics: Option<MetricsSink>,
  buffer_pool: Option<BufferPool>,
}

impl ForwarderBuilder {
  /// Replace the default hyper client.
  pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
    self.transport = Some(transport);
    self
  }

  /// Replace the default TCP dialer used for websocket targets.
  pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
    self.dialer = Some(dialer);
    self
  }

  pub fn rewriter(mut self, rewriter: Arc<dyn HeaderRewriter>) -> Self {
    self.rewriter = Some(rewriter);
    self
  }

  pub fn websocket_rewriter(mut self, rewriter: Arc<dyn HeaderRewriter>) -> Self {
    self.websocket_rewriter = Some(rewriter);
    self
  }

  pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
    self.error_handler = Some(handler);
    self
  }

  /// Pass the client's `host` header through instead of the target's
  /// authority.
  pub fn pass_host(mut self, pass: bool) -> Self {
    self.pass_host = pass;
    self
  }

  /// Force streaming relays regardless of content type.
  pub fn stream_response(mut self, stream: bool) -> Self {
    self.stream_response = stream;
    self
  }

  /// Observe traffic through this sink.
  pub fn metrics(mut self, metrics: MetricsSink) -> Self {
    self.metrics = Some(metrics);
    self
  }

  pub fn buffer_pool(mut self, pool: BufferPool) -> Self {
    self.buffer_pool = Some(pool);
    self
  }

  pub fn build(self) -> Forwarder {
    Forwarder {
      inner: Arc::new(ForwarderInner {
        transport: self.transport.unwrap_or_else(|| Arc::new(HyperTransport::new())),
        dialer: self.dialer.unwrap_or_else(|| Arc::new(TcpDialer)),
        rewriter: self
          .rewriter
          .unwrap_or_else(|| Arc::new(ForwardedRewriter::new())),
        websocket_rewriter: self.websocket_rewriter,
        error_handler: self
          .error_handler
          .unwrap_or_else(|| Arc::new(DefaultErrorHandler)),
        pass_host: self.pass_host,
        stream_response: self.stream_response,
        metrics: self.metrics,
        buffer_pool: self.buffer_pool.unwrap_or_default(),
      }),
    }
  }
}

impl Forwarder {
  pub fn builder() -> ForwarderBuilder {
    ForwarderBuilder::default()
  }

  /// Relay one request, choosing the websocket or plain-HTTP implementation
  /// by the handshake predicate.
  pub async fn serve(&self, req: Request<Body>) -> Response<Body> {
    if is_websocket_request(req.headers()) {
      self.serve_websocket(req).await
    } else {
      self.serve_http(req).await
    }
  }

  async fn serve_http(&self, mut req: Request<Body>) -> Response<Body> {
    let this = &self.inner;
    let start = Instant::now();

    if let Some(sink) = &this.metrics {
      let http = sink.http();
      http.read.inc(content_length(req.headers()));
      http.connection_count.inc(1);
    }

    // the open gauge must recover on every exit path, a cancelled
    // round trip included
    let open_guard = OpenGuard::new(
      this
        .metrics
        .as_ref()
        .map(|sink| sink.http().connection_open.clone()),
    );

    // outbound: the balancer already rewrote the URI; force http/1.1 and
    // keep-alive so backend connections stay reusable
    *req.version_mut() = Version::HTTP_11;

    this.rewriter.rewrite(&mut req);

    if !this.pass_host {
      if let Some(authority) = req.uri().authority() {
        if let Ok(host) = HeaderValue::try_from(authority.as_str()) {
          req.headers_mut().insert(HOST, host);
        }
      }
    }

    let url = req.uri().clone();

    let upstream_response = match this.transport.round_trip(req).await {
      Ok(response) => response,
      Err(source) => {
        let err = ForwardError::RoundTrip { url, source };
        log::error!("{err}");
        drop(open_guard);
        return this.error_handler.render(&err);
      }
    };

    let (parts, upstream_body) = upstream_response.into_parts();
    let status = parts.status;
    let mut headers = parts.headers;
    remove_hop_headers(&mut headers);

    let stream = this.stream_response
      || media_type(headers.get(CONTENT_TYPE)).as_deref() == Some(EVENT_STREAM);

    // best effort: commit an exact content length when the upstream body
    // advertises one, the headers are not on the wire yet
    if !stream {
      if let Some(exact) = HyperBody::size_hint(&upstream_body).exact() {
        if exact > 0 {
          headers.insert(CONTENT_LENGTH, HeaderValue::from(exact));
        }
      }
    }

    // the recorder's finalizer takes the gauge decrement over from the
    // guard, so it only fires once the body relay is done
    let open_gauge = open_guard.disarm();

    let finalizer: Finalizer = {
      let metrics = this.metrics.clone();
      let url = url.clone();
      Box::new(move |status, written| {
        let elapsed = start.elapsed();
        log::info!(
          "round trip: {url}, code: {}, duration: {elapsed:?}",
          status.as_u16()
        );

        if let Some(sink) = &metrics {
          let http = sink.http();
          http.written.inc(written as i64);
          http.response_time.update(elapsed.as_nanos() as i64);
          http.response_time_window.update(elapsed.as_nanos() as i64);
          sink.inc_http_return_code(status.as_u16());
        }
        if let Some(gauge) = &open_gauge {
          gauge.dec(1);
        }
      })
    };

    let recorder = ResponseRecorder::new(
      upstream_body,
      status,
      stream,
      this.buffer_pool.get(),
      finalizer,
    );

    let mut response = Response::new(Body::stream(recorder));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
  }
}

impl Handler for Forwarder {
  fn serve(&self, req: Request<Body>) -> BoxFuture<'static, Response<Body>> {
    let me = self.clone();
    Box::pin(async move { Forwarder::serve(&me, req).await })
  }
}

#[must_use = "dropping the guard decrements the open gauge"]
struct OpenGuard {
  gauge: Option<Counter>,
}

impl OpenGuard {
  fn new(gauge: Option<Counter>) -> Self {
    if let Some(gauge) = &gauge {
      gauge.inc(1);
    }
    Self { gauge }
  }

  fn disarm(mut self) -> Option<Counter> {
    self.gauge.take()
  }
}

impl Drop for OpenGuard {
  fn drop(&mut self) {
    if let Some(gauge) = &self.gauge {
      gauge.dec(1);
    }
  }
}

fn content_length(headers: &hyper::HeaderMap) -> i64 {
  headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<i64>().ok())
    .unwrap_or(0)
}
