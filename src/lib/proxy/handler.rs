use futures::future::BoxFuture;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::StatusCode;
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::service::Service;
use hyper::{Request, Response, Uri};
use std::convert::Infallible;
use std::sync::Arc;

use super::balance::{Backend, WeightedPool};
use super::context::UpstreamContext;
use super::error::{DefaultErrorHandler, ErrorHandler};
use super::header::TEXT_PLAIN;
use super::sticky::{StickySession, TokenParser};
use super::Handler;
use crate::body::{map_request_body, Body};

/// Front-end request handler: resolves stickiness, selects a backend from
/// the pool, rewrites the target URL and delegates to the next handler
/// (normally the forwarder).
#[derive(Clone)]
pub struct BalancerHandler {
  inner: Arc<HandlerInner>,
}

struct HandlerInner {
  pool: Arc<WeightedPool>,
  next: Arc<dyn Handler>,
  sticky: Option<StickySession>,
  token_parser: Option<Arc<dyn TokenParser>>,
  error_handler: Arc<dyn ErrorHandler>,
}

pub struct BalancerBuilder {
  pool: Arc<WeightedPool>,
  next: Arc<dyn Handler>,
  sticky: Option<StickySession>,
  token_parser: Option<Arc<dyn TokenParser>>,
  error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl BalancerBuilder {
  /// Enable cookie session affinity.
  pub fn sticky_session(mut self, sticky: StickySession) -> Self {
    self.sticky = Some(sticky);
    self
  }

  /// Enable signed-token group affinity.
  pub fn token_parser(mut self, parser: Arc<dyn TokenParser>) -> Self {
    self.token_parser = Some(parser);
    self
  }

  pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
    self.error_handler = Some(handler);
    self
  }

  pub fn build(self) -> BalancerHandler {
    BalancerHandler {
      inner: Arc::new(HandlerInner {
        pool: self.pool,
        next: self.next,
        sticky: self.sticky,
        token_parser: self.token_parser,
        error_handler: self
          .error_handler
          .unwrap_or_else(|| Arc::new(DefaultErrorHandler)),
      }),
    }
  }
}

impl BalancerHandler {
  pub fn builder(pool: Arc<WeightedPool>, next: Arc<dyn Handler>) -> BalancerBuilder {
    BalancerBuilder {
      pool,
      next,
      sticky: None,
      token_parser: None,
      error_handler: None,
    }
  }

  pub fn pool(&self) -> &Arc<WeightedPool> {
    &self.inner.pool
  }

  pub async fn serve(&self, req: Request<Body>) -> Response<Body> {
    let this = &self.inner;

    // observations land here when a context travels with the request;
    // without one they are discarded
    let uc = req.extensions().get::<UpstreamContext>().cloned();

    let mut stuck: Option<Arc<Backend>> = None;

    if let Some(sticky) = &this.sticky {
      match sticky.resolve(req.headers(), &this.pool.servers()) {
        Ok(Some(backend)) => stuck = Some(backend),
        Ok(None) => {}
        Err(err) => {
          if let Some(uc) = &uc {
            uc.set("error", err.to_string());
          }
          return this.error_handler.render(&err);
        }
      }
    }

    // group affinity is only consulted when the cookie did not stick
    if stuck.is_none() {
      if let Some(parser) = &this.token_parser {
        match parser.from_headers(req.headers()) {
          Ok(Some(token)) => {
            let group_id = token.retrieve().group_id;

            if let Some(backend) = this.pool.group(group_id) {
              let verified = backend
                .routing()
                .map_or(false, |routing| routing.hmac_keys.iter().any(|key| token.verify(key)));
              if verified {
                stuck = Some(backend);
              }
            }

            if stuck.is_none() {
              if let Some(uc) = &uc {
                uc.set("jsid-error", "No corresponding jumpy announce");
              }
            }
          }

          Ok(None) => {}

          Err(err) => {
            if let Some(uc) = &uc {
              uc.set("jsid-error", err.to_string());
            }
          }
        }
      }
    }

    let mut annotate_cookie = false;
    let backend = match stuck {
      Some(backend) => backend,
      None => match this.pool.next() {
        Ok(backend) => {
          annotate_cookie = true;
          backend
        }
        Err(err) => {
          log::debug!("no serviceable backend: {err}");
          return service_unavailable();
        }
      },
    };

    let req = match rewrite_request(req, &backend) {
      Ok(req) => req,
      Err(err) => {
        log::error!("invalid rewritten url for {}: {err}", backend.url());
        return this.error_handler.render(&err);
      }
    };

    let mut response = this.next.serve(req).await;

    if annotate_cookie {
      if let Some(sticky) = &this.sticky {
        sticky.stick(&backend, response.headers_mut());
      }
    }

    if let Some(uc) = &uc {
      uc.set("upstream", backend.url().as_str());
      uc.set_status(response.status().as_u16());
    }

    response
  }
}

impl Handler for BalancerHandler {
  fn serve(&self, req: Request<Body>) -> BoxFuture<'static, Response<Body>> {
    let me = self.clone();
    Box::pin(async move { BalancerHandler::serve(&me, req).await })
  }
}

impl Service<Request<Incoming>> for BalancerHandler {
  type Response = Response<Body>;
  type Error = Infallible;
  type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

  // the future is deliberately not spawned: dropping it on client
  // disconnect cancels the round trip
  fn call(&self, req: Request<Incoming>) -> Self::Future {
    let me = self.clone();
    Box::pin(async move { Ok(me.serve(map_request_body(req, Body::incoming)).await) })
  }
}

fn service_unavailable() -> Response<Body> {
  let mut res = Response::new(Body::full("503 Service Unavailable.\n"));
  *res.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
  res.headers_mut().insert(CONTENT_TYPE, TEXT_PLAIN);
  res
}

/// Adopt the backend's scheme and authority, keep the incoming path and
/// query. With path rewriting on, the new path is the lexical join of the
/// backend's path and the incoming one.
fn rewrite_request(req: Request<Body>, backend: &Backend) -> Result<Request<Body>, http::Error> {
  let (mut parts, body) = req.into_parts();
  let target = backend.url();

  let path = if backend.path_rewrite() {
    join_paths(target.path(), parts.uri.path())
  } else {
    parts.uri.path().to_string()
  };

  let path_and_query = match parts.uri.query() {
    Some(query) => format!("{path}?{query}"),
    None => path,
  };

  let host = target.host_str().unwrap_or_default();
  let authority = match target.port() {
    Some(port) => format!("{host}:{port}"),
    None => host.to_string(),
  };

  let mut uri = http::uri::Parts::default();
  uri.scheme = Some(Scheme::try_from(target.scheme())?);
  uri.authority = Some(Authority::try_from(authority.as_str())?);
  uri.path_and_query = Some(PathAndQuery::try_from(path_and_query.as_str())?);
  parts.uri = Uri::from_parts(uri)?;

  Ok(Request::from_parts(parts, body))
}

/// Filesystem-style lexical join: `.` and `..` resolve, double slashes
/// collapse, and a trailing slash on the incoming path survives.
fn join_paths(base: &str, path: &str) -> String {
  let joined = format!("{base}/{path}");
  let mut clean = clean_path(&joined);

  if path.ends_with('/') && !clean.ends_with('/') {
    clean.push('/');
  }

  clean
}

fn clean_path(path: &str) -> String {
  let rooted = path.starts_with('/');
  let mut segments: Vec<&str> = Vec::new();

  for segment in path.split('/') {
    match segment {
      "" | "." => {}
      ".." => {
        if segments.last().map_or(false, |s| *s != "..") {
          segments.pop();
        } else if !rooted {
          segments.push("..");
        }
      }
      segment => segments.push(segment),
    }
  }

  if rooted {
    format!("/{}", segments.join("/"))
  } else if segments.is_empty() {
    ".".to_string()
  } else {
    segments.join("/")
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::proxy::balance::{BackendOptions, Routing};
  use crate::proxy::error::BoxError;
  use crate::proxy::sticky::{SignedToken, TokenClaims};
  use hyper::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
  use parking_lot::Mutex;
  use url::Url;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  struct RecordingNext {
    seen: Arc<Mutex<Vec<Uri>>>,
  }

  impl Handler for RecordingNext {
    fn serve(&self, req: Request<Body>) -> BoxFuture<'static, Response<Body>> {
      self.seen.lock().push(req.uri().clone());
      Box::pin(async move { Response::new(Body::empty()) })
    }
  }

  fn handler(pool: Arc<WeightedPool>) -> (BalancerHandler, Arc<Mutex<Vec<Uri>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let next = Arc::new(RecordingNext { seen: seen.clone() });
    let handler = BalancerHandler::builder(pool, next).build();
    (handler, seen)
  }

  fn sticky_handler(pool: Arc<WeightedPool>) -> (BalancerHandler, Arc<Mutex<Vec<Uri>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let next = Arc::new(RecordingNext { seen: seen.clone() });
    let handler = BalancerHandler::builder(pool, next)
      .sticky_session(StickySession::new("sess"))
      .build();
    (handler, seen)
  }

  fn request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
  }

  fn request_with_cookie(uri: &str, cookie: &'static str) -> Request<Body> {
    let mut req = request(uri);
    req
      .headers_mut()
      .insert(COOKIE, HeaderValue::from_static(cookie));
    req
  }

  #[tokio::test]
  async fn delegates_to_selected_backend() {
    let pool = Arc::new(WeightedPool::new());
    pool.upsert(url("http://a:7001/"), BackendOptions::new());
    pool.upsert(url("http://b:7002/"), BackendOptions::new());

    let (handler, seen) = handler(pool);

    handler.serve(request("http://front/x")).await;
    handler.serve(request("http://front/x")).await;

    let seen = seen.lock();
    let hosts: Vec<_> = seen.iter().map(|u| u.authority().unwrap().as_str()).collect();
    assert!(hosts.contains(&"a:7001"));
    assert!(hosts.contains(&"b:7002"));
  }

  #[tokio::test]
  async fn empty_pool_responds_503() {
    let (handler, _) = handler(Arc::new(WeightedPool::new()));

    let response = handler.serve(request("http://front/")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    use http_body_util::BodyExt;
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"503 Service Unavailable.\n");
  }

  #[tokio::test]
  async fn rewrites_keep_path_and_query() {
    let pool = Arc::new(WeightedPool::new());
    pool.upsert(url("http://backend:9000/ignored"), BackendOptions::new());

    let (handler, seen) = handler(pool);
    handler.serve(request("http://front/v1/items?page=2")).await;

    let seen = seen.lock();
    assert_eq!(seen[0].to_string(), "http://backend:9000/v1/items?page=2");
  }

  #[tokio::test]
  async fn path_rewrite_joins_backend_path() {
    let pool = Arc::new(WeightedPool::new());
    pool.upsert(
      url("http://backend/api"),
      BackendOptions::new().path_rewrite(true),
    );

    let (handler, seen) = handler(pool);
    handler.serve(request("http://front/v1/items/")).await;

    let seen = seen.lock();
    assert_eq!(seen[0].to_string(), "http://backend/api/v1/items/");
  }

  #[tokio::test]
  async fn sticky_cookie_wins_over_rotation() {
    let pool = Arc::new(WeightedPool::new());
    pool.upsert(url("http://a/"), BackendOptions::new());
    pool.upsert(url("http://b/"), BackendOptions::new());

    let (handler, seen) = sticky_handler(pool);

    for _ in 0..4 {
      let response = handler
        .serve(request_with_cookie("http://front/", "sess=http://b/"))
        .await;
      // an already-stuck request gets no fresh cookie
      assert!(response.headers().get(SET_COOKIE).is_none());
    }

    let seen = seen.lock();
    assert!(seen.iter().all(|u| u.authority().unwrap().as_str() == "b"));
  }

  #[tokio::test]
  async fn stale_cookie_falls_back_and_reannotates() {
    let pool = Arc::new(WeightedPool::new());
    pool.upsert(url("http://a/"), BackendOptions::new());

    let (handler, seen) = sticky_handler(pool);

    let response = handler
      .serve(request_with_cookie("http://front/", "sess=http://gone/"))
      .await;

    assert_eq!(
      response.headers().get(SET_COOKIE).unwrap(),
      "sess=http://a/"
    );
    assert_eq!(seen.lock()[0].authority().unwrap().as_str(), "a");
  }

  #[tokio::test]
  async fn malformed_cookie_renders_error_and_observes() {
    let pool = Arc::new(WeightedPool::new());
    pool.upsert(url("http://a/"), BackendOptions::new());

    let (handler, seen) = sticky_handler(pool);

    let uc = UpstreamContext::new();
    let mut req = request_with_cookie("http://front/", "sess=not-a-url");
    req.extensions_mut().insert(uc.clone());

    let response = handler.serve(req).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(uc.get("error").unwrap().contains("invalid sticky cookie url"));
    assert!(seen.lock().is_empty());
  }

  struct FakeToken {
    group_id: u32,
    key: &'static [u8],
  }

  impl SignedToken for FakeToken {
    fn retrieve(&self) -> TokenClaims {
      TokenClaims {
        group_id: self.group_id,
      }
    }

    fn verify(&self, key: &[u8]) -> bool {
      key == self.key
    }
  }

  struct FakeParser {
    token: Option<(u32, &'static [u8])>,
    fail: bool,
  }

  impl TokenParser for FakeParser {
    fn from_headers(&self, _: &HeaderMap) -> Result<Option<Box<dyn SignedToken>>, BoxError> {
      if self.fail {
        return Err("bad token header".into());
      }
      Ok(
        self
          .token
          .map(|(group_id, key)| Box::new(FakeToken { group_id, key }) as Box<dyn SignedToken>),
      )
    }
  }

  fn group_pool() -> Arc<WeightedPool> {
    let pool = Arc::new(WeightedPool::new());
    pool.upsert(url("http://a/"), BackendOptions::new());
    pool.upsert(
      url("http://grouped/"),
      BackendOptions::new().routing(Routing {
        status: "OK".into(),
        group_id: 7,
        hmac_keys: vec![b"bad".to_vec(), b"good".to_vec()],
        sticky_routing_only: true,
      }),
    );
    pool
  }

  #[tokio::test]
  async fn verified_token_sticks_to_group_backend() {
    let pool = group_pool();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let next = Arc::new(RecordingNext { seen: seen.clone() });
    let handler = BalancerHandler::builder(pool, next)
      .token_parser(Arc::new(FakeParser {
        token: Some((7, b"good")),
        fail: false,
      }))
      .build();

    let uc = UpstreamContext::new();
    let mut req = request("http://front/");
    req.extensions_mut().insert(uc.clone());
    handler.serve(req).await;

    assert_eq!(seen.lock()[0].authority().unwrap().as_str(), "grouped");
    assert_eq!(uc.get("jsid-error"), None);
    assert_eq!(uc.get("upstream").as_deref(), Some("http://grouped/"));
  }

  #[tokio::test]
  async fn unverified_token_falls_back_and_observes() {
    let pool = group_pool();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let next = Arc::new(RecordingNext { seen: seen.clone() });
    let handler = BalancerHandler::builder(pool, next)
      .token_parser(Arc::new(FakeParser {
        token: Some((7, b"unknown")),
        fail: false,
      }))
      .build();

    let uc = UpstreamContext::new();
    let mut req = request("http://front/");
    req.extensions_mut().insert(uc.clone());
    handler.serve(req).await;

    // group-only backend is skipped, the rotation serves instead
    assert_eq!(seen.lock()[0].authority().unwrap().as_str(), "a");
    assert_eq!(
      uc.get("jsid-error").as_deref(),
      Some("No corresponding jumpy announce")
    );
  }

  #[tokio::test]
  async fn token_parse_failure_is_observational_only() {
    let pool = group_pool();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let next = Arc::new(RecordingNext { seen: seen.clone() });
    let handler = BalancerHandler::builder(pool, next)
      .token_parser(Arc::new(FakeParser {
        token: None,
        fail: true,
      }))
      .build();

    let uc = UpstreamContext::new();
    let mut req = request("http://front/");
    req.extensions_mut().insert(uc.clone());
    let response = handler.serve(req).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(uc.get("jsid-error").as_deref(), Some("bad token header"));
  }

  #[tokio::test]
  async fn absent_token_writes_no_observation() {
    let pool = group_pool();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let next = Arc::new(RecordingNext { seen });
    let handler = BalancerHandler::builder(pool, next)
      .token_parser(Arc::new(FakeParser {
        token: None,
        fail: false,
      }))
      .build();

    let uc = UpstreamContext::new();
    let mut req = request("http://front/");
    req.extensions_mut().insert(uc.clone());
    handler.serve(req).await;

    assert_eq!(uc.get("jsid-error"), None);
  }

  #[test]
  fn join_path_semantics() {
    let cases = [
      ("/api", "/v1/items", "/api/v1/items"),
      ("/api/", "/v1/items/", "/api/v1/items/"),
      ("/api", "//v1//items", "/api/v1/items"),
      ("/api", "/v1/./items", "/api/v1/items"),
      ("/api", "/v1/../items", "/api/items"),
      ("/", "/items", "/items"),
      ("/api", "/", "/api/"),
      ("/api", "/../../items", "/items"),
    ];

    for (base, path, expected) in cases {
      assert_eq!(join_paths(base, path), expected, "join({base}, {path})");
    }
  }

  #[test]
  fn clean_path_semantics() {
    let cases = [
      ("/a/b/../c", "/a/c"),
      ("/a//b", "/a/b"),
      ("/..", "/"),
      ("/./", "/"),
      ("a/../../b", "../b"),
      ("", "."),
    ];

    for (path, expected) in cases {
      assert_eq!(clean_path(path), expected, "clean({path})");
    }
  }
}
