mod common;

use hyper::header::HeaderValue;
use hyper::Response;
use std::sync::Arc;
use url::Url;

use common::{get, serve_handler, spawn_backend};
use shunt::body::Body;
use shunt::{BackendOptions, BalancerHandler, Forwarder, WeightedPool};

fn upstream_response(name: &'static str) -> Response<Body> {
  let mut response = Response::new(Body::full(name));
  response
    .headers_mut()
    .insert("x-upstream", HeaderValue::from_static(name));
  response
}

#[tokio::test]
async fn round_robin_weighted_smoke() {
  let a = spawn_backend(|_req| upstream_response("a")).await;
  let b = spawn_backend(|_req| upstream_response("b")).await;

  let pool = Arc::new(WeightedPool::new());
  pool.upsert(
    Url::parse(&format!("http://{a}/")).unwrap(),
    BackendOptions::new().weight(1),
  );
  pool.upsert(
    Url::parse(&format!("http://{b}/")).unwrap(),
    BackendOptions::new().weight(2),
  );

  let handler =
    BalancerHandler::builder(pool, Arc::new(Forwarder::builder().build())).build();
  let addr = serve_handler(handler).await;

  let mut selected = Vec::new();
  for _ in 0..6 {
    let res = get(&format!("http://{addr}/")).await.unwrap();
    assert_status!(res, OK);
    selected.push(
      res
        .headers()
        .get("x-upstream")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string(),
    );
  }

  let a_count = selected.iter().filter(|s| *s == "a").count();
  assert_eq!(a_count, 2, "selections: {selected:?}");
  assert_eq!(selected.len() - a_count, 4, "selections: {selected:?}");

  // the interleave never serves the lighter backend twice in a row
  for pair in selected.windows(2) {
    assert!(
      !(pair[0] == "a" && pair[1] == "a"),
      "a served twice in a row: {selected:?}"
    );
  }
}

#[tokio::test]
async fn hot_upsert_shifts_traffic() {
  let a = spawn_backend(|_req| upstream_response("a")).await;
  let b = spawn_backend(|_req| upstream_response("b")).await;

  let pool = Arc::new(WeightedPool::new());
  let a_url = Url::parse(&format!("http://{a}/")).unwrap();
  pool.upsert(a_url.clone(), BackendOptions::new());

  let handler = BalancerHandler::builder(pool.clone(), Arc::new(Forwarder::builder().build()))
    .build();
  let addr = serve_handler(handler).await;

  for _ in 0..3 {
    let res = get(&format!("http://{addr}/")).await.unwrap();
    assert_header!(res, "x-upstream", "a");
  }

  // drain a, bring up b, all live under traffic
  pool.upsert(Url::parse(&format!("http://{b}/")).unwrap(), BackendOptions::new());
  pool.upsert(a_url.clone(), BackendOptions::new().weight(0));

  for _ in 0..3 {
    let res = get(&format!("http://{addr}/")).await.unwrap();
    assert_header!(res, "x-upstream", "b");
  }

  pool.remove(&a_url).unwrap();
  let res = get(&format!("http://{addr}/")).await.unwrap();
  assert_header!(res, "x-upstream", "b");
}
