#![allow(unused)]

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use shunt::body::Body;
use shunt::BalancerHandler;

pub fn client() -> Client<HttpConnector, Body> {
  Client::builder(TokioExecutor::new()).build_http()
}

pub async fn send(
  req: Request<Body>,
) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
  client().request(req).await
}

pub async fn get(
  uri: &str,
) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
  let request = Request::builder()
    .method("GET")
    .uri(uri)
    .body(Body::empty())
    .unwrap();

  client().request(request).await
}

/// Serve a balancer on an ephemeral port, upgrades enabled.
pub async fn serve_handler(handler: BalancerHandler) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  tokio::spawn(async move {
    loop {
      let (stream, _remote) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(_) => break,
      };

      let handler = handler.clone();
      tokio::spawn(async move {
        let _ = hyper::server::conn::http1::Builder::new()
          .serve_connection(TokioIo::new(stream), handler)
          .with_upgrades()
          .await;
      });
    }
  });

  addr
}

/// Serve a plain backend built from a request → response closure.
pub async fn spawn_backend<F>(f: F) -> SocketAddr
where
  F: Fn(Request<Incoming>) -> Response<Body> + Send + Sync + Clone + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  tokio::spawn(async move {
    loop {
      let (stream, _remote) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(_) => break,
      };

      let f = f.clone();
      tokio::spawn(async move {
        let service = service_fn(move |req| {
          let response = f(req);
          async move { Ok::<_, Infallible>(response) }
        });

        let _ = hyper::server::conn::http1::Builder::new()
          .serve_connection(TokioIo::new(stream), service)
          .await;
      });
    }
  });

  addr
}

/// A raw TCP backend that answers any websocket handshake with a 101 and
/// then echoes every byte back.
pub async fn spawn_ws_echo_backend() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  tokio::spawn(async move {
    loop {
      let (mut stream, _remote) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(_) => break,
      };

      tokio::spawn(async move {
        // swallow the handshake head
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
          match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return,
            Ok(_) => head.push(byte[0]),
          }
        }

        if stream
          .write_all(
            b"HTTP/1.1 101 Switching Protocols\r\n\
              connection: Upgrade\r\n\
              upgrade: websocket\r\n\
              \r\n",
          )
          .await
          .is_err()
        {
          return;
        }

        let mut buf = [0u8; 4096];
        loop {
          match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
              if stream.write_all(&buf[..n]).await.is_err() {
                return;
              }
            }
          }
        }
      });
    }
  });

  addr
}

#[macro_export]
macro_rules! assert_status {
  ($response:expr, $status:ident) => {
    assert_eq!($response.status(), hyper::StatusCode::$status);
  };

  ($response:expr, $status:literal) => {
    assert_eq!($response.status().as_u16(), $status);
  };
}

#[macro_export]
macro_rules! assert_header {
  ($response:expr, $header:expr, $value:expr) => {
    assert_eq!($response.headers().get($header).unwrap(), $value);
  };
}

#[macro_export]
macro_rules! assert_body {
  ($response:expr, $value:expr) => {
    let bytes = $response.into_body().collect().await.unwrap().to_bytes();
    let content = String::from_utf8_lossy(&bytes);
    assert_eq!(content, $value);
  };
}
