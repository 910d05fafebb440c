use futures::StreamExt;
use http::{StatusCode, Version};
use http_body::Frame;
use httparse::Status as ParseStatus;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use super::error::ForwardError;
use super::forward::{Conn, Forwarder};
use super::header::{remove_hop_headers, CONNECTION_UPGRADE};
use crate::body::Body;
use crate::buffer::BufferPool;
use crate::io::PreBufReader;
use crate::metrics::Counter;

// each pump renews its read deadline every iteration; expiry is not an error
const READ_DEADLINE: Duration = Duration::from_secs(15);
// an EOF landing this close to the start of a copy cycle is a clean close
const FAST_FAIL_WINDOW: Duration = Duration::from_secs(1);

const MAX_RESPONSE_HEAD: usize = 16 * 1024;

impl Forwarder {
  /// Relay a websocket handshake: dial the target, replay the handshake,
  /// hand the backend's answer to the client and, on a 101, pump raw bytes
  /// both ways over the hijacked connection until either side closes.
  pub(crate) async fn serve_websocket(&self, mut req: Request<Body>) -> Response<Body> {
    let this = &self.inner;

    if let Some(sink) = &this.metrics {
      sink.websocket().connection_count.inc(1);
    }

    *req.version_mut() = Version::HTTP_11;
    if let Some(rewriter) = &this.websocket_rewriter {
      rewriter.rewrite(&mut req);
    }

    let addr = match dial_target(req.uri()) {
      Ok(addr) => addr,
      Err(err) => {
        log::error!("{err}");
        return this.error_handler.render(&err);
      }
    };

    let mut target = match this.dialer.dial(addr.clone()).await {
      Ok(conn) => conn,
      Err(source) => {
        let err = ForwardError::Dial { addr, source };
        log::error!("{err}");
        return this.error_handler.render(&err);
      }
    };

    // the hijack surface: without the upgrade extension there is no raw
    // client connection to pump, and the dialed connection goes back down
    let on_upgrade = match req.extensions_mut().remove::<OnUpgrade>() {
      Some(on_upgrade) => on_upgrade,
      None => {
        let err = ForwardError::NotHijackable;
        log::error!("{err}");
        drop(target);
        return this.error_handler.render(&err);
      }
    };

    if !req.headers().contains_key(HOST) {
      if let Some(authority) = req.uri().authority() {
        if let Ok(host) = HeaderValue::try_from(authority.as_str()) {
          req.headers_mut().insert(HOST, host);
        }
      }
    }

    let head = serialize_request_head(&req);
    if let Err(e) = target.write_all(&head).await {
      let err = ForwardError::HandshakeWrite(e);
      log::error!("{err}");
      return this.error_handler.render(&err);
    }

    let (status, headers, leftover) =
      match read_response_head(&mut target, &this.buffer_pool).await {
        Ok(parsed) => parsed,
        Err(err) => {
          log::error!("{err}");
          return this.error_handler.render(&err);
        }
      };

    let upgrade_value = headers.get(UPGRADE).cloned();
    let mut response_headers = headers;
    remove_hop_headers(&mut response_headers);

    if status != StatusCode::SWITCHING_PROTOCOLS {
      // upgrade refused: relay the backend's answer as a plain response,
      // streaming whatever the connection still carries
      log::debug!("websocket upgrade refused by upstream: {status}");
      let reader = PreBufReader::new(target, leftover);
      let stream =
        ReaderStream::new(reader).map(|item| item.map(Frame::data).map_err(ForwardError::Relay));

      let mut response = Response::new(Body::stream(stream));
      *response.status_mut() = status;
      *response.headers_mut() = response_headers;
      return response;
    }

    response_headers.insert(CONNECTION, CONNECTION_UPGRADE);
    if let Some(upgrade) = upgrade_value {
      response_headers.insert(UPGRADE, upgrade);
    }

    let metrics = this.metrics.clone();
    let pool = this.buffer_pool.clone();

    tokio::spawn(async move {
      let client = match on_upgrade.await {
        Ok(upgraded) => TokioIo::new(upgraded),
        Err(e) => {
          log::error!("unable to hijack the connection: {e}");
          return;
        }
      };

      let start = Instant::now();

      let (read_counter, written_counter, open_gauge, session_time) = match &metrics {
        Some(sink) => {
          let ws = sink.websocket();
          (
            ws.read.clone(),
            ws.written.clone(),
            Some(ws.connection_open.clone()),
            Some(ws.session_time.clone()),
          )
        }
        None => (Counter::new(), Counter::new(), None, None),
      };

      let target = PreBufReader::new(target, leftover);
      let (target_read, target_write) = tokio::io::split(target);
      let (client_read, client_write) = tokio::io::split(client);

      let closing = Arc::new(AtomicBool::new(false));

      if let Some(gauge) = &open_gauge {
        gauge.inc(1);
      }

      let inbound = tokio::spawn(replicate(
        client_read,
        target_write,
        read_counter,
        closing.clone(),
        "client -> upstream",
        pool.clone(),
      ));
      let outbound = tokio::spawn(replicate(
        target_read,
        client_write,
        written_counter,
        closing,
        "upstream -> client",
        pool,
      ));

      // waiter: the open gauge recovers once both pumps are done
      let _ = tokio::join!(inbound, outbound);

      if let Some(gauge) = &open_gauge {
        gauge.dec(1);
      }
      if let Some(session_time) = &session_time {
        session_time.update(start.elapsed().as_nanos() as i64);
      }
      log::info!("closed both sides of websocket session");
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = response_headers;
    response
  }
}

/// One pump direction. Bytes copy from `src` to `dst` through a pooled
/// buffer under a renewing read deadline. EOF ends the pump; the shared
/// `closing` flag classifies errors after the peer already started closing
/// as expected. On exit the destination shuts down, which unblocks the
/// peer pump.
async fn replicate<R, W>(
  mut src: R,
  mut dst: W,
  copied: Counter,
  closing: Arc<AtomicBool>,
  id: &'static str,
  pool: BufferPool,
) where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = pool.get();

  loop {
    let fast_fail = Instant::now() + FAST_FAIL_WINDOW;

    match tokio::time::timeout(READ_DEADLINE, src.read(&mut buf[..])).await {
      // deadline expiry renews the deadline
      Err(_elapsed) => continue,

      Ok(Ok(0)) => {
        if closing.load(Ordering::SeqCst) || Instant::now() < fast_fail {
          log::debug!("closing websocket {id}: clean close");
        } else {
          log::info!("closing websocket {id}: EOF");
        }
        break;
      }

      Ok(Ok(n)) => {
        copied.inc(n as i64);
        if let Err(e) = dst.write_all(&buf[..n]).await {
          if closing.load(Ordering::SeqCst) {
            log::debug!("closing websocket {id}: {e}");
          } else {
            log::warn!("closing websocket {id}: {e}");
          }
          break;
        }
      }

      Ok(Err(e)) => {
        if closing.load(Ordering::SeqCst) {
          log::debug!("closing websocket {id}: {e}");
        } else {
          log::warn!("closing websocket {id}: {e}");
        }
        break;
      }
    }
  }

  closing.store(true, Ordering::SeqCst);
  let _ = dst.shutdown().await;
}

/// `host:port` to dial: an explicit port wins, otherwise 443 for tls-style
/// schemes and 80 for everything else.
fn dial_target(uri: &Uri) -> Result<String, ForwardError> {
  let host = uri.host().ok_or(ForwardError::MissingTargetHost)?;

  let port = match uri.port_u16() {
    Some(port) => port,
    None => match uri.scheme_str() {
      Some("wss") | Some("https") => 443,
      _ => 80,
    },
  };

  Ok(format!("{host}:{port}"))
}

fn serialize_request_head(req: &Request<Body>) -> Vec<u8> {
  let path = req
    .uri()
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");

  let mut head = Vec::with_capacity(256);
  head.extend_from_slice(req.method().as_str().as_bytes());
  head.push(b' ');
  head.extend_from_slice(path.as_bytes());
  head.extend_from_slice(b" HTTP/1.1\r\n");

  for (name, value) in req.headers() {
    head.extend_from_slice(name.as_str().as_bytes());
    head.extend_from_slice(b": ");
    head.extend_from_slice(value.as_bytes());
    head.extend_from_slice(b"\r\n");
  }

  head.extend_from_slice(b"\r\n");
  head
}

/// Read and parse the backend's handshake response head. Returns the
/// status, the headers and the bytes read past the head, which belong to
/// the pumped stream.
async fn read_response_head(
  conn: &mut Box<dyn Conn>,
  pool: &BufferPool,
) -> Result<(StatusCode, HeaderMap, Vec<u8>), ForwardError> {
  let mut buf = pool.get();
  let mut head: Vec<u8> = Vec::new();

  loop {
    let n = conn
      .read(&mut buf[..])
      .await
      .map_err(ForwardError::HandshakeRead)?;
    if n == 0 {
      return Err(ForwardError::HandshakeRead(
        std::io::ErrorKind::UnexpectedEof.into(),
      ));
    }
    head.extend_from_slice(&buf[..n]);

    let mut parsed_headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut parsed_headers);

    match response
      .parse(&head)
      .map_err(ForwardError::HandshakeParse)?
    {
      ParseStatus::Complete(head_len) => {
        let code = response.code.ok_or(ForwardError::HandshakeResponse)?;
        let status =
          StatusCode::from_u16(code).map_err(|_| ForwardError::HandshakeResponse)?;

        let mut headers = HeaderMap::with_capacity(response.headers.len());
        for h in response.headers.iter() {
          let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| ForwardError::HandshakeResponse)?;
          let value =
            HeaderValue::from_bytes(h.value).map_err(|_| ForwardError::HandshakeResponse)?;
          headers.append(name, value);
        }

        let leftover = head.split_off(head_len);
        return Ok((status, headers, leftover));
      }

      ParseStatus::Partial => {
        if head.len() > MAX_RESPONSE_HEAD {
          return Err(ForwardError::HandshakeHeadTooLarge);
        }
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn dial_targets() {
    let cases = [
      ("ws://example.com/chat", "example.com:80"),
      ("wss://example.com/chat", "example.com:443"),
      ("http://example.com/chat", "example.com:80"),
      ("https://example.com/chat", "example.com:443"),
      ("http://example.com:9000/chat", "example.com:9000"),
      ("wss://example.com:9000/chat", "example.com:9000"),
    ];

    for (uri, expected) in cases {
      let uri: Uri = uri.parse().unwrap();
      assert_eq!(dial_target(&uri).unwrap(), expected, "{uri}");
    }
  }

  #[test]
  fn dial_target_requires_host() {
    let uri: Uri = "/only-a-path".parse().unwrap();
    assert!(matches!(
      dial_target(&uri).unwrap_err(),
      ForwardError::MissingTargetHost
    ));
  }

  #[test]
  fn serializes_request_head() {
    let mut req = Request::builder()
      .method("GET")
      .uri("http://backend:9000/chat?room=1")
      .body(Body::empty())
      .unwrap();
    req
      .headers_mut()
      .insert(HOST, HeaderValue::from_static("backend:9000"));
    req
      .headers_mut()
      .insert(UPGRADE, HeaderValue::from_static("websocket"));

    let head = serialize_request_head(&req);
    let text = String::from_utf8(head).unwrap();

    assert!(text.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
    assert!(text.contains("host: backend:9000\r\n"));
    assert!(text.contains("upgrade: websocket\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
  }

  #[tokio::test]
  async fn reads_response_head_and_leftover() {
    let raw = b"HTTP/1.1 101 Switching Protocols\r\n\
                upgrade: websocket\r\n\
                connection: Upgrade\r\n\
                \r\n\
                first-frame-bytes"
      .to_vec();
    let mut conn: Box<dyn Conn> = Box::new(Cursor::new(raw));

    let (status, headers, leftover) = read_response_head(&mut conn, &BufferPool::new())
      .await
      .unwrap();

    assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(headers.get(UPGRADE).unwrap(), "websocket");
    assert_eq!(leftover, b"first-frame-bytes");
  }

  #[tokio::test]
  async fn truncated_head_is_an_error() {
    let raw = b"HTTP/1.1 101 Switching".to_vec();
    let mut conn: Box<dyn Conn> = Box::new(Cursor::new(raw));

    let err = read_response_head(&mut conn, &BufferPool::new())
      .await
      .unwrap_err();
    assert!(matches!(err, ForwardError::HandshakeRead(_)));
  }

  #[tokio::test]
  async fn replicate_copies_and_closes_destination() {
    let (client, mut client_far) = tokio::io::duplex(1024);
    let (backend, mut backend_far) = tokio::io::duplex(1024);

    let (client_read, _client_write) = tokio::io::split(client);
    let (_backend_read, backend_write) = tokio::io::split(backend);

    let copied = Counter::new();
    let closing = Arc::new(AtomicBool::new(false));

    let pump = tokio::spawn(replicate(
      client_read,
      backend_write,
      copied.clone(),
      closing.clone(),
      "test",
      BufferPool::new(),
    ));

    client_far.write_all(b"ping").await.unwrap();
    client_far.shutdown().await.unwrap();

    let mut out = Vec::new();
    backend_far.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"ping");

    pump.await.unwrap();
    assert_eq!(copied.count(), 4);
    assert!(closing.load(Ordering::SeqCst));
  }
}
