use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{with_tags, Counter, Histogram, Metric, MetricsRegistry, Tags};

const RESPONSE_TIME_WINDOW: Duration = Duration::from_secs(60);

/// Per-connection-class traffic metrics, registered lazily on first use of
/// each class. Counters are atomic and updated without locking once
/// registered.
#[derive(Clone)]
pub struct MetricsSink {
  inner: Arc<SinkInner>,
}

struct SinkInner {
  registry: Arc<dyn MetricsRegistry>,
  tags: Tags,
  http: OnceCell<HttpMetrics>,
  websocket: OnceCell<WebsocketMetrics>,
  http_return_codes: Mutex<HashMap<u16, Counter>>,
}

pub struct HttpMetrics {
  pub read: Counter,
  pub written: Counter,
  pub connection_count: Counter,
  pub connection_open: Counter,
  pub response_time: Histogram,
  pub response_time_window: Histogram,
}

pub struct WebsocketMetrics {
  pub read: Counter,
  pub written: Counter,
  pub connection_count: Counter,
  pub connection_open: Counter,
  pub session_time: Histogram,
}

impl MetricsSink {
  pub fn new(registry: Arc<dyn MetricsRegistry>, tags: Tags) -> Self {
    Self {
      inner: Arc::new(SinkInner {
        registry,
        tags,
        http: OnceCell::new(),
        websocket: OnceCell::new(),
        http_return_codes: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// The http bundle, registered on first call.
  pub fn http(&self) -> &HttpMetrics {
    self.inner.http.get_or_init(|| {
      let tags = with_tags(&self.inner.tags, &[("conn_type", "http")]);

      HttpMetrics {
        read: self.counter("bytes", with_tags(&tags, &[("direction", "in")])),
        written: self.counter("bytes", with_tags(&tags, &[("direction", "out")])),
        connection_count: self.counter("connection.count", tags.clone()),
        connection_open: self.counter("connection.open", tags.clone()),
        response_time: self.histogram("response.time.ns", tags.clone(), Histogram::new()),
        response_time_window: self.histogram(
          "response.time.window.ns",
          tags,
          Histogram::windowed(RESPONSE_TIME_WINDOW),
        ),
      }
    })
  }

  /// The websocket bundle, registered on first call.
  pub fn websocket(&self) -> &WebsocketMetrics {
    self.inner.websocket.get_or_init(|| {
      let tags = with_tags(&self.inner.tags, &[("conn_type", "websocket")]);

      WebsocketMetrics {
        read: self.counter("bytes", with_tags(&tags, &[("direction", "in")])),
        written: self.counter("bytes", with_tags(&tags, &[("direction", "out")])),
        connection_count: self.counter("connection.count", tags.clone()),
        connection_open: self.counter("connection.open", tags.clone()),
        session_time: self.histogram("session.time.ns", tags, Histogram::new()),
      }
    })
  }

  /// Count a relayed response under its status class. Statuses outside the
  /// 1xx..5xx classes are dropped.
  pub fn inc_http_return_code(&self, status: u16) {
    let class = status / 100;
    if !(1..=5).contains(&class) {
      return;
    }

    let mut codes = self.inner.http_return_codes.lock();
    let counter = codes.entry(class).or_insert_with(|| {
      let httpcode = format!("{class}xx");
      let tags = with_tags(
        &self.inner.tags,
        &[("conn_type", "http"), ("httpcode", &httpcode)],
      );
      self.counter("response.count", tags)
    });
    counter.inc(1);
  }

  fn counter(&self, name: &str, tags: Tags) -> Counter {
    self
      .inner
      .registry
      .get_or_register(name, &tags, Metric::Counter(Counter::new()))
      .counter(name, &tags)
  }

  fn histogram(&self, name: &str, tags: Tags, zero: Histogram) -> Histogram {
    self
      .inner
      .registry
      .get_or_register(name, &tags, Metric::Histogram(zero))
      .histogram(name, &tags)
  }
}

impl std::fmt::Debug for MetricsSink {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MetricsSink")
      .field("tags", &self.inner.tags)
      .finish()
  }
}
