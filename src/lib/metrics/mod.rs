pub mod sample;
pub mod sink;

pub use sink::MetricsSink;

use parking_lot::{Mutex, RwLock};
use sample::{ExpDecaySample, RESERVOIR_ALPHA, RESERVOIR_SIZE};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An ordered tag set; ordering makes `(name, tags)` a deterministic
/// registry key.
pub type Tags = BTreeMap<String, String>;

/// `base` extended with `extra`, leaving `base` untouched.
pub fn with_tags(base: &Tags, extra: &[(&str, &str)]) -> Tags {
  let mut tags = base.clone();
  for (k, v) in extra {
    tags.insert((*k).to_string(), (*v).to_string());
  }
  tags
}

/// A monotonically adjustable counter. Gauge-style usage (inc on open, dec
/// on close) is counters moving both ways, as the registry sees it.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicI64>);

impl Counter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn inc(&self, n: i64) {
    self.0.fetch_add(n, Ordering::Relaxed);
  }

  pub fn dec(&self, n: i64) {
    self.0.fetch_sub(n, Ordering::Relaxed);
  }

  pub fn count(&self) -> i64 {
    self.0.load(Ordering::Relaxed)
  }
}

/// A histogram over an exponentially-decaying reservoir of capacity 512
/// with alpha 0.15. The windowed variant additionally discards its
/// reservoir every `interval`.
#[derive(Clone)]
pub struct Histogram {
  inner: Arc<Mutex<HistogramInner>>,
}

struct HistogramInner {
  sample: ExpDecaySample,
  window: Option<Window>,
}

struct Window {
  interval: Duration,
  started: Instant,
}

impl Histogram {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(HistogramInner {
        sample: ExpDecaySample::new(RESERVOIR_SIZE, RESERVOIR_ALPHA),
        window: None,
      })),
    }
  }

  pub fn windowed(interval: Duration) -> Self {
    Self {
      inner: Arc::new(Mutex::new(HistogramInner {
        sample: ExpDecaySample::new(RESERVOIR_SIZE, RESERVOIR_ALPHA),
        window: Some(Window {
          interval,
          started: Instant::now(),
        }),
      })),
    }
  }

  pub fn update(&self, value: i64) {
    let mut inner = self.inner.lock();
    if let Some(window) = &mut inner.window {
      if window.started.elapsed() >= window.interval {
        window.started = Instant::now();
        inner.sample.clear();
      }
    }
    inner.sample.update(value);
  }

  pub fn count(&self) -> u64 {
    self.inner.lock().sample.count()
  }

  pub fn mean(&self) -> f64 {
    let values = self.inner.lock().sample.snapshot();
    if values.is_empty() {
      return 0.0;
    }
    values.iter().sum::<i64>() as f64 / values.len() as f64
  }

  pub fn max(&self) -> i64 {
    self
      .inner
      .lock()
      .sample
      .snapshot()
      .into_iter()
      .max()
      .unwrap_or(0)
  }

  pub fn percentile(&self, p: f64) -> i64 {
    let mut values = self.inner.lock().sample.snapshot();
    if values.is_empty() {
      return 0;
    }
    values.sort_unstable();
    let rank = ((p * values.len() as f64).ceil() as usize).clamp(1, values.len());
    values[rank - 1]
  }
}

impl Default for Histogram {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for Histogram {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Histogram")
      .field("count", &self.count())
      .finish()
  }
}

/// The value shapes a registry hands out.
#[derive(Debug, Clone)]
pub enum Metric {
  Counter(Counter),
  Histogram(Histogram),
}

impl Metric {
  /// A registry answering with the wrong shape for a name is a fatal
  /// configuration error.
  pub fn counter(self, name: &str, tags: &Tags) -> Counter {
    match self {
      Metric::Counter(c) => c,
      Metric::Histogram(_) => panic!("invalid type registered for: {name} {tags:?}"),
    }
  }

  pub fn histogram(self, name: &str, tags: &Tags) -> Histogram {
    match self {
      Metric::Histogram(h) => h,
      Metric::Counter(_) => panic!("invalid type registered for: {name} {tags:?}"),
    }
  }
}

/// The registry contract the sink consumes: the first caller's zero value
/// is registered under `(name, tags)`, every later caller gets the
/// registered instance back.
pub trait MetricsRegistry: Send + Sync {
  fn get_or_register(&self, name: &str, tags: &Tags, zero: Metric) -> Metric;
}

/// In-memory registry, the default and the one the tests observe.
#[derive(Clone, Default)]
pub struct TaggedRegistry {
  inner: Arc<RwLock<HashMap<(String, Tags), Metric>>>,
}

impl TaggedRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, name: &str, tags: &Tags) -> Option<Metric> {
    self
      .inner
      .read()
      .get(&(name.to_string(), tags.clone()))
      .cloned()
  }
}

impl MetricsRegistry for TaggedRegistry {
  fn get_or_register(&self, name: &str, tags: &Tags, zero: Metric) -> Metric {
    let key = (name.to_string(), tags.clone());

    if let Some(existing) = self.inner.read().get(&key) {
      return existing.clone();
    }

    self.inner.write().entry(key).or_insert(zero).clone()
  }
}
