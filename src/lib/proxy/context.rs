use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-request observation scratchpad. The balancer writes `upstream`,
/// `error` and `jsid-error` keys into it for the caller to log; the status
/// slot records the relayed status. Carried in the request extensions (the
/// type itself is the lookup key) and must not outlive its request.
#[derive(Debug, Clone, Default)]
pub struct UpstreamContext {
  inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
  status: u16,
  values: HashMap<String, String>,
}

impl UpstreamContext {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &str) -> Option<String> {
    self.inner.lock().values.get(key).cloned()
  }

  pub fn set(&self, key: &str, value: impl Into<String>) {
    self.inner.lock().values.insert(key.to_string(), value.into());
  }

  pub fn status(&self) -> u16 {
    self.inner.lock().status
  }

  pub fn set_status(&self, status: u16) {
    self.inner.lock().status = status;
  }
}
