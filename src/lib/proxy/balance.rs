use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

pub const DEFAULT_WEIGHT: u32 = 1;

/// Signed-token routing descriptor attached to a backend. A backend whose
/// routing is sticky-only (and not marked `FULL`) is reachable through
/// group stickiness alone and stays out of the rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
  pub status: String,
  pub group_id: u32,
  pub hmac_keys: Vec<Vec<u8>>,
  pub sticky_routing_only: bool,
}

impl Routing {
  fn group_only(&self) -> bool {
    self.sticky_routing_only && self.status != "FULL"
  }
}

/// A configured upstream server. Immutable once in the pool: an upsert that
/// changes anything replaces the whole record under the pool lock.
#[derive(Debug)]
pub struct Backend {
  url: Url,
  weight: u32,
  path_rewrite: bool,
  routing: Option<Routing>,
}

impl Backend {
  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn weight(&self) -> u32 {
    self.weight
  }

  pub fn path_rewrite(&self) -> bool {
    self.path_rewrite
  }

  pub fn routing(&self) -> Option<&Routing> {
    self.routing.as_ref()
  }

  fn in_rotation(&self) -> bool {
    match &self.routing {
      None => true,
      Some(routing) => !routing.group_only(),
    }
  }
}

/// Options applied on upsert. Fields left unset keep the existing value
/// (or the default, for a new backend).
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
  weight: Option<u32>,
  path_rewrite: Option<bool>,
  routing: Option<Routing>,
}

impl BackendOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn weight(mut self, weight: u32) -> Self {
    self.weight = Some(weight);
    self
  }

  pub fn path_rewrite(mut self, enable: bool) -> Self {
    self.path_rewrite = Some(enable);
    self
  }

  pub fn routing(mut self, routing: Routing) -> Self {
    self.routing = Some(routing);
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
  #[error("no servers in the pool")]
  Empty,

  #[error("all servers have 0 weight")]
  ZeroWeight,

  #[error("server not found")]
  NotFound,
}

/// Mutable backend registry with a weighted-interleaving iterator.
///
/// Selection subtracts the gcd of all weights from a running threshold on
/// every full circle, which interleaves servers proportionally to their
/// weights without materializing the schedule; any mutation resets the two
/// integers of iterator state and the schedule restarts cleanly.
#[derive(Debug)]
pub struct WeightedPool {
  inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
  backends: Vec<Arc<Backend>>,
  rotation: Vec<Arc<Backend>>,
  groups: HashMap<u32, Arc<Backend>>,
  // last returned rotation position, -1 before the first selection
  index: isize,
  current_weight: i64,
}

impl WeightedPool {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(PoolInner {
        backends: Vec::new(),
        rotation: Vec::new(),
        groups: HashMap::new(),
        index: -1,
        current_weight: 0,
      }),
    }
  }

  /// Apply `options` to the backend with this URL, inserting it if absent.
  /// A new backend defaults to weight 1 unless the options say otherwise.
  pub fn upsert(&self, url: Url, options: BackendOptions) {
    let mut inner = self.inner.lock();

    match inner.backends.iter().position(|b| same_url(&b.url, &url)) {
      Some(i) => {
        let existing = &inner.backends[i];
        let updated = Arc::new(Backend {
          url: existing.url.clone(),
          weight: options.weight.unwrap_or(existing.weight),
          path_rewrite: options.path_rewrite.unwrap_or(existing.path_rewrite),
          routing: options.routing.or_else(|| existing.routing.clone()),
        });
        inner.backends[i] = updated;
      }

      None => {
        inner.backends.push(Arc::new(Backend {
          url,
          weight: options.weight.unwrap_or(DEFAULT_WEIGHT),
          path_rewrite: options.path_rewrite.unwrap_or(false),
          routing: options.routing,
        }));
      }
    }

    inner.reset_state();
  }

  /// Remove the backend with this URL, purging its group entry if any.
  pub fn remove(&self, url: &Url) -> Result<(), PoolError> {
    let mut inner = self.inner.lock();

    let i = inner
      .backends
      .iter()
      .position(|b| same_url(&b.url, url))
      .ok_or(PoolError::NotFound)?;

    inner.backends.remove(i);
    inner.reset_state();
    Ok(())
  }

  /// Select the next backend from the rotation.
  pub fn next(&self) -> Result<Arc<Backend>, PoolError> {
    self.inner.lock().next_server()
  }

  /// Snapshot of the rotation.
  pub fn servers(&self) -> Vec<Arc<Backend>> {
    self.inner.lock().rotation.clone()
  }

  /// The weight of the backend with this URL, if present.
  pub fn weight(&self, url: &Url) -> Option<u32> {
    self
      .inner
      .lock()
      .backends
      .iter()
      .find(|b| same_url(&b.url, url))
      .map(|b| b.weight)
  }

  /// Group-map lookup for signed-token stickiness.
  pub fn group(&self, group_id: u32) -> Option<Arc<Backend>> {
    self.inner.lock().groups.get(&group_id).cloned()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().backends.is_empty()
  }

  #[cfg(test)]
  fn iterator_state(&self) -> (isize, i64) {
    let inner = self.inner.lock();
    (inner.index, inner.current_weight)
  }
}

impl Default for WeightedPool {
  fn default() -> Self {
    Self::new()
  }
}

impl PoolInner {
  fn reset_state(&mut self) {
    self.index = -1;
    self.current_weight = 0;

    self.rotation = self
      .backends
      .iter()
      .filter(|b| b.in_rotation())
      .cloned()
      .collect();

    self.groups = self
      .backends
      .iter()
      .filter_map(|b| b.routing.as_ref().map(|r| (r.group_id, b.clone())))
      .collect();
  }

  fn next_server(&mut self) -> Result<Arc<Backend>, PoolError> {
    if self.rotation.is_empty() {
      return Err(PoolError::Empty);
    }

    let gcd = self.weight_gcd();
    let max = self.max_weight();

    loop {
      self.index = (self.index + 1) % self.rotation.len() as isize;
      if self.index == 0 {
        self.current_weight -= gcd as i64;
        if self.current_weight <= 0 {
          self.current_weight = max as i64;
          if self.current_weight == 0 {
            return Err(PoolError::ZeroWeight);
          }
        }
      }

      let srv = &self.rotation[self.index as usize];
      if srv.weight as i64 >= self.current_weight {
        return Ok(srv.clone());
      }
    }
  }

  fn max_weight(&self) -> u32 {
    self.rotation.iter().map(|b| b.weight).max().unwrap_or(0)
  }

  fn weight_gcd(&self) -> u32 {
    let mut divisor: Option<u32> = None;
    for b in &self.rotation {
      divisor = Some(match divisor {
        None => b.weight,
        Some(d) => gcd::euclid_u32(d, b.weight),
      });
    }
    divisor.unwrap_or(0)
  }
}

/// URL identity: componentwise scheme, host, port and path. Query,
/// fragment and user-info play no part.
pub(crate) fn same_url(a: &Url, b: &Url) -> bool {
  a.scheme() == b.scheme() && a.host() == b.host() && a.port() == b.port() && a.path() == b.path()
}
