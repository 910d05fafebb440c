use rand::Rng;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

pub const RESERVOIR_SIZE: usize = 512;
pub const RESERVOIR_ALPHA: f64 = 0.15;

const RESCALE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// A forward-decaying priority reservoir: recent samples carry
/// exponentially larger priorities, so the reservoir tracks roughly the
/// last few minutes of traffic regardless of throughput.
pub struct ExpDecaySample {
  size: usize,
  alpha: f64,
  count: u64,
  landmark: Instant,
  heap: BinaryHeap<WeightedSample>,
}

#[derive(Debug, Clone, Copy)]
struct WeightedSample {
  priority: f64,
  value: i64,
}

impl PartialEq for WeightedSample {
  fn eq(&self, other: &Self) -> bool {
    self.priority.total_cmp(&other.priority).is_eq()
  }
}

impl Eq for WeightedSample {}

impl PartialOrd for WeightedSample {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for WeightedSample {
  // reversed so the heap pops the lowest-priority sample first
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    other.priority.total_cmp(&self.priority)
  }
}

impl ExpDecaySample {
  pub fn new(size: usize, alpha: f64) -> Self {
    Self {
      size,
      alpha,
      count: 0,
      landmark: Instant::now(),
      heap: BinaryHeap::with_capacity(size),
    }
  }

  pub fn update(&mut self, value: i64) {
    if self.landmark.elapsed() >= RESCALE_INTERVAL {
      self.rescale();
    }

    self.count += 1;

    let t = self.landmark.elapsed().as_secs_f64();
    let uniform: f64 = rand::thread_rng().gen_range(f64::MIN_POSITIVE..1.0);
    let priority = (self.alpha * t).exp() / uniform;
    let sample = WeightedSample { priority, value };

    if self.heap.len() < self.size {
      self.heap.push(sample);
    } else if let Some(min) = self.heap.peek() {
      if priority > min.priority {
        self.heap.pop();
        self.heap.push(sample);
      }
    }
  }

  // shift the landmark forward and decay all stored priorities so new
  // samples keep a comparable scale (priorities grow exponentially with
  // the time since the landmark and would overflow f64 otherwise)
  fn rescale(&mut self) {
    let factor = (-self.alpha * self.landmark.elapsed().as_secs_f64()).exp();
    self.landmark = Instant::now();
    self.heap = self
      .heap
      .iter()
      .map(|s| WeightedSample {
        priority: s.priority * factor,
        value: s.value,
      })
      .collect();
  }

  pub fn clear(&mut self) {
    self.count = 0;
    self.landmark = Instant::now();
    self.heap.clear();
  }

  pub fn count(&self) -> u64 {
    self.count
  }

  pub fn len(&self) -> usize {
    self.heap.len()
  }

  pub fn is_empty(&self) -> bool {
    self.heap.is_empty()
  }

  pub fn snapshot(&self) -> Vec<i64> {
    self.heap.iter().map(|s| s.value).collect()
  }
}
