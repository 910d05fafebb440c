use serde::Deserialize;
use url::Url;

use crate::proxy::balance::{BackendOptions, Routing, WeightedPool};

/// Declarative backend set. Parsing the surrounding configuration file is
/// the caller's concern; applying a parsed pool section is ours.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
  pub servers: Vec<BackendEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendEntry {
  pub url: Url,

  #[serde(default)]
  pub weight: Option<u32>,

  #[serde(default)]
  pub path_rewrite: bool,

  #[serde(default)]
  pub routing: Option<RoutingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingEntry {
  pub status: String,
  pub group_id: u32,

  #[serde(default)]
  pub hmac_keys: Vec<String>,

  #[serde(default)]
  pub sticky_routing_only: bool,
}

impl PoolConfig {
  /// Upsert every configured backend into `pool`.
  pub fn apply(&self, pool: &WeightedPool) {
    for entry in &self.servers {
      let mut options = BackendOptions::new().path_rewrite(entry.path_rewrite);

      if let Some(weight) = entry.weight {
        options = options.weight(weight);
      }

      if let Some(routing) = &entry.routing {
        options = options.routing(Routing {
          status: routing.status.clone(),
          group_id: routing.group_id,
          hmac_keys: routing.hmac_keys.iter().map(|k| k.clone().into_bytes()).collect(),
          sticky_routing_only: routing.sticky_routing_only,
        });
      }

      pool.upsert(entry.url.clone(), options);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn applies_parsed_servers() {
    let config: PoolConfig = serde_json::from_str(
      r#"{
        "servers": [
          { "url": "http://a:7001/", "weight": 3 },
          { "url": "http://b:7002/", "path_rewrite": true },
          {
            "url": "http://grouped:7003/",
            "routing": {
              "status": "OK",
              "group_id": 12,
              "hmac_keys": ["secret"],
              "sticky_routing_only": true
            }
          }
        ]
      }"#,
    )
    .unwrap();

    let pool = WeightedPool::new();
    config.apply(&pool);

    assert_eq!(pool.weight(&Url::parse("http://a:7001/").unwrap()), Some(3));
    assert_eq!(pool.weight(&Url::parse("http://b:7002/").unwrap()), Some(1));

    // the grouped backend is sticky-only and out of rotation
    assert_eq!(pool.servers().len(), 2);
    let grouped = pool.group(12).unwrap();
    assert_eq!(grouped.url().as_str(), "http://grouped:7003/");
    assert_eq!(
      grouped.routing().unwrap().hmac_keys,
      vec![b"secret".to_vec()]
    );
  }

  #[test]
  fn unknown_fields_are_rejected() {
    let parsed: Result<PoolConfig, _> =
      serde_json::from_str(r#"{ "servers": [], "unknown": true }"#);
    assert!(parsed.is_err());
  }
}
