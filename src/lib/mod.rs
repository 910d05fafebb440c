pub mod body;
pub mod buffer;
pub mod config;
pub mod io;
pub mod metrics;
pub mod proxy;
pub mod upgrade;
pub mod util;

pub use proxy::balance::{Backend, BackendOptions, Routing, WeightedPool};
pub use proxy::forward::Forwarder;
pub use proxy::handler::BalancerHandler;
pub use proxy::sticky::StickySession;
