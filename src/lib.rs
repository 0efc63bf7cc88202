pub mod breaker;
pub mod cache;
pub mod capacity;
pub mod config;
pub mod domain;
pub mod error;
pub mod event_bus;
pub mod fsm;
pub mod heartbeat;
pub mod metrics;
pub mod relay_registry;
pub mod shutdown;
pub mod store;
pub mod sweeper;
pub mod token_broker;

pub mod api;

pub use config::AppConfig;
pub use error::{CoreError, Result};
pub use fsm::InstanceFsm;
pub use store::{PostgresStore, Store};
