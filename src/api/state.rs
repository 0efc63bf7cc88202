//! Shared application state (C1-C10 handles), grounded in the teacher's
//! `AppState` shape: a `Clone`-able bundle of `Arc`s handed to every axum
//! handler via `State<AppState>`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::cache::Cache;
use crate::capacity::CapacityAdmission;
use crate::config::AppConfig;
use crate::event_bus::EventBus;
use crate::fsm::InstanceFsm;
use crate::heartbeat::HeartbeatEngine;
use crate::metrics::Metrics;
use crate::relay_registry::RelayRegistry;
use crate::store::Store;
use crate::token_broker::TokenBroker;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub cache: Arc<Cache>,
    pub fsm: Arc<InstanceFsm>,
    pub heartbeat: Arc<HeartbeatEngine>,
    pub token_broker: Arc<TokenBroker>,
    pub relay_registry: Arc<RelayRegistry>,
    pub capacity: Arc<CapacityAdmission>,
    pub event_bus: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<AppConfig>,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<Cache>,
        fsm: Arc<InstanceFsm>,
        heartbeat: Arc<HeartbeatEngine>,
        token_broker: Arc<TokenBroker>,
        relay_registry: Arc<RelayRegistry>,
        capacity: Arc<CapacityAdmission>,
        event_bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self { store, cache, fsm, heartbeat, token_broker, relay_registry, capacity, event_bus, metrics, config, start_time: Utc::now() }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}
