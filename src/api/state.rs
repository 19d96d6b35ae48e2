use std::sync::Arc;

use tokio::sync::RwLock;

use crate::bus_cache::BusCacheService;
use crate::capacity::CapacityStore;
use crate::config::Config;
use crate::db::Store;
use crate::feature_store::FeatureStore;
use crate::metro_cache::MetroCacheService;
use crate::model::Model;
use crate::scheduler::Scheduler;
use crate::topology::Topology;

/// Shared application state. The four read-mostly artifacts are behind
/// `Arc<RwLock<T>>` so an administrative reload can swap them atomically
/// without interrupting in-flight reads.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub feature_store: Arc<RwLock<Arc<FeatureStore>>>,
    pub model: Arc<RwLock<Arc<Model>>>,
    pub topology: Arc<RwLock<Arc<Topology>>>,
    pub capacity_store: Arc<RwLock<Arc<CapacityStore>>>,
    pub bus_cache: Arc<BusCacheService>,
    pub metro_cache: Arc<MetroCacheService>,
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<Config>,
}
