//! Shared application state handed to every axum handler.

use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::{Accounts, SessionResolver};
use crate::clock::{Clock, SystemClock};
use crate::registry::ConnectionRegistry;
use crate::storage::Stores;
use crate::sync::{SyncConfig, SyncEngine};

#[derive(Clone)]
pub struct AppState {
    accounts: Accounts,
    engine: SyncEngine,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        stores: Stores,
        clock: Arc<dyn Clock>,
        session_ttl: Option<Duration>,
        sync: SyncConfig,
    ) -> Self {
        let resolver = SessionResolver::new(&stores, clock.clone(), session_ttl);
        let accounts = Accounts::new(&stores, resolver);
        let engine = SyncEngine::new(stores.timers.clone(), ConnectionRegistry::new(), clock, sync);
        Self {
            accounts,
            engine,
            metrics: None,
        }
    }

    /// In-memory state with the wall clock and default sync settings.
    pub fn in_memory() -> Self {
        Self::new(
            Stores::memory(),
            Arc::new(SystemClock),
            None,
            SyncConfig::default(),
        )
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn accounts(&self) -> &Accounts {
        &self.accounts
    }

    pub fn sessions(&self) -> &SessionResolver {
        self.accounts.sessions()
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.engine.registry()
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}
