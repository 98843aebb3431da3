use crate::bridge::{BridgeHandle, ConnectionState, RealtimeBridge};
use crate::config::{Config, DashboardConfig};
use crate::error::GatewayError;
use crate::filters::FilterCriteria;
use crate::gateway::{DataGateway, HttpGateway};
use crate::models::{BuildRecord, LogPayload};
use crate::scheduler::{RefreshReason, RefreshScheduler};
use crate::state::{Snapshot, StateStore, Subscription, ViewModel};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

/// One running dashboard: owns the store, the scheduler and the push
/// connection, and exposes the UI-level actions.
pub struct Dashboard {
    store: StateStore,
    scheduler: RefreshScheduler,
    gateway: Arc<dyn DataGateway>,
    bridge: BridgeHandle,
    mirror: JoinHandle<()>,
}

impl Dashboard {
    pub fn start(config: &Config) -> Result<Self> {
        let gateway = HttpGateway::new(&config.gateway).context("Failed to create gateway client")?;
        let push_url = gateway
            .push_channel_url()
            .context("Failed to derive push channel URL")?;
        Ok(Self::assemble(Arc::new(gateway), push_url, &config.dashboard))
    }

    pub fn assemble(gateway: Arc<dyn DataGateway>, push_url: Url, settings: &DashboardConfig) -> Self {
        let store = StateStore::new(ViewModel {
            trend_days: settings.trend_days,
            ..ViewModel::default()
        });
        let scheduler = RefreshScheduler::new(gateway.clone(), store.clone(), settings.clone());

        scheduler.request_refresh(RefreshReason::Initial, FilterCriteria::default());

        let bridge = RealtimeBridge::new(push_url, scheduler.clone(), store.clone(), settings).spawn();
        let mirror = tokio::spawn(mirror_connection(bridge.watch(), store.clone()));

        info!("Dashboard started");
        Self {
            store,
            scheduler,
            gateway,
            bridge,
            mirror,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.store.subscribe(callback)
    }

    pub fn set_filters(&self, filters: FilterCriteria) {
        let applied = filters.clone();
        self.store.mutate(move |vm| vm.filters = applied);
        self.scheduler.request_refresh(RefreshReason::FilterChange, filters);
    }

    pub fn set_time_range(&self, days: usize) {
        if days == 0 {
            warn!("Ignoring empty time range");
            return;
        }
        self.store.mutate(|vm| vm.trend_days = days);
        let filters = self.store.snapshot().filters.clone();
        self.scheduler.set_time_range(days, filters);
    }

    /// User-triggered retry; also the only retry path after a failure.
    pub fn refresh(&self) {
        let filters = self.store.snapshot().filters.clone();
        self.scheduler.request_refresh(RefreshReason::Manual, filters);
    }

    pub fn toggle_theme(&self) {
        self.store.mutate(|vm| vm.theme = vm.theme.toggled());
    }

    pub async fn logs(&self, build: &BuildRecord) -> Result<LogPayload, GatewayError> {
        self.gateway
            .logs(build.provider.as_str(), &build.external_ref())
            .await
    }

    pub async fn settle(&self) {
        self.scheduler.settle().await;
    }

    pub async fn shutdown(self) {
        self.bridge.close().await;
        self.scheduler.shutdown();
        if let Err(e) = self.mirror.await {
            warn!("Connection mirror ended abnormally: {}", e);
        }
        self.store.close();
        info!("Dashboard stopped");
    }
}

/// Copies bridge state into the view model until the bridge closes.
async fn mirror_connection(mut rx: watch::Receiver<ConnectionState>, store: StateStore) {
    loop {
        let state = *rx.borrow_and_update();
        if store.snapshot().connection != state {
            store.mutate(|vm| vm.connection = state);
        }
        if state == ConnectionState::Closed || rx.changed().await.is_err() {
            break;
        }
    }
}
