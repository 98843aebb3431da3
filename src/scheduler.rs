//! Fetch lifecycle for every dashboard resource.
//!
//! All refreshes go through [`RefreshScheduler::request_refresh`]. Each
//! dispatch bumps the resource's generation; a completion is committed to the
//! store only if its generation is still current, so a slow response for an
//! old filter set can never overwrite a newer one. Push-triggered requests
//! are coalesced into one fetch per window.

use crate::aggregator;
use crate::config::DashboardConfig;
use crate::error::GatewayError;
use crate::filters::{normalize, CanonicalQuery, FilterCriteria};
use crate::gateway::DataGateway;
use crate::models::{BuildRecord, ChartBucket, OverviewMetrics, PipelinePerformance};
use crate::state::{StateStore, ViewModel};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Overview,
    Builds,
    Chart,
    Trends,
    Performance,
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::Overview,
        Resource::Builds,
        Resource::Chart,
        Resource::Trends,
        Resource::Performance,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Initial,
    FilterChange,
    EventTriggered,
    Manual,
}

#[derive(Debug)]
enum Fetched {
    Overview(OverviewMetrics),
    Builds(Vec<BuildRecord>),
    Chart(Vec<ChartBucket>),
    Trends(Vec<ChartBucket>),
    Performance(Vec<PipelinePerformance>),
}

impl Fetched {
    fn apply(self, vm: &mut ViewModel) {
        match self {
            Fetched::Overview(o) => vm.overview = Some(o),
            Fetched::Builds(b) => vm.builds = b,
            Fetched::Chart(c) => vm.chart_series = c,
            Fetched::Trends(t) => vm.trends = t,
            Fetched::Performance(p) => vm.pipeline_performance = p,
        }
    }
}

#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    gateway: Arc<dyn DataGateway>,
    store: StateStore,
    settings: DashboardConfig,
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    generations: HashMap<Resource, u64>,
    active: CanonicalQuery,
    /// Days of history for chart and trends; set by time-range changes.
    trend_days: usize,
    dispatched: bool,
    window: Option<CoalesceWindow>,
    window_epoch: u64,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

struct CoalesceWindow {
    epoch: u64,
    filters: FilterCriteria,
    merged: u32,
}

impl RefreshScheduler {
    pub fn new(gateway: Arc<dyn DataGateway>, store: StateStore, settings: DashboardConfig) -> Self {
        let state = SchedulerState {
            trend_days: settings.trend_days,
            ..SchedulerState::default()
        };
        Self {
            inner: Arc::new(SchedulerInner {
                gateway,
                store,
                settings,
                state: Mutex::new(state),
            }),
        }
    }

    /// The single entry point for reconciliation. Never blocks; fetches run
    /// as tasks on the current runtime.
    pub fn request_refresh(&self, reason: RefreshReason, filters: FilterCriteria) {
        match reason {
            RefreshReason::EventTriggered => self.coalesce(filters),
            RefreshReason::FilterChange => {
                let query = normalize(&filters);
                {
                    let st = self.lock();
                    if st.dispatched && st.active == query {
                        debug!("Filter change to {:?} is a no-op", query);
                        return;
                    }
                }
                self.dispatch(reason, query);
            }
            RefreshReason::Initial | RefreshReason::Manual => self.dispatch(reason, normalize(&filters)),
        }
    }

    /// Switches the chart/trends range and refetches like a filter change.
    /// Setting the range already in effect is a no-op.
    pub fn set_time_range(&self, days: usize, filters: FilterCriteria) {
        {
            let mut st = self.lock();
            if st.closed || (st.dispatched && st.trend_days == days) {
                debug!("Time range of {} days is a no-op", days);
                return;
            }
            st.trend_days = days;
        }
        self.dispatch(RefreshReason::FilterChange, normalize(&filters));
    }

    pub fn active_query(&self) -> CanonicalQuery {
        self.lock().active.clone()
    }

    pub fn time_range(&self) -> usize {
        self.lock().trend_days
    }

    pub fn generation(&self, resource: Resource) -> u64 {
        self.lock().generations.get(&resource).copied().unwrap_or(0)
    }

    /// Waits until no fetch or coalescing window is outstanding.
    pub async fn settle(&self) {
        loop {
            let tasks = std::mem::take(&mut self.lock().tasks);
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        error!("Refresh task failed: {}", e);
                    }
                }
            }
        }
    }

    /// Stops accepting requests and aborts everything in flight.
    pub fn shutdown(&self) {
        let mut st = self.lock();
        st.closed = true;
        st.window = None;
        for task in st.tasks.drain(..) {
            task.abort();
        }
        info!("Refresh scheduler stopped");
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn coalesce(&self, filters: FilterCriteria) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        if let Some(window) = st.window.as_mut() {
            window.filters = filters;
            window.merged += 1;
            debug!("Coalesced push event into pending refresh ({} so far)", window.merged);
            return;
        }

        st.window_epoch += 1;
        let epoch = st.window_epoch;
        st.window = Some(CoalesceWindow {
            epoch,
            filters,
            merged: 1,
        });

        let this = self.clone();
        let delay = self.inner.settings.coalesce_window();
        st.tasks.push(tokio::spawn(async move {
            sleep(delay).await;
            this.close_window(epoch);
        }));
    }

    fn close_window(&self, epoch: u64) {
        let window = {
            let mut st = self.lock();
            match st.window.take() {
                Some(w) if w.epoch == epoch => w,
                other => {
                    // Superseded by an immediate refresh; leave any newer window alone.
                    st.window = other;
                    return;
                }
            }
        };
        info!("Refreshing after {} push event(s)", window.merged);
        self.dispatch(RefreshReason::EventTriggered, normalize(&window.filters));
    }

    fn dispatch(&self, reason: RefreshReason, query: CanonicalQuery) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        if st.window.take().is_some() {
            debug!("Pending coalesced refresh superseded by {:?}", reason);
        }
        st.window_epoch += 1;
        st.active = query.clone();
        st.dispatched = true;
        st.tasks.retain(|t| !t.is_finished());

        let days = st.trend_days;
        info!("Refresh ({:?}) with filters {:?} over {} days", reason, query, days);
        for resource in Resource::ALL {
            let generation = st.generations.entry(resource).or_insert(0);
            *generation += 1;
            let generation = *generation;

            let this = self.clone();
            let query = query.clone();
            st.tasks.push(tokio::spawn(async move {
                let outcome = this.fetch(resource, &query, days).await;
                this.commit(resource, generation, outcome);
            }));
        }
    }

    async fn fetch(
        &self,
        resource: Resource,
        query: &CanonicalQuery,
        days: usize,
    ) -> Result<Fetched, GatewayError> {
        let gw = &self.inner.gateway;
        let cfg = &self.inner.settings;
        match resource {
            Resource::Overview => gw.overview().await.map(Fetched::Overview),
            Resource::Builds => gw.builds(query, cfg.builds_limit).await.map(Fetched::Builds),
            Resource::Chart => match gw.chart_data(days).await? {
                Some(series) if !series.is_empty() => Ok(Fetched::Chart(series)),
                _ => {
                    let window = gw.builds(query, cfg.recent_window).await?;
                    Ok(Fetched::Chart(aggregator::recent_activity(&window, cfg.chart_points)))
                }
            },
            Resource::Trends => match gw.build_trends(days).await? {
                Some(points) => Ok(Fetched::Trends(aggregator::from_trend_points(&points, days))),
                None => {
                    let window = gw.builds(&CanonicalQuery::default(), cfg.recent_window).await?;
                    Ok(Fetched::Trends(aggregator::daily_trend(&window, days)))
                }
            },
            Resource::Performance => gw
                .pipeline_performance(cfg.performance_limit)
                .await
                .map(Fetched::Performance),
        }
    }

    fn commit(&self, resource: Resource, generation: u64, outcome: Result<Fetched, GatewayError>) {
        let failure = outcome.as_ref().err().map(ToString::to_string);

        // Generation check and publish happen under the store's write lock.
        let published = self.inner.store.try_mutate(|vm| {
            if self.generation(resource) != generation {
                return false;
            }
            match outcome {
                Ok(data) => {
                    data.apply(vm);
                    vm.errors.remove(&resource);
                    vm.refreshed_at.insert(resource, Utc::now());
                }
                Err(e) => {
                    vm.errors.insert(resource, e.to_string());
                }
            }
            true
        });

        match (published, failure) {
            (None, _) => debug!(
                "Discarding stale {:?} result (generation {}, current {})",
                resource,
                generation,
                self.generation(resource)
            ),
            (Some(_), Some(msg)) => error!("Failed to refresh {:?}: {}", resource, msg),
            (Some(_), None) => debug!("Committed {:?} generation {}", resource, generation),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{BuildStatus, LogPayload, Provider, TrendPoint};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    pub(crate) fn record(id: i64, provider: Provider) -> BuildRecord {
        BuildRecord {
            id,
            provider,
            pipeline: format!("pipeline-{id}"),
            status: BuildStatus::Success,
            started_at: None,
            duration_seconds: Some(id * 10),
            external_id: None,
            web_url: None,
        }
    }

    /// Scripted gateway: `/api/builds` responses for a provider can be held
    /// back until the test releases them.
    #[derive(Default)]
    pub(crate) struct FakeGateway {
        pub overview_calls: AtomicUsize,
        pub builds_calls: AtomicUsize,
        pub builds_queries: Mutex<Vec<CanonicalQuery>>,
        pub fail_overview: AtomicBool,
        pub chart_missing: AtomicBool,
        pub trend_days: Mutex<Vec<usize>>,
        held: Mutex<HashMap<String, oneshot::Receiver<Result<Vec<BuildRecord>, GatewayError>>>>,
    }

    impl FakeGateway {
        pub(crate) fn hold_builds(
            &self,
            provider: &str,
        ) -> oneshot::Sender<Result<Vec<BuildRecord>, GatewayError>> {
            let (tx, rx) = oneshot::channel();
            self.held.lock().unwrap().insert(provider.to_string(), rx);
            tx
        }
    }

    fn server_error(path: &str) -> GatewayError {
        GatewayError::Status {
            path: path.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[async_trait]
    impl DataGateway for FakeGateway {
        async fn overview(&self) -> Result<OverviewMetrics, GatewayError> {
            self.overview_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_overview.load(Ordering::SeqCst) {
                return Err(server_error("/api/metrics/overview"));
            }
            Ok(OverviewMetrics {
                success_rate: 90.0,
                failure_rate: 10.0,
                ..OverviewMetrics::default()
            })
        }

        async fn builds(
            &self,
            query: &CanonicalQuery,
            _limit: usize,
        ) -> Result<Vec<BuildRecord>, GatewayError> {
            self.builds_calls.fetch_add(1, Ordering::SeqCst);
            self.builds_queries.lock().unwrap().push(query.clone());
            let provider = query.get("provider").unwrap_or("").to_string();
            let held = self.held.lock().unwrap().remove(&provider);
            match held {
                Some(rx) => rx.await.unwrap_or_else(|_| Err(server_error("/api/builds"))),
                None => Ok(vec![record(1, Provider::from(provider))]),
            }
        }

        async fn chart_data(&self, _days: usize) -> Result<Option<Vec<ChartBucket>>, GatewayError> {
            if self.chart_missing.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(vec![ChartBucket {
                label: "pre".into(),
                success: 3,
                ..ChartBucket::default()
            }]))
        }

        async fn build_trends(&self, days: usize) -> Result<Option<Vec<TrendPoint>>, GatewayError> {
            self.trend_days.lock().unwrap().push(days);
            Ok(Some(vec![]))
        }

        async fn pipeline_performance(
            &self,
            _limit: usize,
        ) -> Result<Vec<PipelinePerformance>, GatewayError> {
            Ok(vec![])
        }

        async fn logs(&self, provider: &str, external_id: &str) -> Result<LogPayload, GatewayError> {
            Err(server_error(&format!("/api/logs/{provider}/{external_id}")))
        }
    }

    fn setup() -> (Arc<FakeGateway>, StateStore, RefreshScheduler) {
        let gw = Arc::new(FakeGateway::default());
        let store = StateStore::default();
        let sched = RefreshScheduler::new(gw.clone(), store.clone(), DashboardConfig::default());
        (gw, store, sched)
    }

    fn provider(p: &str) -> FilterCriteria {
        FilterCriteria::from_inputs(p, "", "")
    }

    async fn wait_for(store: &StateStore, pred: impl Fn(&ViewModel) -> bool) {
        for _ in 0..1000 {
            if pred(&store.snapshot()) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn older_response_arriving_last_is_discarded() {
        let (gw, store, sched) = setup();
        let release_a = gw.hold_builds("github");
        let release_b = gw.hold_builds("gitlab");

        sched.request_refresh(RefreshReason::FilterChange, provider("github"));
        sched.request_refresh(RefreshReason::FilterChange, provider("gitlab"));
        assert_eq!(sched.generation(Resource::Builds), 2);

        release_b.send(Ok(vec![record(2, Provider::Gitlab)])).unwrap();
        wait_for(&store, |vm| vm.builds.first().map(|b| b.id) == Some(2)).await;

        release_a.send(Ok(vec![record(1, Provider::Github)])).unwrap();
        sched.settle().await;

        let vm = store.snapshot();
        assert_eq!(vm.builds, vec![record(2, Provider::Gitlab)]);
        assert_eq!(sched.active_query().get("provider"), Some("gitlab"));
    }

    #[tokio::test]
    async fn stale_failure_does_not_flag_an_error() {
        let (gw, store, sched) = setup();
        let release_a = gw.hold_builds("github");

        sched.request_refresh(RefreshReason::FilterChange, provider("github"));
        sched.request_refresh(RefreshReason::FilterChange, provider("jenkins"));
        wait_for(&store, |vm| !vm.builds.is_empty()).await;

        release_a.send(Err(server_error("/api/builds"))).unwrap();
        sched.settle().await;

        let vm = store.snapshot();
        assert!(!vm.errors.contains_key(&Resource::Builds));
        assert_eq!(vm.builds[0].provider, Provider::Jenkins);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_push_events_yields_a_single_fetch() {
        let (gw, _store, sched) = setup();
        for _ in 0..10 {
            sched.request_refresh(RefreshReason::EventTriggered, FilterCriteria::default());
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(gw.builds_calls.load(Ordering::SeqCst), 0);

        sched.settle().await;
        assert_eq!(gw.builds_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gw.overview_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_fetch_uses_latest_filters() {
        let (gw, _store, sched) = setup();
        sched.request_refresh(RefreshReason::EventTriggered, provider("github"));
        sched.request_refresh(RefreshReason::EventTriggered, provider("gitlab"));
        sched.settle().await;

        let queries = gw.builds_queries.lock().unwrap().clone();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].get("provider"), Some("gitlab"));
    }

    #[tokio::test(start_paused = true)]
    async fn events_in_separate_windows_fetch_separately() {
        let (gw, _store, sched) = setup();
        sched.request_refresh(RefreshReason::EventTriggered, FilterCriteria::default());
        sleep(Duration::from_secs(1)).await;
        sched.request_refresh(RefreshReason::EventTriggered, FilterCriteria::default());
        sched.settle().await;
        assert_eq!(gw.builds_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn filter_change_bypasses_and_cancels_pending_window() {
        let (gw, store, sched) = setup();
        sched.request_refresh(RefreshReason::EventTriggered, FilterCriteria::default());
        sched.request_refresh(RefreshReason::FilterChange, provider("jenkins"));

        // Immediate: fires without waiting for the window.
        wait_for(&store, |vm| !vm.builds.is_empty()).await;
        assert_eq!(gw.builds_calls.load(Ordering::SeqCst), 1);

        sched.settle().await;
        assert_eq!(gw.builds_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.snapshot().builds[0].provider, Provider::Jenkins);
    }

    #[tokio::test]
    async fn equivalent_filter_change_is_a_no_op() {
        let (gw, _store, sched) = setup();
        sched.request_refresh(RefreshReason::Initial, FilterCriteria::default());
        sched.settle().await;
        sched.request_refresh(RefreshReason::FilterChange, FilterCriteria::from_inputs("", "", "  "));
        sched.settle().await;
        assert_eq!(gw.builds_calls.load(Ordering::SeqCst), 1);

        // Manual refresh always fires.
        sched.request_refresh(RefreshReason::Manual, FilterCriteria::default());
        sched.settle().await;
        assert_eq!(gw.builds_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_keeps_last_good_value_and_sets_flag() {
        let (gw, store, sched) = setup();
        sched.request_refresh(RefreshReason::Initial, FilterCriteria::default());
        sched.settle().await;
        let good = store.snapshot().overview.clone();
        assert!(good.is_some());

        gw.fail_overview.store(true, Ordering::SeqCst);
        sched.request_refresh(RefreshReason::Manual, FilterCriteria::default());
        sched.settle().await;
        let vm = store.snapshot();
        assert_eq!(vm.overview, good);
        assert!(vm.errors.contains_key(&Resource::Overview));
        assert!(!vm.errors.contains_key(&Resource::Builds));
        // No automatic retry.
        assert_eq!(gw.overview_calls.load(Ordering::SeqCst), 2);

        gw.fail_overview.store(false, Ordering::SeqCst);
        sched.request_refresh(RefreshReason::Manual, FilterCriteria::default());
        sched.settle().await;
        assert!(!store.snapshot().has_errors());
    }

    #[tokio::test]
    async fn chart_falls_back_to_aggregated_builds() {
        let (gw, store, sched) = setup();
        sched.request_refresh(RefreshReason::Initial, FilterCriteria::default());
        sched.settle().await;
        assert_eq!(store.snapshot().chart_series[0].label, "pre");

        gw.chart_missing.store(true, Ordering::SeqCst);
        sched.request_refresh(RefreshReason::Manual, FilterCriteria::default());
        sched.settle().await;
        let chart = store.snapshot().chart_series.clone();
        assert_eq!(chart.len(), 1);
        assert_eq!(chart[0].label, "#1");
        assert_eq!(chart[0].success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn filter_change_invalidates_fetch_already_issued_by_window() {
        let (gw, store, sched) = setup();
        let release_github = gw.hold_builds("github");

        sched.request_refresh(RefreshReason::EventTriggered, provider("github"));
        sleep(Duration::from_millis(500)).await;
        // The window closed and its builds fetch is now waiting on the backend.
        assert_eq!(gw.builds_calls.load(Ordering::SeqCst), 1);
        let before = sched.generation(Resource::Builds);

        sched.request_refresh(RefreshReason::FilterChange, provider("gitlab"));
        assert_eq!(sched.generation(Resource::Builds), before + 1);
        wait_for(&store, |vm| !vm.builds.is_empty()).await;

        release_github.send(Ok(vec![record(9, Provider::Github)])).unwrap();
        sched.settle().await;

        let vm = store.snapshot();
        assert_eq!(vm.builds.len(), 1);
        assert_eq!(vm.builds[0].provider, Provider::Gitlab);
    }

    #[tokio::test]
    async fn chart_fallback_window_follows_active_filters() {
        let (gw, _store, sched) = setup();
        gw.chart_missing.store(true, Ordering::SeqCst);
        sched.request_refresh(RefreshReason::FilterChange, provider("github"));
        sched.settle().await;

        let queries = gw.builds_queries.lock().unwrap().clone();
        assert_eq!(queries.len(), 2);
        assert!(queries.iter().all(|q| q.get("provider") == Some("github")));
    }

    #[tokio::test]
    async fn time_range_change_refetches_with_new_range() {
        let (gw, _store, sched) = setup();
        sched.request_refresh(RefreshReason::Initial, FilterCriteria::default());
        sched.settle().await;
        let before = sched.generation(Resource::Trends);

        sched.set_time_range(30, FilterCriteria::default());
        sched.settle().await;
        assert_eq!(sched.generation(Resource::Trends), before + 1);
        assert_eq!(sched.time_range(), 30);

        // Same range again does nothing.
        sched.set_time_range(30, FilterCriteria::default());
        sched.settle().await;
        assert_eq!(*gw.trend_days.lock().unwrap(), vec![14, 30]);
        assert_eq!(gw.builds_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_work() {
        let (gw, _store, sched) = setup();
        sched.request_refresh(RefreshReason::EventTriggered, FilterCriteria::default());
        sched.shutdown();
        sched.request_refresh(RefreshReason::Manual, FilterCriteria::default());
        sched.settle().await;
        sleep(Duration::from_secs(1)).await;
        assert_eq!(gw.builds_calls.load(Ordering::SeqCst), 0);
    }
}
