use crate::bridge::ConnectionState;
use crate::filters::FilterCriteria;
use crate::models::{BuildRecord, ChartBucket, OverviewMetrics, PipelinePerformance, Theme};
use crate::scheduler::Resource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// Everything the rendering layer needs, as one immutable snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewModel {
    pub overview: Option<OverviewMetrics>,
    pub builds: Vec<BuildRecord>,
    pub chart_series: Vec<ChartBucket>,
    pub trends: Vec<ChartBucket>,
    pub pipeline_performance: Vec<PipelinePerformance>,
    pub filters: FilterCriteria,
    /// Days of history shown by the chart and trends panels.
    pub trend_days: usize,
    pub connection: ConnectionState,
    pub theme: Theme,
    /// Last fetch failure per resource; cleared by the next success.
    pub errors: BTreeMap<Resource, String>,
    pub refreshed_at: BTreeMap<Resource, DateTime<Utc>>,
    /// Incremented on every mutation.
    pub version: u64,
}

impl ViewModel {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

pub type Snapshot = Arc<ViewModel>;

type Callback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// Cloneable handle to the single view model of a running dashboard.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    snapshot: RwLock<Snapshot>,
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

/// Returned by [`StateStore::subscribe`]. Dropping it keeps the subscription.
pub struct Subscription {
    id: u64,
    store: Weak<StoreInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.store.upgrade() {
            inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(ViewModel::default())
    }
}

impl StateStore {
    pub fn new(initial: ViewModel) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                snapshot: RwLock::new(Arc::new(initial)),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies `patch` to a copy of the current view model, publishes the
    /// result and notifies subscribers in registration order.
    ///
    /// `patch` runs under the store's write lock and must not call back into
    /// the store.
    pub fn mutate<F>(&self, patch: F) -> Snapshot
    where
        F: FnOnce(&mut ViewModel),
    {
        let published = self.try_mutate(|vm| {
            patch(vm);
            true
        });
        published.unwrap_or_else(|| self.snapshot())
    }

    /// Like [`mutate`](Self::mutate), but the patch may reject the change by
    /// returning `false`; nothing is published or notified in that case.
    pub fn try_mutate<F>(&self, patch: F) -> Option<Snapshot>
    where
        F: FnOnce(&mut ViewModel) -> bool,
    {
        let next = {
            let mut current = self
                .inner
                .snapshot
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut draft = ViewModel::clone(&current);
            if !patch(&mut draft) {
                return None;
            }
            draft.version = current.version + 1;
            let next = Arc::new(draft);
            *current = next.clone();
            next
        };
        self.notify(&next);
        Some(next)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every subscriber. Called once at dashboard teardown.
    pub fn close(&self) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn notify(&self, snapshot: &Snapshot) {
        // Callbacks may subscribe, unsubscribe or mutate; work on a copy.
        let subscribers: Vec<Callback> = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for cb in subscribers {
            // A nested mutate already delivered a newer snapshot to everyone.
            if self.snapshot().version != snapshot.version {
                break;
            }
            cb(snapshot);
        }
    }
}
