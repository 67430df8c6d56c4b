//! Metric recording store and the extraction interface over it.
//!
//! Units record user-defined counters, distributions and gauges into the
//! `MetricStore` of the bundle they are processing. An `Extractor` walks a
//! store and hands every cell to one callback per metric kind.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attribution of a metric: owning stage, namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels {
    stage: String,
    namespace: String,
    name: String,
}

impl Labels {
    pub fn new(
        stage: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DistributionCell {
    count: i64,
    sum: i64,
    min: i64,
    max: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GaugeCell {
    value: i64,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Cells {
    counters: BTreeMap<Labels, i64>,
    distributions: BTreeMap<Labels, DistributionCell>,
    gauges: BTreeMap<Labels, GaugeCell>,
}

/// Metric cells recorded during one bundle.
#[derive(Debug)]
pub struct MetricStore {
    bundle_id: String,
    cells: Mutex<Cells>,
}

impl MetricStore {
    pub fn new(bundle_id: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            cells: Mutex::new(Cells::default()),
        }
    }

    /// Bundle this store records for.
    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    /// Add `delta` to a cumulative counter. Wraps on overflow.
    pub fn inc_counter(&self, labels: &Labels, delta: i64) {
        let mut cells = self.lock();
        let value = cells.counters.entry(labels.clone()).or_insert(0);
        *value = value.wrapping_add(delta);
    }

    /// Record one sample into a distribution. `count` and `sum` wrap on
    /// overflow; recording never fails.
    pub fn update_distribution(&self, labels: &Labels, sample: i64) {
        let mut cells = self.lock();
        cells
            .distributions
            .entry(labels.clone())
            .and_modify(|d| {
                d.count = d.count.wrapping_add(1);
                d.sum = d.sum.wrapping_add(sample);
                d.min = d.min.min(sample);
                d.max = d.max.max(sample);
            })
            .or_insert(DistributionCell {
                count: 1,
                sum: sample,
                min: sample,
                max: sample,
            });
    }

    /// Set a gauge to `value`, stamped with the current time.
    pub fn set_gauge(&self, labels: &Labels, value: i64) {
        self.set_gauge_at(labels, value, Utc::now());
    }

    pub fn set_gauge_at(&self, labels: &Labels, value: i64, at: DateTime<Utc>) {
        let mut cells = self.lock();
        cells.gauges.insert(labels.clone(), GaugeCell { value, at });
    }

    pub fn is_empty(&self) -> bool {
        let cells = self.lock();
        cells.counters.is_empty() && cells.distributions.is_empty() && cells.gauges.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cells> {
        // A poisoned lock only means a recording thread panicked mid-update;
        // the cells themselves are plain integers and remain usable.
        self.cells.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type SumFn<'a> = Box<dyn FnMut(&Labels, i64) + 'a>;
type DistributionFn<'a> = Box<dyn FnMut(&Labels, i64, i64, i64, i64) + 'a>;
type GaugeFn<'a> = Box<dyn FnMut(&Labels, i64, DateTime<Utc>) + 'a>;

/// Callbacks invoked per metric kind when walking a store.
///
/// Distribution callbacks receive `(labels, count, sum, min, max)`.
#[derive(Default)]
pub struct Extractor<'a> {
    sum_int64: Option<SumFn<'a>>,
    distribution_int64: Option<DistributionFn<'a>>,
    gauge_int64: Option<GaugeFn<'a>>,
}

impl<'a> Extractor<'a> {
    pub fn new() -> Self {
        Self {
            sum_int64: None,
            distribution_int64: None,
            gauge_int64: None,
        }
    }

    pub fn on_counter(mut self, f: impl FnMut(&Labels, i64) + 'a) -> Self {
        self.sum_int64 = Some(Box::new(f));
        self
    }

    pub fn on_distribution(mut self, f: impl FnMut(&Labels, i64, i64, i64, i64) + 'a) -> Self {
        self.distribution_int64 = Some(Box::new(f));
        self
    }

    pub fn on_gauge(mut self, f: impl FnMut(&Labels, i64, DateTime<Utc>) + 'a) -> Self {
        self.gauge_int64 = Some(Box::new(f));
        self
    }

    /// Walk every cell of `store` in label order, counters first, then
    /// distributions, then gauges.
    pub fn extract_from(&mut self, store: &MetricStore) {
        let cells = store.lock();
        if let Some(f) = self.sum_int64.as_mut() {
            for (labels, value) in &cells.counters {
                f(labels, *value);
            }
        }
        if let Some(f) = self.distribution_int64.as_mut() {
            for (labels, d) in &cells.distributions {
                f(labels, d.count, d.sum, d.min, d.max);
            }
        }
        if let Some(f) = self.gauge_int64.as_mut() {
            for (labels, g) in &cells.gauges {
                f(labels, g.value, g.at);
            }
        }
    }
}
