//! Stage-keyed metrics report handed to the reporting layer.

use std::cell::RefCell;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stagerun_core::metrics::{Extractor, Labels, MetricStore};
use stagerun_core::types::ProgressSnapshot;

/// Metrics for every stage touched by the plan, keyed by stage id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
}

impl MetricsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, stage_id: &str) -> Option<&StageMetrics> {
        self.stages.get(stage_id)
    }

    fn stage_mut(&mut self, stage_id: &str) -> &mut StageMetrics {
        self.stages.entry(stage_id.to_string()).or_default()
    }

    /// Record source progress as a processed-element count.
    pub(crate) fn record_progress(&mut self, progress: ProgressSnapshot) {
        let mut counts = BTreeMap::new();
        counts.insert(progress.name, progress.count);
        self.stage_mut(&progress.stage_id).processed_elements = Some(ProcessedElements {
            output_element_counts: counts,
        });
    }

    /// Append every cell of `store` to the record of its owning stage.
    pub(crate) fn record_store(&mut self, store: &MetricStore) {
        let entries: RefCell<Vec<(String, UserMetric)>> = RefCell::new(Vec::new());
        Extractor::new()
            .on_counter(|l, value| {
                entries
                    .borrow_mut()
                    .push(user_metric(l, MetricData::Counter { value }))
            })
            .on_distribution(|l, count, sum, min, max| {
                entries.borrow_mut().push(user_metric(
                    l,
                    MetricData::Distribution {
                        count,
                        sum,
                        min,
                        max,
                    },
                ))
            })
            .on_gauge(|l, value, timestamp| {
                entries.borrow_mut().push(user_metric(l, MetricData::Gauge { value, timestamp }))
            })
            .extract_from(store);

        for (stage_id, metric) in entries.into_inner() {
            self.stage_mut(&stage_id).user.push(metric);
        }
    }
}

fn user_metric(labels: &Labels, data: MetricData) -> (String, UserMetric) {
    (
        labels.stage().to_string(),
        UserMetric {
            name: MetricName {
                name: labels.name().to_string(),
                namespace: labels.namespace().to_string(),
            },
            data,
        },
    )
}

/// Per-stage record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_elements: Option<ProcessedElements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user: Vec<UserMetric>,
}

impl StageMetrics {
    /// Find a user metric by name.
    pub fn user_metric(&self, name: &str) -> Option<&UserMetric> {
        self.user.iter().find(|m| m.name.name == name)
    }
}

/// Element counts measured at a stage's outputs, keyed by output name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedElements {
    pub output_element_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricName {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMetric {
    pub name: MetricName,
    pub data: MetricData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricData {
    Counter {
        value: i64,
    },
    Distribution {
        count: i64,
        sum: i64,
        min: i64,
        max: i64,
    },
    Gauge {
        value: i64,
        timestamp: DateTime<Utc>,
    },
}
