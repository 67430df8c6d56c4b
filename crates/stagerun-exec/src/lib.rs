//! Bundle execution for compiled graph fragments.
//!
//! A `Plan` owns the units of one fragment and drives them through bring-up,
//! any number of bundles, and tear-down. Every call into a unit goes through
//! the fault-containment boundary in `guard`, so a failing or panicking stage
//! surfaces as an error and a `Broken` plan rather than a crashed worker.

pub mod builder;
mod guard;
pub mod plan;
pub mod report;
pub mod units;

pub use builder::PlanBuilder;
pub use plan::{Plan, SourceHandle};
pub use report::{MetricData, MetricName, MetricsSnapshot, ProcessedElements, StageMetrics, UserMetric};
