use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics::MetricStore;

/// Execution plan identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new() -> Self {
        Self(format!("plan-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for PlanId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PlanId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bundle identifier, assigned by the controller.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BundleId(pub String);

impl BundleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BundleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BundleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a plan.
///
/// `Initializing -> Up -> Active -> Up -> ...`, with `Broken` entered on any
/// failure and `Down` entered on explicit tear-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Initializing,
    Up,
    Active,
    Broken,
    Down,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Initializing => "Initializing",
            Status::Up => "Up",
            Status::Active => "Active",
            Status::Broken => "Broken",
            Status::Down => "Down",
        };
        f.write_str(s)
    }
}

/// The lifecycle call a unit was executing, used for error attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleCall {
    Up,
    StartBundle,
    Drive,
    FinishBundle,
    Down,
    Split,
    Progress,
}

impl fmt::Display for LifecycleCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleCall::Up => "Up",
            LifecycleCall::StartBundle => "StartBundle",
            LifecycleCall::Drive => "Drive",
            LifecycleCall::FinishBundle => "FinishBundle",
            LifecycleCall::Down => "Down",
            LifecycleCall::Split => "Split",
            LifecycleCall::Progress => "Progress",
        };
        f.write_str(s)
    }
}

/// Split requested by the controller: candidate offsets plus a fractional hint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitPoints {
    /// Desired split indices, in order of preference.
    pub splits: Vec<i64>,
    /// Fraction of the remaining work the controller would like to keep.
    pub frac: f64,
}

impl SplitPoints {
    pub fn new(splits: Vec<i64>, frac: f64) -> Self {
        Self { splits, frac }
    }
}

impl fmt::Display for SplitPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{splits: {:?}, frac: {}}}", self.splits, self.frac)
    }
}

/// Consumption progress reported by a data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Stage the data originates from.
    pub stage_id: String,
    /// Output name the count is recorded under.
    pub name: String,
    /// Elements consumed so far in the current bundle.
    pub count: i64,
}

/// Cancellation context passed to every lifecycle call.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    cancel: CancellationToken,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Per-bundle state handed to root units for the three bundle phases.
#[derive(Debug, Clone)]
pub struct BundleContext {
    pub exec: ExecContext,
    pub plan_id: PlanId,
    pub bundle_id: BundleId,
    /// Store that metrics recorded during this bundle go to.
    pub metrics: Arc<MetricStore>,
}

impl BundleContext {
    pub fn is_cancelled(&self) -> bool {
        self.exec.is_cancelled()
    }
}

/// Opaque handle to the transport feeding and draining a bundle.
///
/// Its concrete shape belongs to the transport layer; units downcast it to
/// the type they were built against.
#[derive(Clone)]
pub struct DataContext {
    inner: Option<Arc<dyn Any + Send + Sync>>,
}

impl DataContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Some(Arc::new(value)),
        }
    }

    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self { inner: Some(value) }
    }

    /// A context with no transport attached.
    pub fn empty() -> Self {
        Self { inner: None }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.as_ref().and_then(|v| v.downcast_ref::<T>())
    }
}

impl Default for DataContext {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for DataContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataContext")
            .field("attached", &self.inner.is_some())
            .finish()
    }
}

/// Events published by a plan as it moves through its lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanEvent {
    StatusChanged {
        plan_id: PlanId,
        from: Status,
        to: Status,
    },
    BundleCompleted {
        plan_id: PlanId,
        bundle_id: BundleId,
        elapsed_ms: u64,
    },
    UnitFailed {
        plan_id: PlanId,
        unit: String,
        call: LifecycleCall,
        error: String,
    },
}
