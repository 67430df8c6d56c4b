use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{BundleContext, DataContext, ExecContext, ProgressSnapshot};

/// Lifecycle contract every node of a compiled graph satisfies.
///
/// Optional capabilities are discovered once, when a plan is built, through
/// `as_root`, `as_source` and `stage_id`.
pub trait Unit: Send + Sync + 'static {
    /// Stable identifier of this unit within its plan.
    fn id(&self) -> &str;

    /// Bring the unit up. Called at most once per plan lifetime.
    fn up(&self, ctx: ExecContext) -> BoxFuture<'_, Result<()>>;

    /// Release resources. Called even when peers failed to come up.
    fn down(&self, ctx: ExecContext) -> BoxFuture<'_, Result<()>>;

    /// The root view of this unit, if it drives bundles directly.
    fn as_root(self: Arc<Self>) -> Option<Arc<dyn Root>> {
        None
    }

    /// The data source view of this unit, if it is the bundle's input boundary.
    fn as_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        None
    }

    /// External stage this unit is attributed to.
    fn stage_id(&self) -> Option<&str> {
        None
    }
}

/// A unit that participates directly in bundle execution.
pub trait Root: Unit {
    /// Prepare per-bundle state.
    fn start_bundle(&self, ctx: BundleContext, data: DataContext) -> BoxFuture<'_, Result<()>>;

    /// Move the bundle's elements through the graph reachable from this root.
    fn drive(&self, ctx: BundleContext) -> BoxFuture<'_, Result<()>>;

    /// Flush buffered state and finalize outputs for the bundle.
    fn finish_bundle(&self, ctx: BundleContext) -> BoxFuture<'_, Result<()>>;
}

/// The external input boundary of a bundle.
///
/// Both methods may be called while `Root::drive` is in flight on another
/// task; implementations synchronize their own cursor state.
pub trait DataSource: Unit {
    /// Current consumption count and the origin stage. Must not block.
    fn progress(&self) -> ProgressSnapshot;

    /// Offer candidate split offsets. Returns the offset of the first element
    /// of the residual, or an error when no candidate is eligible.
    fn split(&self, splits: &[i64], frac: f64) -> Result<i64>;
}
