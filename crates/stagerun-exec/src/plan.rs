use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use stagerun_core::error::{Result, StagerunError};
use stagerun_core::event::EventBus;
use stagerun_core::metrics::MetricStore;
use stagerun_core::traits::{DataSource, Root, Unit};
use stagerun_core::types::{
    BundleContext, BundleId, DataContext, ExecContext, LifecycleCall, PlanEvent, PlanId,
    ProgressSnapshot, SplitPoints, Status,
};

use crate::guard::{call_guarded, call_guarded_sync};
use crate::report::MetricsSnapshot;

/// Bundle execution plan.
///
/// Built once from a compiled graph fragment and reused for many bundles,
/// one at a time. `execute` and `down` take `&mut self`, so a plan has a
/// single driver at any moment; hand it to another thread by moving it.
/// Once any lifecycle or bundle call fails the plan is `Broken` for good
/// and should be discarded after `down`.
pub struct Plan {
    id: PlanId,
    units: Vec<Arc<dyn Unit>>,
    roots: Vec<Arc<dyn Root>>,
    stage_ids: Vec<String>,
    // Only one source per plan is tracked; split and progress attribution
    // assume zero or one.
    source: Option<Arc<dyn DataSource>>,
    status: Status,
    store: Option<Arc<MetricStore>>,
    event_bus: Option<Arc<EventBus>>,
}

impl Plan {
    /// Create a plan from `units`. Roots execute in the order they appear.
    ///
    /// Fails when no unit is root-capable.
    pub fn new(id: impl Into<PlanId>, units: Vec<Arc<dyn Unit>>) -> Result<Self> {
        let id = id.into();
        let mut roots = Vec::new();
        let mut source: Option<Arc<dyn DataSource>> = None;
        let mut stage_ids = Vec::new();

        for unit in &units {
            if let Some(root) = unit.clone().as_root() {
                roots.push(root);
            }
            if let Some(s) = unit.clone().as_source() {
                if let Some(previous) = &source {
                    warn!(
                        plan_id = %id,
                        replaced = previous.id(),
                        unit = s.id(),
                        "Plan has more than one data source, tracking the last"
                    );
                }
                source = Some(s);
            }
            if let Some(stage) = unit.stage_id() {
                stage_ids.push(stage.to_string());
            }
        }

        if roots.is_empty() {
            return Err(StagerunError::Construction(format!(
                "plan {} has no root units",
                id
            )));
        }

        debug!(
            plan_id = %id,
            units = units.len(),
            roots = roots.len(),
            has_source = source.is_some(),
            "Plan constructed"
        );

        Ok(Self {
            id,
            units,
            roots,
            stage_ids,
            source,
            status: Status::Initializing,
            store: None,
            event_bus: None,
        })
    }

    /// Publish lifecycle events to `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// The plan identifier.
    pub fn id(&self) -> &PlanId {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn units(&self) -> &[Arc<dyn Unit>] {
        &self.units
    }

    /// Stage ids of every stage-identified unit, in unit order.
    pub fn stage_ids(&self) -> &[String] {
        &self.stage_ids
    }

    /// Origin stage of the tracked data source.
    pub fn source_stage_id(&self) -> Option<&str> {
        self.source.as_ref().and_then(|s| s.stage_id())
    }

    /// A handle for issuing split and progress requests while a bundle is
    /// being executed on another task.
    pub fn source_handle(&self) -> Option<SourceHandle> {
        self.source.clone().map(|source| SourceHandle { source })
    }

    /// Store of the most recent `execute` call.
    pub fn metrics_store(&self) -> Option<&Arc<MetricStore>> {
        self.store.as_ref()
    }

    /// Execute one bundle. Units are brought up on the first call.
    ///
    /// Roots run `start_bundle`, then `drive`, then `finish_bundle`, each
    /// phase over all roots in order. The first failure marks the plan
    /// `Broken` and is returned; nothing after it runs. Never panics.
    pub async fn execute(
        &mut self,
        ctx: &ExecContext,
        bundle_id: impl Into<BundleId>,
        data: DataContext,
        metrics: Arc<MetricStore>,
    ) -> Result<()> {
        let bundle_id = bundle_id.into();
        self.store = Some(metrics.clone());

        if self.status == Status::Initializing {
            info!(plan_id = %self.id, units = self.units.len(), "Bringing plan up");
            if let Err(e) = bring_up(&self.units, ctx).await {
                return Err(self.fail(e));
            }
            self.set_status(Status::Up);
        }

        if self.status != Status::Up {
            return Err(StagerunError::InvalidStatus {
                plan: self.id.clone(),
                status: self.status,
            });
        }

        self.set_status(Status::Active);
        let bundle_ctx = BundleContext {
            exec: ctx.clone(),
            plan_id: self.id.clone(),
            bundle_id: bundle_id.clone(),
            metrics,
        };

        let start = Instant::now();
        if let Err(e) = run_bundle(&self.roots, &bundle_ctx, &data).await {
            return Err(self.fail(e));
        }
        let elapsed_ms = start.elapsed().as_millis() as u64;

        self.set_status(Status::Up);
        debug!(plan_id = %self.id, bundle_id = %bundle_id, elapsed_ms, "Bundle complete");
        self.publish(PlanEvent::BundleCompleted {
            plan_id: self.id.clone(),
            bundle_id,
            elapsed_ms,
        });
        Ok(())
    }

    /// Take the plan and all of its units down. Never panics.
    ///
    /// Every unit is torn down even when some fail; failures are aggregated.
    /// Calling `down` again is a no-op.
    pub async fn down(&mut self, ctx: &ExecContext) -> Result<()> {
        if self.status == Status::Down {
            return Ok(()); // ok: already down
        }
        self.set_status(Status::Down);
        info!(plan_id = %self.id, units = self.units.len(), "Tearing plan down");

        let mut errs = Vec::new();
        for unit in &self.units {
            let result =
                call_guarded(LifecycleCall::Down, unit.id(), || unit.down(ctx.clone())).await;
            if let Err(e) = result {
                warn!(plan_id = %self.id, unit = unit.id(), error = %e, "Unit tear-down failed");
                self.publish_failure(&e);
                errs.push(e);
            }
        }

        match errs.len() {
            0 => Ok(()),
            1 => Err(StagerunError::Teardown {
                plan: self.id.clone(),
                source: Box::new(errs.remove(0)),
            }),
            _ => Err(StagerunError::TeardownMany {
                plan: self.id.clone(),
                errors: errs,
            }),
        }
    }

    /// Offer split points to the tracked data source.
    ///
    /// Returns the offset of the first residual element exactly as the
    /// source reports it.
    pub fn split(&self, points: &SplitPoints) -> Result<i64> {
        match &self.source {
            Some(source) => split_source(source.as_ref(), points),
            None => Err(StagerunError::SourceNotInitialized {
                points: points.clone(),
            }),
        }
    }

    /// Snapshot of source progress and the metrics recorded by the most
    /// recent bundle, keyed by stage.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();

        if let Some(source) = &self.source {
            match source_progress(source.as_ref()) {
                Ok(progress) => snapshot.record_progress(progress),
                Err(e) => warn!(plan_id = %self.id, error = %e, "Source progress unavailable"),
            }
        }
        if let Some(store) = &self.store {
            snapshot.record_store(store);
        }
        snapshot
    }

    fn set_status(&mut self, to: Status) {
        let from = self.status;
        if from == to {
            return;
        }
        self.status = to;
        self.publish(PlanEvent::StatusChanged {
            plan_id: self.id.clone(),
            from,
            to,
        });
    }

    fn fail(&mut self, err: StagerunError) -> StagerunError {
        error!(plan_id = %self.id, status = %self.status, error = %err, "Plan failed");
        self.publish_failure(&err);
        self.set_status(Status::Broken);
        err
    }

    fn publish_failure(&self, err: &StagerunError) {
        let (unit, call) = match err {
            StagerunError::Lifecycle { unit, call, .. }
            | StagerunError::Panicked { unit, call, .. } => (unit.clone(), *call),
            _ => return,
        };
        self.publish(PlanEvent::UnitFailed {
            plan_id: self.id.clone(),
            unit,
            call,
            error: err.to_string(),
        });
    }

    fn publish(&self, event: PlanEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("units", &self.units.len())
            .field("roots", &self.roots.len())
            .field("source", &self.source.as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Plan[{}]:", self.id)?;
        for unit in &self.units {
            let mut caps = Vec::new();
            if self.roots.iter().any(|r| r.id() == unit.id()) {
                caps.push("root");
            }
            if self.source.as_ref().is_some_and(|s| s.id() == unit.id()) {
                caps.push("source");
            }
            write!(f, "\n{}", unit.id())?;
            if let Some(stage) = unit.stage_id() {
                write!(f, " (stage {})", stage)?;
            }
            if !caps.is_empty() {
                write!(f, " [{}]", caps.join(", "))?;
            }
        }
        Ok(())
    }
}

/// Cloneable access to a plan's data source, safe to use from a controller
/// task while the plan is driving a bundle.
#[derive(Clone)]
pub struct SourceHandle {
    source: Arc<dyn DataSource>,
}

impl SourceHandle {
    pub fn id(&self) -> &str {
        self.source.id()
    }

    pub fn stage_id(&self) -> Option<&str> {
        self.source.stage_id()
    }

    pub fn split(&self, points: &SplitPoints) -> Result<i64> {
        split_source(self.source.as_ref(), points)
    }

    pub fn progress(&self) -> Result<ProgressSnapshot> {
        source_progress(self.source.as_ref())
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("source", &self.source.id())
            .finish()
    }
}

fn split_source(source: &dyn DataSource, points: &SplitPoints) -> Result<i64> {
    call_guarded_sync(LifecycleCall::Split, source.id(), || {
        source.split(&points.splits, points.frac)
    })
}

fn source_progress(source: &dyn DataSource) -> Result<ProgressSnapshot> {
    call_guarded_sync(LifecycleCall::Progress, source.id(), || Ok(source.progress()))
}

async fn bring_up(units: &[Arc<dyn Unit>], ctx: &ExecContext) -> Result<()> {
    for unit in units {
        call_guarded(LifecycleCall::Up, unit.id(), || unit.up(ctx.clone())).await?;
    }
    Ok(())
}

async fn run_bundle(
    roots: &[Arc<dyn Root>],
    ctx: &BundleContext,
    data: &DataContext,
) -> Result<()> {
    for root in roots {
        call_guarded(LifecycleCall::StartBundle, root.id(), || {
            root.start_bundle(ctx.clone(), data.clone())
        })
        .await?;
    }
    debug!(plan_id = %ctx.plan_id, bundle_id = %ctx.bundle_id, "Bundle started");

    for root in roots {
        call_guarded(LifecycleCall::Drive, root.id(), || root.drive(ctx.clone())).await?;
    }
    debug!(plan_id = %ctx.plan_id, bundle_id = %ctx.bundle_id, "Bundle driven");

    for root in roots {
        call_guarded(LifecycleCall::FinishBundle, root.id(), || {
            root.finish_bundle(ctx.clone())
        })
        .await?;
    }
    Ok(())
}
