use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stagerun_core::config::{AppConfig, SplitRequestConfig};
use stagerun_core::event::EventBus;
use stagerun_core::metrics::MetricStore;
use stagerun_core::types::{BundleId, DataContext, ExecContext, PlanEvent};
use stagerun_exec::units::{reference_pipeline, BundleIo};
use stagerun_exec::{MetricsSnapshot, Plan, SourceHandle};

/// Outcome of one bundle of the reference pipeline.
#[derive(Debug)]
pub struct BundleSummary {
    pub bundle_id: BundleId,
    pub input: usize,
    pub output: usize,
    pub split_at: Option<i64>,
}

/// Result of a full demo run.
#[derive(Debug)]
pub struct RunReport {
    pub plan: String,
    pub bundles: Vec<BundleSummary>,
    pub metrics: MetricsSnapshot,
}

/// Drive the reference pipeline through `config.demo.bundles` bundles and
/// tear it down.
///
/// A configured split request is issued from a separate task during the
/// first bundle, through the plan's source handle.
pub async fn run(config: &AppConfig, ctx: &ExecContext) -> anyhow::Result<RunReport> {
    config.validate()?;
    let demo = &config.demo;
    let bus = Arc::new(EventBus::new(config.plan.event_capacity));
    let events = tokio::spawn(log_events(bus.clone(), ctx.cancel_token().clone()));

    let mut plan = Plan::new(config.plan.plan_id(), reference_pipeline(demo.multiplier))?
        .with_event_bus(bus);
    info!(plan_id = %plan.id(), bundles = demo.bundles, elements = demo.elements, "Plan ready");
    debug!("{}", plan);

    let mut summaries = Vec::with_capacity(demo.bundles);
    let mut result = Ok(());
    for n in 0..demo.bundles {
        let bundle_id = BundleId::from(format!("bundle-{}", n + 1));
        // Bounded by `AppConfig::validate`, so the offsets fit in i64.
        let first = (n * demo.elements) as i64;
        let io = Arc::new(BundleIo::new((first..first + demo.elements as i64).collect()));

        let watcher = match (&demo.split, plan.source_handle()) {
            (Some(request), Some(handle)) if n == 0 => {
                let done = CancellationToken::new();
                let task = tokio::spawn(split_when_reached(handle, request.clone(), done.clone()));
                Some((task, done))
            }
            _ => None,
        };

        let store = Arc::new(MetricStore::new(bundle_id.as_str()));
        let executed = plan
            .execute(ctx, bundle_id.clone(), DataContext::from_arc(io.clone()), store)
            .await;

        let mut split_at = None;
        if let Some((task, done)) = watcher {
            done.cancel();
            match task.await {
                Ok(Some(offset)) => split_at = Some(offset),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Split task failed"),
            }
        }

        if let Err(e) = executed {
            result = Err(e);
            break;
        }
        summaries.push(BundleSummary {
            bundle_id,
            input: io.input().len(),
            output: io.output().len(),
            split_at,
        });
    }

    let metrics = plan.metrics();
    let teardown = plan.down(ctx).await;
    events.abort();

    result?;
    teardown?;
    Ok(RunReport {
        plan: plan.id().to_string(),
        bundles: summaries,
        metrics,
    })
}

/// Issue `request` once the source has emitted `at_element` elements (at
/// least one), unless `done` fires first.
async fn split_when_reached(
    handle: SourceHandle,
    request: SplitRequestConfig,
    done: CancellationToken,
) -> Option<i64> {
    let threshold = request.at_element.max(1) as i64;
    loop {
        match handle.progress() {
            Ok(progress) if progress.count >= threshold => {
                let points = request.points();
                return match handle.split(&points) {
                    Ok(offset) => {
                        info!(source = handle.id(), %points, offset, "Split accepted");
                        Some(offset)
                    }
                    Err(e) => {
                        warn!(source = handle.id(), %points, error = %e, "Split rejected");
                        None
                    }
                };
            }
            Ok(_) => {}
            Err(e) => {
                warn!(source = handle.id(), error = %e, "Source progress failed");
                return None;
            }
        }

        tokio::select! {
            _ = done.cancelled() => {
                debug!(source = handle.id(), "Bundle ended before split threshold");
                return None;
            }
            _ = tokio::time::sleep(Duration::from_micros(100)) => {}
        }
    }
}

async fn log_events(bus: Arc<EventBus>, cancel: CancellationToken) {
    let mut rx = bus.subscribe();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => event,
        };
        match event {
            Ok(PlanEvent::StatusChanged { plan_id, from, to }) => {
                debug!(plan_id = %plan_id, %from, %to, "Status changed");
            }
            Ok(PlanEvent::BundleCompleted {
                plan_id,
                bundle_id,
                elapsed_ms,
            }) => {
                info!(plan_id = %plan_id, bundle_id = %bundle_id, elapsed_ms, "Bundle completed");
            }
            Ok(PlanEvent::UnitFailed {
                plan_id,
                unit,
                call,
                error,
            }) => {
                warn!(plan_id = %plan_id, unit = %unit, %call, error = %error, "Unit failed");
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event log lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
