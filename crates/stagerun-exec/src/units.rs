//! Reference units: an in-memory source, an element mapper and a collecting
//! sink. They wire a small linear graph used by the CLI and by tests that
//! exercise splits against a real cursor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use stagerun_core::error::{Result, StagerunError};
use stagerun_core::metrics::Labels;
use stagerun_core::traits::{DataSource, Root, Unit};
use stagerun_core::types::{BundleContext, DataContext, ExecContext, ProgressSnapshot};

/// Namespace for metrics recorded by the reference units.
pub const METRICS_NAMESPACE: &str = "stagerun";

/// Transport for one bundle of the reference pipeline: the input elements
/// and the buffer the sink commits its output to.
#[derive(Debug, Default)]
pub struct BundleIo {
    input: Vec<i64>,
    output: Mutex<Vec<i64>>,
}

impl BundleIo {
    pub fn new(input: Vec<i64>) -> Self {
        Self {
            input,
            output: Mutex::new(Vec::new()),
        }
    }

    pub fn input(&self) -> &[i64] {
        &self.input
    }

    /// Elements committed by the sink so far.
    pub fn output(&self) -> Vec<i64> {
        lock(&self.output).clone()
    }
}

/// A graph node fed by an upstream unit during a bundle.
pub trait Consumer: Unit {
    fn start_bundle(&self, ctx: &BundleContext, data: &DataContext) -> Result<()>;

    fn process_element(&self, ctx: &BundleContext, element: i64) -> Result<()>;

    fn finish_bundle(&self, ctx: &BundleContext) -> Result<()>;
}

#[derive(Debug, Default)]
struct Cursor {
    input: Vec<i64>,
    consumed: i64,
    stop: i64,
}

/// Root and data source: emits the bundle's input elements downstream, one
/// at a time, honoring split requests that arrive mid-bundle.
pub struct VecSource {
    id: String,
    stage: String,
    output: String,
    out: Arc<dyn Consumer>,
    cursor: Mutex<Cursor>,
    ready: AtomicBool,
}

impl VecSource {
    pub fn new(id: impl Into<String>, stage: impl Into<String>, out: Arc<dyn Consumer>) -> Self {
        Self {
            id: id.into(),
            stage: stage.into(),
            output: "out".to_string(),
            out,
            cursor: Mutex::new(Cursor::default()),
            ready: AtomicBool::new(false),
        }
    }

    /// Next element to emit, or `None` once the stop offset is reached.
    fn next_element(&self) -> Option<i64> {
        let mut cursor = lock(&self.cursor);
        if cursor.consumed >= cursor.stop {
            return None;
        }
        let element = cursor.input[cursor.consumed as usize];
        cursor.consumed += 1;
        Some(element)
    }
}

impl Unit for VecSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn up(&self, _ctx: ExecContext) -> BoxFuture<'_, Result<()>> {
        self.ready.store(true, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }

    fn down(&self, _ctx: ExecContext) -> BoxFuture<'_, Result<()>> {
        self.ready.store(false, Ordering::SeqCst);
        *lock(&self.cursor) = Cursor::default();
        async { Ok(()) }.boxed()
    }

    fn as_root(self: Arc<Self>) -> Option<Arc<dyn Root>> {
        Some(self)
    }

    fn as_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        Some(self)
    }

    fn stage_id(&self) -> Option<&str> {
        Some(&self.stage)
    }
}

impl Root for VecSource {
    fn start_bundle(&self, ctx: BundleContext, data: DataContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.ready.load(Ordering::SeqCst) {
                return Err(StagerunError::Unavailable(format!("{} is not up", self.id)));
            }
            let io = data.get::<BundleIo>().ok_or_else(|| StagerunError::InvalidBundle {
                bundle: ctx.bundle_id.to_string(),
                reason: "data context carries no bundle input".into(),
            })?;

            {
                let mut cursor = lock(&self.cursor);
                cursor.input = io.input().to_vec();
                cursor.consumed = 0;
                cursor.stop = cursor.input.len() as i64;
            }
            self.out.start_bundle(&ctx, &data)
        })
    }

    fn drive(&self, ctx: BundleContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            while let Some(element) = self.next_element() {
                if ctx.is_cancelled() {
                    return Err(StagerunError::Cancelled);
                }
                self.out.process_element(&ctx, element)?;
                // Give split and progress requests a chance to interleave.
                tokio::task::yield_now().await;
            }
            let emitted = lock(&self.cursor).consumed;
            debug!(unit = %self.id, bundle_id = %ctx.bundle_id, emitted, "Source drained");
            Ok(())
        })
    }

    fn finish_bundle(&self, ctx: BundleContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.out.finish_bundle(&ctx) })
    }
}

impl DataSource for VecSource {
    fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stage_id: self.stage.clone(),
            name: self.output.clone(),
            count: lock(&self.cursor).consumed,
        }
    }

    fn split(&self, splits: &[i64], _frac: f64) -> Result<i64> {
        if splits.is_empty() {
            return Err(StagerunError::SplitRejected(
                "requested splits were empty".into(),
            ));
        }

        let mut cursor = lock(&self.cursor);
        // The smallest eligible offset that has not been emitted yet becomes
        // the new stop.
        for &s in splits {
            if s > 0 && s >= cursor.consumed && s < cursor.stop {
                cursor.stop = s;
                return Ok(s);
            }
        }
        Err(StagerunError::SplitRejected(format!(
            "no eligible offset in {:?}, source {} at index {} of {}",
            splits, self.id, cursor.consumed, cursor.stop
        )))
    }
}

/// Multiplies every element and forwards it, counting what it saw.
pub struct MapElements {
    id: String,
    stage: String,
    factor: i64,
    out: Arc<dyn Consumer>,
}

impl MapElements {
    pub fn new(
        id: impl Into<String>,
        stage: impl Into<String>,
        factor: i64,
        out: Arc<dyn Consumer>,
    ) -> Self {
        Self {
            id: id.into(),
            stage: stage.into(),
            factor,
            out,
        }
    }
}

impl Unit for MapElements {
    fn id(&self) -> &str {
        &self.id
    }

    fn up(&self, _ctx: ExecContext) -> BoxFuture<'_, Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn down(&self, _ctx: ExecContext) -> BoxFuture<'_, Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn stage_id(&self) -> Option<&str> {
        Some(&self.stage)
    }
}

impl Consumer for MapElements {
    fn start_bundle(&self, ctx: &BundleContext, data: &DataContext) -> Result<()> {
        self.out.start_bundle(ctx, data)
    }

    fn process_element(&self, ctx: &BundleContext, element: i64) -> Result<()> {
        let mapped = element.checked_mul(self.factor).ok_or_else(|| {
            StagerunError::unit(&self.id, format!("{} * {} overflows", element, self.factor))
        })?;
        ctx.metrics.inc_counter(
            &Labels::new(&self.stage, METRICS_NAMESPACE, "elements"),
            1,
        );
        self.out.process_element(ctx, mapped)
    }

    fn finish_bundle(&self, ctx: &BundleContext) -> Result<()> {
        self.out.finish_bundle(ctx)
    }
}

/// Buffers elements for the bundle and commits them to the bundle's output
/// on finish.
pub struct CollectSink {
    id: String,
    stage: String,
    buffer: Mutex<Vec<i64>>,
    data: Mutex<Option<DataContext>>,
}

impl CollectSink {
    pub fn new(id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage: stage.into(),
            buffer: Mutex::new(Vec::new()),
            data: Mutex::new(None),
        }
    }
}

impl Unit for CollectSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn up(&self, _ctx: ExecContext) -> BoxFuture<'_, Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn down(&self, _ctx: ExecContext) -> BoxFuture<'_, Result<()>> {
        lock(&self.buffer).clear();
        *lock(&self.data) = None;
        async { Ok(()) }.boxed()
    }

    fn stage_id(&self) -> Option<&str> {
        Some(&self.stage)
    }
}

impl Consumer for CollectSink {
    fn start_bundle(&self, _ctx: &BundleContext, data: &DataContext) -> Result<()> {
        lock(&self.buffer).clear();
        *lock(&self.data) = Some(data.clone());
        Ok(())
    }

    fn process_element(&self, ctx: &BundleContext, element: i64) -> Result<()> {
        ctx.metrics
            .update_distribution(&Labels::new(&self.stage, METRICS_NAMESPACE, "value"), element);
        lock(&self.buffer).push(element);
        Ok(())
    }

    fn finish_bundle(&self, ctx: &BundleContext) -> Result<()> {
        let data = lock(&self.data).take();
        let io = data
            .as_ref()
            .and_then(|d| d.get::<BundleIo>())
            .ok_or_else(|| StagerunError::unit(&self.id, "finish without a started bundle"))?;

        let buffered = std::mem::take(&mut *lock(&self.buffer));
        ctx.metrics.set_gauge(
            &Labels::new(&self.stage, METRICS_NAMESPACE, "committed"),
            buffered.len() as i64,
        );
        lock(&io.output).extend(buffered);
        Ok(())
    }
}

/// Unit ids of the pipeline built by `reference_pipeline`.
pub const SOURCE_UNIT: &str = "read";
pub const MAP_UNIT: &str = "map";
pub const SINK_UNIT: &str = "write";

/// Build `read -> map(x * factor) -> write`, in unit order.
pub fn reference_pipeline(factor: i64) -> Vec<Arc<dyn Unit>> {
    let sink = Arc::new(CollectSink::new(SINK_UNIT, "Write"));
    let map = Arc::new(MapElements::new(MAP_UNIT, "Map", factor, sink.clone()));
    let read = Arc::new(VecSource::new(SOURCE_UNIT, "Read", map.clone()));
    vec![read as Arc<dyn Unit>, map, sink]
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
