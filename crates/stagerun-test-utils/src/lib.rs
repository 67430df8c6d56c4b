//! Scripted units and fixtures shared by stagerun tests.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;

use stagerun_core::error::{Result, StagerunError};
use stagerun_core::metrics::Labels;
use stagerun_core::traits::{DataSource, Root, Unit};
use stagerun_core::types::{
    BundleContext, DataContext, ExecContext, LifecycleCall, ProgressSnapshot,
};

/// Namespace used for metrics recorded by scripted units.
pub const TEST_NAMESPACE: &str = "test";

/// Shared, ordered record of lifecycle calls, as `"unit:Call"` entries.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, unit: &str, call: LifecycleCall) {
        self.lock().push(format!("{}:{}", unit, call));
    }

    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// How many times `unit` received `call`.
    pub fn count(&self, unit: &str, call: LifecycleCall) -> usize {
        let needle = format!("{}:{}", unit, call);
        self.lock().iter().filter(|e| **e == needle).count()
    }

    /// Units that received `call`, in call order.
    pub fn units_called(&self, call: LifecycleCall) -> Vec<String> {
        let suffix = format!(":{}", call);
        self.lock()
            .iter()
            .filter_map(|e| e.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What a scripted lifecycle call does.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok,
    /// Return `StagerunError::Unit` with this message.
    Fail(String),
    /// Return `StagerunError::Unavailable` with this message.
    Unavailable(String),
    /// Panic with this message while the call's future is polled.
    Panic(String),
}

/// A unit whose lifecycle calls are recorded and whose outcomes are scripted.
pub struct ScriptedUnit {
    id: String,
    stage: Option<String>,
    is_root: bool,
    log: CallLog,
    outcomes: HashMap<LifecycleCall, Outcome>,
    counter: Option<(String, i64)>,
}

impl ScriptedUnit {
    /// A plain (non-root) unit.
    pub fn new(id: impl Into<String>, log: &CallLog) -> Self {
        Self {
            id: id.into(),
            stage: None,
            is_root: false,
            log: log.clone(),
            outcomes: HashMap::new(),
            counter: None,
        }
    }

    /// A root unit.
    pub fn root(id: impl Into<String>, log: &CallLog) -> Self {
        Self {
            is_root: true,
            ..Self::new(id, log)
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_outcome(mut self, call: LifecycleCall, outcome: Outcome) -> Self {
        self.outcomes.insert(call, outcome);
        self
    }

    pub fn fail_on(self, call: LifecycleCall, message: impl Into<String>) -> Self {
        self.with_outcome(call, Outcome::Fail(message.into()))
    }

    pub fn panic_on(self, call: LifecycleCall, message: impl Into<String>) -> Self {
        self.with_outcome(call, Outcome::Panic(message.into()))
    }

    /// Add `delta` to counter `name` on every `drive`, attributed to this
    /// unit's stage (or its id when it has none).
    pub fn with_counter(mut self, name: impl Into<String>, delta: i64) -> Self {
        self.counter = Some((name.into(), delta));
        self
    }

    fn run(&self, call: LifecycleCall) -> BoxFuture<'_, Result<()>> {
        self.log.record(&self.id, call);
        let outcome = self.outcomes.get(&call).cloned().unwrap_or(Outcome::Ok);
        run_outcome(&self.id, outcome)
    }
}

fn run_outcome(unit: &str, outcome: Outcome) -> BoxFuture<'static, Result<()>> {
    let unit = unit.to_string();
    async move {
        match outcome {
            Outcome::Ok => Ok(()),
            Outcome::Fail(message) => Err(StagerunError::unit(unit, message)),
            Outcome::Unavailable(message) => Err(StagerunError::Unavailable(message)),
            Outcome::Panic(message) => panic!("{}", message),
        }
    }
    .boxed()
}

impl Unit for ScriptedUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn up(&self, _ctx: ExecContext) -> BoxFuture<'_, Result<()>> {
        self.run(LifecycleCall::Up)
    }

    fn down(&self, _ctx: ExecContext) -> BoxFuture<'_, Result<()>> {
        self.run(LifecycleCall::Down)
    }

    fn as_root(self: Arc<Self>) -> Option<Arc<dyn Root>> {
        if self.is_root {
            Some(self)
        } else {
            None
        }
    }

    fn stage_id(&self) -> Option<&str> {
        self.stage.as_deref()
    }
}

impl Root for ScriptedUnit {
    fn start_bundle(&self, _ctx: BundleContext, _data: DataContext) -> BoxFuture<'_, Result<()>> {
        self.run(LifecycleCall::StartBundle)
    }

    fn drive(&self, ctx: BundleContext) -> BoxFuture<'_, Result<()>> {
        if let Some((name, delta)) = &self.counter {
            let stage = self.stage.as_deref().unwrap_or(&self.id);
            ctx.metrics
                .inc_counter(&Labels::new(stage, TEST_NAMESPACE, name.as_str()), *delta);
        }
        self.run(LifecycleCall::Drive)
    }

    fn finish_bundle(&self, _ctx: BundleContext) -> BoxFuture<'_, Result<()>> {
        self.run(LifecycleCall::FinishBundle)
    }
}

type SplitFn = dyn Fn(&[i64], f64) -> Result<i64> + Send + Sync;

/// A root data source with programmable progress and split behavior.
pub struct ScriptedSource {
    id: String,
    stage: String,
    log: CallLog,
    progress: Mutex<ProgressSnapshot>,
    split_fn: Box<SplitFn>,
    split_requests: Mutex<Vec<(Vec<i64>, f64)>>,
    panics: HashMap<LifecycleCall, String>,
}

impl ScriptedSource {
    /// A source that rejects every split.
    pub fn new(id: impl Into<String>, stage: impl Into<String>, log: &CallLog) -> Self {
        let stage = stage.into();
        Self {
            id: id.into(),
            progress: Mutex::new(ProgressSnapshot {
                stage_id: stage.clone(),
                name: "out".to_string(),
                count: 0,
            }),
            stage,
            log: log.clone(),
            split_fn: Box::new(|splits, _| {
                Err(StagerunError::SplitRejected(format!(
                    "scripted source rejects {:?}",
                    splits
                )))
            }),
            split_requests: Mutex::new(Vec::new()),
            panics: HashMap::new(),
        }
    }

    /// Panic with `message` whenever `call` is made. Only `Split` and
    /// `Progress` are honored.
    pub fn panic_on(mut self, call: LifecycleCall, message: impl Into<String>) -> Self {
        self.panics.insert(call, message.into());
        self
    }

    pub fn with_split(
        mut self,
        f: impl Fn(&[i64], f64) -> Result<i64> + Send + Sync + 'static,
    ) -> Self {
        self.split_fn = Box::new(f);
        self
    }

    pub fn set_count(&self, count: i64) {
        lock(&self.progress).count = count;
    }

    /// Split requests received, in order.
    pub fn split_requests(&self) -> Vec<(Vec<i64>, f64)> {
        lock(&self.split_requests).clone()
    }

    fn record(&self, call: LifecycleCall) -> BoxFuture<'_, Result<()>> {
        self.log.record(&self.id, call);
        run_outcome(&self.id, Outcome::Ok)
    }
}

impl Unit for ScriptedSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn up(&self, _ctx: ExecContext) -> BoxFuture<'_, Result<()>> {
        self.record(LifecycleCall::Up)
    }

    fn down(&self, _ctx: ExecContext) -> BoxFuture<'_, Result<()>> {
        self.record(LifecycleCall::Down)
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

impl Root for ScriptedSource {
    fn start_bundle(&self, _ctx: BundleContext, _data: DataContext) -> BoxFuture<'_, Result<()>> {
        self.record(LifecycleCall::StartBundle)
    }

    fn drive(&self, _ctx: BundleContext) -> BoxFuture<'_, Result<()>> {
        self.record(LifecycleCall::Drive)
    }

    fn finish_bundle(&self, _ctx: BundleContext) -> BoxFuture<'_, Result<()>> {
        self.record(LifecycleCall::FinishBundle)
    }
}

impl DataSource for ScriptedSource {
    fn progress(&self) -> ProgressSnapshot {
        if let Some(message) = self.panics.get(&LifecycleCall::Progress) {
            panic!("{}", message);
        }
        lock(&self.progress).clone()
    }

    fn split(&self, splits: &[i64], frac: f64) -> Result<i64> {
        lock(&self.split_requests).push((splits.to_vec(), frac));
        if let Some(message) = self.panics.get(&LifecycleCall::Split) {
            panic!("{}", message);
        }
        (self.split_fn)(splits, frac)
    }
}

/// Write `contents` to a temporary `.toml` file that lives as long as the
/// returned handle.
pub fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    tmp.write_all(contents.as_bytes()).expect("write temp config");
    tmp
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
