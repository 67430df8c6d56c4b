//! Fault-containment boundary around unit lifecycle calls.
//!
//! Every call into stage-defined logic goes through `call_guarded` (or
//! `call_guarded_sync` for the non-async source methods). A panic raised
//! while building the call's future, or while polling it, is caught and
//! returned as `StagerunError::Panicked` so the plan's state machine always
//! sees an ordinary `Result`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use futures::future::BoxFuture;
use futures::FutureExt;

use stagerun_core::error::{Result, StagerunError};
use stagerun_core::types::LifecycleCall;

/// Run one async lifecycle call behind the panic boundary.
///
/// Ordinary failures are wrapped with the call and unit for context.
pub(crate) async fn call_guarded<'a, F>(call: LifecycleCall, unit: &str, invoke: F) -> Result<()>
where
    F: FnOnce() -> BoxFuture<'a, Result<()>>,
{
    let fut = match panic::catch_unwind(AssertUnwindSafe(invoke)) {
        Ok(fut) => fut,
        Err(payload) => return Err(panicked(call, unit, payload)),
    };

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(StagerunError::Lifecycle {
            call,
            unit: unit.to_string(),
            source: Box::new(source),
        }),
        Err(payload) => Err(panicked(call, unit, payload)),
    }
}

/// Run one synchronous call behind the panic boundary.
///
/// The call's own value or error is returned unchanged.
pub(crate) fn call_guarded_sync<T, F>(call: LifecycleCall, unit: &str, invoke: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    panic::catch_unwind(AssertUnwindSafe(invoke))
        .unwrap_or_else(|payload| Err(panicked(call, unit, payload)))
}

fn panicked(call: LifecycleCall, unit: &str, payload: Box<dyn Any + Send>) -> StagerunError {
    StagerunError::Panicked {
        call,
        unit: unit.to_string(),
        message: panic_message(payload.as_ref()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
