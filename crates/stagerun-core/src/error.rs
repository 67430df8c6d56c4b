use thiserror::Error;

use crate::types::{LifecycleCall, PlanId, SplitPoints, Status};

#[derive(Debug, Error)]
pub enum StagerunError {
    // Construction errors
    #[error("Invalid plan: {0}")]
    Construction(String),

    // Plan state errors
    #[error("invalid status for plan {plan}: {status}")]
    InvalidStatus { plan: PlanId, status: Status },

    // Lifecycle errors
    #[error("{call} failed for unit {unit}: {source}")]
    Lifecycle {
        call: LifecycleCall,
        unit: String,
        #[source]
        source: Box<StagerunError>,
    },

    #[error("{call} panicked in unit {unit}: {message}")]
    Panicked {
        call: LifecycleCall,
        unit: String,
        message: String,
    },

    // Tear-down errors
    #[error("plan {plan} failed: {source}")]
    Teardown {
        plan: PlanId,
        #[source]
        source: Box<StagerunError>,
    },

    #[error("plan {plan} failed with multiple errors: [{}]", join_errors(.errors))]
    TeardownMany {
        plan: PlanId,
        errors: Vec<StagerunError>,
    },

    // Split errors
    #[error("failed to split at requested splits: {points}, source not initialized")]
    SourceNotInitialized { points: SplitPoints },

    #[error("Split rejected: {0}")]
    SplitRejected(String),

    // Unit-raised errors
    #[error("Unit unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid bundle {bundle}: {reason}")]
    InvalidBundle { bundle: String, reason: String },

    #[error("Unit error: {unit}: {message}")]
    Unit { unit: String, message: String },

    #[error("Cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StagerunError {
    /// Shorthand for a failure raised by stage-specific logic.
    pub fn unit(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unit {
            unit: unit.into(),
            message: message.into(),
        }
    }

    /// Whether this error was produced by the fault-containment boundary
    /// catching a panic, either directly or as the cause of a tear-down failure.
    pub fn is_panic(&self) -> bool {
        match self {
            Self::Panicked { .. } => true,
            Self::Teardown { source, .. } => source.is_panic(),
            _ => false,
        }
    }
}

fn join_errors(errors: &[StagerunError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, StagerunError>;
