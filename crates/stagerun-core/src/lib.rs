pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, StagerunError};
pub use event::EventBus;
pub use metrics::{Extractor, Labels, MetricStore};
pub use traits::{DataSource, Root, Unit};
pub use types::*;
