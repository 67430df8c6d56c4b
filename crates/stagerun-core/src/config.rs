use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, StagerunError};
use crate::types::{PlanId, SplitPoints};

/// Top-level stagerun configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub plan: PlanConfig,
    #[serde(default)]
    pub demo: DemoConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Plan identifier. Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Capacity of the plan event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            id: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl PlanConfig {
    pub fn plan_id(&self) -> PlanId {
        match &self.id {
            Some(id) => PlanId::from(id.as_str()),
            None => PlanId::new(),
        }
    }
}

/// Reference pipeline run by the `run` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Elements fed to the source per bundle.
    #[serde(default = "default_elements")]
    pub elements: usize,
    /// Number of bundles to execute before tearing the plan down.
    #[serde(default = "default_bundles")]
    pub bundles: usize,
    /// Factor applied by the map stage.
    #[serde(default = "default_multiplier")]
    pub multiplier: i64,
    /// Split request issued while the first bundle is being driven.
    #[serde(default)]
    pub split: Option<SplitRequestConfig>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            elements: default_elements(),
            bundles: default_bundles(),
            multiplier: default_multiplier(),
            split: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitRequestConfig {
    /// Element index at which the request is issued.
    #[serde(default)]
    pub at_element: usize,
    pub offsets: Vec<i64>,
    #[serde(default = "default_fraction")]
    pub fraction: f64,
}

impl SplitRequestConfig {
    pub fn points(&self) -> SplitPoints {
        SplitPoints::new(self.offsets.clone(), self.fraction)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default)]
    pub filter: Option<String>,
}

/// Upper bound on `demo.elements`.
pub const MAX_DEMO_ELEMENTS: usize = 10_000_000;
/// Upper bound on `demo.bundles`.
pub const MAX_DEMO_BUNDLES: usize = 100_000;

fn default_event_capacity() -> usize { 256 }
fn default_elements() -> usize { 100 }
fn default_bundles() -> usize { 3 }
fn default_multiplier() -> i64 { 2 }
fn default_fraction() -> f64 { 0.5 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StagerunError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StagerunError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges. Called by `parse`; call again after overriding
    /// fields in code.
    pub fn validate(&self) -> Result<()> {
        if self.demo.elements > MAX_DEMO_ELEMENTS {
            return Err(StagerunError::Config(format!(
                "demo.elements must be at most {}, got {}",
                MAX_DEMO_ELEMENTS, self.demo.elements
            )));
        }
        if self.demo.bundles > MAX_DEMO_BUNDLES {
            return Err(StagerunError::Config(format!(
                "demo.bundles must be at most {}, got {}",
                MAX_DEMO_BUNDLES, self.demo.bundles
            )));
        }
        if let Some(split) = &self.demo.split {
            if !(0.0..=1.0).contains(&split.fraction) {
                return Err(StagerunError::Config(format!(
                    "demo.split.fraction must be within [0, 1], got {}",
                    split.fraction
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
