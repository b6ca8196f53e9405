use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// How workers wait on a buffer that is not ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    /// Retry the non-blocking call with an escalating backoff
    #[default]
    Spin,
    /// Park on the buffer's condition variable
    Block,
}

/// Per-stage settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Worker threads, each with its own task clone
    pub threads: usize,
    /// Ring slots per output edge
    pub buffer_capacity: usize,
    pub wait: WaitStrategy,
}

impl StageConfig {
    pub const DEFAULT_THREADS: usize = 1;
    pub const DEFAULT_CAPACITY: usize = 8;

    pub fn new(threads: usize, buffer_capacity: usize) -> Self {
        Self {
            threads,
            buffer_capacity,
            wait: WaitStrategy::default(),
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    pub fn with_wait(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(PipelineError::InvalidThreadCount(self.threads));
        }
        if self.buffer_capacity == 0 {
            return Err(PipelineError::InvalidCapacity(self.buffer_capacity));
        }
        Ok(())
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THREADS, Self::DEFAULT_CAPACITY)
    }
}

/// Settings for a whole pipeline: shared defaults plus per-stage overrides
/// keyed by stage name.
///
/// ```toml
/// [defaults]
/// buffer_capacity = 16
///
/// [stages.decoder]
/// threads = 4
/// wait = "block"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub defaults: StageConfig,
    pub stages: HashMap<String, StageConfig>,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| PipelineError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::ConfigError(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Settings for the stage called `name`
    pub fn stage(&self, name: &str) -> StageConfig {
        self.stages.get(name).copied().unwrap_or(self.defaults)
    }

    pub fn with_stage(mut self, name: impl Into<String>, config: StageConfig) -> Self {
        self.stages.insert(name.into(), config);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.defaults.validate()?;
        for config in self.stages.values() {
            config.validate()?;
        }
        Ok(())
    }
}
