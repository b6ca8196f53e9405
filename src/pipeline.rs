use crate::cancel::CancelToken;
use crate::config::{PipelineConfig, StageConfig};
use crate::error::{PipelineError, Result};
use crate::stage::{PipelineStage, StageReport};
use crate::task::Task;
use std::collections::HashSet;
use tracing::{debug, info};

/// A connection between two named ports
#[derive(Debug, Clone)]
struct Link {
    producer: String,
    output: String,
    consumer: String,
    input: String,
}

/// Builder for wiring stages into a pipeline
pub struct PipelineBuilder {
    config: PipelineConfig,
    stages: Vec<PipelineStage>,
    links: Vec<Link>,
    error: Option<PipelineError>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            stages: Vec::new(),
            links: Vec::new(),
            error: None,
        }
    }

    /// Settings used by later `add_stage` calls
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a stage configured from the pipeline config under the task's name
    pub fn add_stage<T: Task + Clone>(self, task: T) -> Self {
        let config = self.config.stage(task.name());
        self.add_stage_with(task, config)
    }

    /// Add a stage with explicit settings
    pub fn add_stage_with<T: Task + Clone>(mut self, task: T, config: StageConfig) -> Self {
        if self.error.is_none() {
            match PipelineStage::new(task, config) {
                Ok(stage) => self.stages.push(stage),
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    /// Feed `consumer.input` from `producer.output`
    pub fn connect(
        mut self,
        producer: impl Into<String>,
        output: impl Into<String>,
        consumer: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        self.links.push(Link {
            producer: producer.into(),
            output: output.into(),
            consumer: consumer.into(),
            input: input.into(),
        });
        self
    }

    /// Validate names and bind every link
    pub fn build(mut self) -> Result<Pipeline> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }

        {
            let mut names = HashSet::new();
            for stage in &self.stages {
                if !names.insert(stage.name()) {
                    return Err(PipelineError::DuplicateStage(stage.name().to_string()));
                }
            }
        }

        let mut stages = self.stages;
        for link in &self.links {
            let consumer = position(&stages, &link.consumer)?;
            let producer = position(&stages, &link.producer)?;
            let (consumer, producer) = pair_mut(&mut stages, consumer, producer)?;
            consumer.bind(&link.input, producer, &link.output)?;
        }

        debug!(stages = stages.len(), links = self.links.len(), "pipeline built");
        Ok(Pipeline { stages })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn position(stages: &[PipelineStage], name: &str) -> Result<usize> {
    stages
        .iter()
        .position(|s| s.name() == name)
        .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
}

/// Two distinct stages borrowed mutably at once
fn pair_mut(
    stages: &mut [PipelineStage],
    a: usize,
    b: usize,
) -> Result<(&mut PipelineStage, &mut PipelineStage)> {
    if a == b {
        return Err(PipelineError::ConfigError(format!(
            "stage '{}' cannot feed itself",
            stages[a].name()
        )));
    }
    if a < b {
        let (left, right) = stages.split_at_mut(b);
        Ok((&mut left[a], &mut right[0]))
    } else {
        let (left, right) = stages.split_at_mut(a);
        Ok((&mut right[0], &mut left[b]))
    }
}

/// A wired set of stages, idle between runs
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn stage(&self, name: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Start every stage under a fresh cancel token.
    ///
    /// A pipeline handed back by [`RunningPipeline::wait`] must be
    /// [`reset`](Self::reset) first, otherwise this fails with
    /// [`PipelineError::NotReset`].
    pub fn start(mut self) -> Result<RunningPipeline> {
        for stage in &self.stages {
            stage.check_ready()?;
        }

        let cancel = CancelToken::new();
        // Consumers first so producers never wait on a stage that is not up yet.
        for idx in (0..self.stages.len()).rev() {
            if let Err(e) = self.stages[idx].spawn(&cancel) {
                cancel.cancel();
                for stage in &mut self.stages {
                    stage.stop();
                    let _ = stage.join();
                }
                return Err(e);
            }
        }
        info!(stages = self.stages.len(), "pipeline started");
        Ok(RunningPipeline {
            pipeline: self,
            cancel,
        })
    }

    /// Empty all buffers so the pipeline can be started again
    pub fn reset(&mut self) -> Result<()> {
        for stage in &mut self.stages {
            stage.reset()?;
        }
        Ok(())
    }

    pub fn report(&self) -> Vec<StageReport> {
        self.stages.iter().map(PipelineStage::report).collect()
    }

    pub fn metrics_summary(&self) -> String {
        let mut summary = String::from("Pipeline Metrics Summary:\n");
        for stage in &self.stages {
            summary.push_str(&format!("  {}: {}\n", stage.name(), stage.metrics().snapshot()));
        }
        summary
    }
}

/// A pipeline whose workers are alive
pub struct RunningPipeline {
    pipeline: Pipeline,
    cancel: CancelToken,
}

impl RunningPipeline {
    /// Token that ends this run when cancelled
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stage(&self, name: &str) -> Option<&PipelineStage> {
        self.pipeline.stage(name)
    }

    pub fn report(&self) -> Vec<StageReport> {
        self.pipeline.report()
    }

    /// Wait until a task or the caller cancels the run, then hand the
    /// pipeline back. The first stage error wins.
    pub fn wait(mut self) -> Result<Pipeline> {
        let mut first_err = None;
        for stage in &mut self.pipeline.stages {
            if let Err(e) = stage.join() {
                first_err.get_or_insert(e);
            }
        }
        info!("pipeline stopped");
        match first_err {
            Some(e) => Err(e),
            None => Ok(self.pipeline),
        }
    }

    /// Cancel the run and wait for every worker
    pub fn shutdown(self) -> Result<Pipeline> {
        self.cancel.cancel();
        self.wait()
    }
}
