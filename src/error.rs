use crate::port::Direction;
use crate::scalar::ScalarKind;
use thiserror::Error;

/// Result type for buffered pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while wiring or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// No port with this name on the stage
    #[error("No port named '{port}' on stage '{stage}'")]
    UnknownPort { stage: String, port: String },

    /// Ports carry different scalar kinds
    #[error("Cannot bind input of kind {input} to output of kind {output}")]
    KindMismatch { input: ScalarKind, output: ScalarKind },

    /// Staging record accessed with the wrong element type
    #[error("Port '{port}' carries {actual}, accessed as {requested}")]
    PortKind {
        port: String,
        actual: ScalarKind,
        requested: ScalarKind,
    },

    /// Ports carry records of different widths
    #[error("Cannot bind input of {input} elements to output of {output} elements")]
    LengthMismatch { input: usize, output: usize },

    /// Port cannot play the requested role in a binding
    #[error("Port '{port}' is {direction} and cannot be used as {role}")]
    WrongDirection {
        port: String,
        direction: Direction,
        role: &'static str,
    },

    /// Input port already has an upstream buffer
    #[error("Input port '{0}' is already bound")]
    AlreadyBound(String),

    /// Output port has no buffer to share
    #[error("Output port '{0}' has no buffer to bind to")]
    NoUpstreamBuffer(String),

    /// An input-only port was never bound before run
    #[error("Input port '{port}' of stage '{stage}' is not bound")]
    UnboundInput { stage: String, port: String },

    /// Ring buffer capacity must be at least one slot
    #[error("Buffer capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),

    /// Stage must run at least one worker
    #[error("Thread count must be at least 1, got {0}")]
    InvalidThreadCount(usize),

    /// Task declared the same port name twice
    #[error("Duplicate port '{port}' on task '{task}'")]
    DuplicatePort { task: String, port: String },

    /// Two stages share a name inside one pipeline
    #[error("Duplicate stage '{0}'")]
    DuplicateStage(String),

    /// No stage with this name in the pipeline
    #[error("No stage named '{0}'")]
    UnknownStage(String),

    /// Stage workers are alive
    #[error("Stage '{0}' has already been started")]
    AlreadyStarted(String),

    /// Buffers were stopped by a previous run and not yet reset
    #[error("Stage '{0}' must be reset before it can run again")]
    NotReset(String),

    /// No stages in pipeline
    #[error("Cannot start pipeline with no stages")]
    NoStages,

    /// Task execution error
    #[error("Task execution failed: {0}")]
    TaskError(String),

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}
