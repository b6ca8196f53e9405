//! A thread-safe double-buffering pipeline for fixed-width scalar records.
//!
//! Stages run a [`Task`] on one or more worker threads. Each stage declares
//! typed ports; binding an input to an upstream output shares a bounded
//! [`RingBuffer`] between the two, so producers block when consumers fall
//! behind and consumers block when there is nothing to read.
//!
//! # Features
//!
//! - Bounded FIFO ring buffers with cancellable blocking transfers
//! - Six scalar kinds (`int8` through `float64`) checked at bind time
//! - Fan-out: one output feeding any number of consumers, each with its own buffer
//! - Hierarchical cancel tokens and stop propagation through stopped buffers
//! - Per-stage metrics: executions, stalls, latency percentiles
//! - TOML configuration for thread counts, capacities and wait strategy
//!
//! # Example
//!
//! ```ignore
//! use buffered_pipeline::{Map, Passthrough, PipelineBuilder};
//!
//! let pipeline = PipelineBuilder::new()
//!     .add_stage(source)
//!     .add_stage(Map::new("scale", 4, 4, |src: &[i32], dst: &mut [f32]| {
//!         for (d, s) in dst.iter_mut().zip(src) {
//!             *d = *s as f32 * 0.5;
//!         }
//!     }))
//!     .add_stage(sink)
//!     .connect("source", "out", "scale", "in")
//!     .connect("scale", "out", "sink", "in")
//!     .build()?;
//!
//! let running = pipeline.start()?;
//! let pipeline = running.wait()?;
//! ```

pub mod buffer;
pub mod cancel;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod port;
pub mod scalar;
pub mod stage;
pub mod task;

// Re-exports for convenience
pub use buffer::RingBuffer;
pub use cancel::CancelToken;
pub use config::{PipelineConfig, StageConfig, WaitStrategy};
pub use error::{PipelineError, Result};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use pipeline::{Pipeline, PipelineBuilder, RunningPipeline};
pub use port::{AnyPort, BufferedPort, Direction, PortSpec};
pub use scalar::{Record, RecordBuf, Scalar, ScalarKind};
pub use stage::{PipelineStage, PortReport, StageReport};
pub use task::{Frame, Map, Passthrough, Task};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
