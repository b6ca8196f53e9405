//! Buffered ports: the binding points between stages.
//!
//! An output port owns one [`RingBuffer`] per downstream consumer. An input
//! port holds a shared handle to exactly one upstream buffer. Ports declared
//! [`Direction::InOut`] may do both.

use crate::buffer::{Pacer, RingBuffer};
use crate::cancel::CancelToken;
use crate::config::WaitStrategy;
use crate::error::{PipelineError, Result};
use crate::scalar::{RecordBuf, Scalar, ScalarKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which way data moves through a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
    InOut,
}

impl Direction {
    /// Can be fed by an upstream buffer
    #[inline]
    pub fn accepts_input(self) -> bool {
        matches!(self, Direction::Input | Direction::InOut)
    }

    /// Feeds downstream buffers
    #[inline]
    pub fn produces_output(self) -> bool {
        matches!(self, Direction::Output | Direction::InOut)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Input => "input",
            Direction::Output => "output",
            Direction::InOut => "in-out",
        })
    }
}

/// A port declared by a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub direction: Direction,
    pub kind: ScalarKind,
    /// Elements per record
    pub len: usize,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, direction: Direction, kind: ScalarKind, len: usize) -> Self {
        Self {
            name: name.into(),
            direction,
            kind,
            len,
        }
    }

    pub fn input(name: impl Into<String>, kind: ScalarKind, len: usize) -> Self {
        Self::new(name, Direction::Input, kind, len)
    }

    pub fn output(name: impl Into<String>, kind: ScalarKind, len: usize) -> Self {
        Self::new(name, Direction::Output, kind, len)
    }

    pub fn in_out(name: impl Into<String>, kind: ScalarKind, len: usize) -> Self {
        Self::new(name, Direction::InOut, kind, len)
    }
}

/// How an output push finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Every consumer accepted on the first attempt
    Immediate,
    /// At least one consumer was full and had to be waited on
    Delayed,
    /// Cancelled or a consumer buffer stopped before delivery completed
    Abandoned,
}

/// A task port bound to ring buffers carrying records of `T`
pub struct BufferedPort<T: Scalar> {
    spec: PortSpec,
    capacity: usize,
    upstream: Option<Arc<RingBuffer<T>>>,
    downstream: Vec<Arc<RingBuffer<T>>>,
}

impl<T: Scalar> BufferedPort<T> {
    /// Create a port for `spec`. Output-capable ports start with one buffer of
    /// `capacity` slots.
    pub fn new(spec: PortSpec, capacity: usize) -> Result<Self> {
        if spec.kind != T::KIND {
            return Err(PipelineError::KindMismatch {
                input: spec.kind,
                output: T::KIND,
            });
        }
        if capacity == 0 {
            return Err(PipelineError::InvalidCapacity(capacity));
        }

        let mut port = Self {
            spec,
            capacity,
            upstream: None,
            downstream: Vec::new(),
        };
        if port.spec.direction.produces_output() {
            port.create_buffer()?;
        }
        Ok(port)
    }

    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The buffer this port pops from, once bound
    pub fn upstream(&self) -> Option<&Arc<RingBuffer<T>>> {
        self.upstream.as_ref()
    }

    /// The buffers this port pushes into
    pub fn downstream(&self) -> &[Arc<RingBuffer<T>>] {
        &self.downstream
    }

    /// The most recently created downstream buffer
    pub fn last_buffer(&self) -> Option<&Arc<RingBuffer<T>>> {
        self.downstream.last()
    }

    pub fn is_bound(&self) -> bool {
        self.upstream.is_some()
    }

    /// The last downstream buffer has no consumer attached yet
    pub fn has_unclaimed_buffer(&self) -> bool {
        self.last_buffer()
            .is_some_and(|buffer| Arc::strong_count(buffer) == 1)
    }

    /// Number of downstream buffers with a consumer attached
    pub fn consumer_count(&self) -> usize {
        self.consumers().count()
    }

    /// Attach this input to `producer`'s last buffer, sharing it
    pub fn bind(&mut self, producer: &BufferedPort<T>) -> Result<()> {
        self.check_bindable(producer)?;
        let buffer = producer
            .last_buffer()
            .ok_or_else(|| PipelineError::NoUpstreamBuffer(producer.name().to_string()))?;
        self.upstream = Some(Arc::clone(buffer));
        Ok(())
    }

    /// Ask `producer` for a fresh buffer and attach this input to it
    pub fn bind_and_clone(&mut self, producer: &mut BufferedPort<T>) -> Result<()> {
        self.check_bindable(producer)?;
        if producer.downstream.is_empty() {
            return Err(PipelineError::NoUpstreamBuffer(producer.name().to_string()));
        }
        producer.create_buffer()?;
        self.bind(producer)
    }

    /// Claim `producer`'s initial buffer if it is still free, otherwise fan out
    /// with a fresh one. Returns true when a new buffer was created.
    pub fn connect(&mut self, producer: &mut BufferedPort<T>) -> Result<bool> {
        if producer.has_unclaimed_buffer() {
            self.bind(producer)?;
            Ok(false)
        } else {
            self.bind_and_clone(producer)?;
            Ok(true)
        }
    }

    fn check_bindable(&self, producer: &BufferedPort<T>) -> Result<()> {
        if !self.spec.direction.accepts_input() {
            return Err(PipelineError::WrongDirection {
                port: self.spec.name.clone(),
                direction: self.spec.direction,
                role: "a consumer",
            });
        }
        if self.upstream.is_some() {
            return Err(PipelineError::AlreadyBound(self.spec.name.clone()));
        }
        if !producer.spec.direction.produces_output() {
            return Err(PipelineError::WrongDirection {
                port: producer.spec.name.clone(),
                direction: producer.spec.direction,
                role: "a producer",
            });
        }
        if self.spec.len != producer.spec.len {
            return Err(PipelineError::LengthMismatch {
                input: self.spec.len,
                output: producer.spec.len,
            });
        }
        Ok(())
    }

    fn create_buffer(&mut self) -> Result<()> {
        let buffer = RingBuffer::new(self.capacity, self.spec.len)?;
        self.downstream.push(Arc::new(buffer));
        Ok(())
    }

    /// Downstream buffers some consumer holds a handle to. Unclaimed buffers
    /// can never be drained, so pushes skip them.
    fn consumers(&self) -> impl Iterator<Item = &Arc<RingBuffer<T>>> {
        self.downstream
            .iter()
            .filter(|buffer| Arc::strong_count(buffer) > 1)
    }

    /// Pop the next upstream record into `staging` without blocking.
    /// Returns false if nothing was available or the port is unbound.
    pub fn pop(&self, staging: &mut [T]) -> bool {
        match self.upstream {
            Some(ref buffer) => buffer.try_pop(staging),
            None => false,
        }
    }

    /// Block until an upstream record arrives.
    /// Returns false if the buffer stopped or `cancel` fired first.
    pub fn wait_pop(&self, staging: &mut [T], cancel: &CancelToken) -> bool {
        match self.upstream {
            Some(ref buffer) => buffer.wait_pop_cancellable(staging, cancel),
            None => false,
        }
    }

    /// Deliver `staging` to every consumer, retrying the non-blocking push on
    /// each until it is accepted. Returns false if `cancel` fired or a
    /// consumer buffer stopped first.
    pub fn push(&self, staging: &[T], cancel: &CancelToken) -> bool {
        self.spin_push(staging, cancel) != Delivery::Abandoned
    }

    /// Deliver `staging` to every consumer, blocking on each full buffer
    pub fn wait_push(&self, staging: &[T], cancel: &CancelToken) -> bool {
        self.block_push(staging, cancel) != Delivery::Abandoned
    }

    fn spin_pop(&self, staging: &mut [T], cancel: &CancelToken) -> bool {
        let Some(ref buffer) = self.upstream else {
            return false;
        };
        let pacer = Pacer::new();
        loop {
            if buffer.try_pop(staging) {
                return true;
            }
            if buffer.is_stopped() || cancel.is_cancelled() {
                return false;
            }
            pacer.pause();
        }
    }

    fn spin_push(&self, staging: &[T], cancel: &CancelToken) -> Delivery {
        let pacer = Pacer::new();
        let mut delivery = Delivery::Immediate;
        for buffer in self.consumers() {
            pacer.reset();
            while !buffer.try_push(staging) {
                if buffer.is_stopped() || cancel.is_cancelled() {
                    return Delivery::Abandoned;
                }
                delivery = Delivery::Delayed;
                pacer.pause();
            }
        }
        delivery
    }

    fn block_push(&self, staging: &[T], cancel: &CancelToken) -> Delivery {
        let mut delivery = Delivery::Immediate;
        for buffer in self.consumers() {
            if buffer.try_push(staging) {
                continue;
            }
            delivery = Delivery::Delayed;
            if !buffer.wait_push_cancellable(staging, cancel) {
                return Delivery::Abandoned;
            }
        }
        delivery
    }

    pub(crate) fn pull(&self, staging: &mut [T], wait: WaitStrategy, cancel: &CancelToken) -> bool {
        match wait {
            WaitStrategy::Spin => self.spin_pop(staging, cancel),
            WaitStrategy::Block => self.wait_pop(staging, cancel),
        }
    }

    pub(crate) fn deliver(&self, staging: &[T], wait: WaitStrategy, cancel: &CancelToken) -> Delivery {
        match wait {
            WaitStrategy::Spin => self.spin_push(staging, cancel),
            WaitStrategy::Block => self.block_push(staging, cancel),
        }
    }

    /// Reset every buffer this port touches
    pub fn reset(&self) {
        self.reset_upstream();
        for buffer in &self.downstream {
            buffer.reset();
        }
    }

    /// Stop every buffer this port touches
    pub fn stop(&self) {
        self.stop_downstream();
        self.stop_upstream();
    }

    pub fn stop_upstream(&self) {
        if let Some(ref buffer) = self.upstream {
            buffer.stop();
        }
    }

    pub fn stop_downstream(&self) {
        for buffer in &self.downstream {
            buffer.stop();
        }
    }

    /// Any buffer this port touches has been stopped
    pub fn is_stopped(&self) -> bool {
        self.upstream
            .iter()
            .chain(self.downstream.iter())
            .any(|buffer| buffer.is_stopped())
    }

    fn reset_upstream(&self) {
        if let Some(ref buffer) = self.upstream {
            buffer.reset();
        }
    }

    /// Occupied slots of the upstream buffer, if any, followed by each
    /// downstream buffer
    pub fn occupancy(&self) -> Vec<usize> {
        self.upstream
            .iter()
            .chain(self.downstream.iter())
            .map(|buffer| buffer.len())
            .collect()
    }
}

impl<T: Scalar> fmt::Debug for BufferedPort<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedPort")
            .field("spec", &self.spec)
            .field("capacity", &self.capacity)
            .field("bound", &self.is_bound())
            .field("downstream", &self.downstream.len())
            .finish()
    }
}

/// A [`BufferedPort`] whose element kind was chosen at runtime
#[derive(Debug)]
pub enum AnyPort {
    Int8(BufferedPort<i8>),
    Int16(BufferedPort<i16>),
    Int32(BufferedPort<i32>),
    Int64(BufferedPort<i64>),
    Float32(BufferedPort<f32>),
    Float64(BufferedPort<f64>),
}

macro_rules! with_port {
    ($port:expr, $p:ident => $body:expr) => {
        match $port {
            AnyPort::Int8($p) => $body,
            AnyPort::Int16($p) => $body,
            AnyPort::Int32($p) => $body,
            AnyPort::Int64($p) => $body,
            AnyPort::Float32($p) => $body,
            AnyPort::Float64($p) => $body,
        }
    };
}

macro_rules! with_record {
    ($port:expr, $record:expr, $p:ident, $r:ident => $body:expr) => {
        match ($port, $record) {
            (AnyPort::Int8($p), RecordBuf::Int8($r)) => $body,
            (AnyPort::Int16($p), RecordBuf::Int16($r)) => $body,
            (AnyPort::Int32($p), RecordBuf::Int32($r)) => $body,
            (AnyPort::Int64($p), RecordBuf::Int64($r)) => $body,
            (AnyPort::Float32($p), RecordBuf::Float32($r)) => $body,
            (AnyPort::Float64($p), RecordBuf::Float64($r)) => $body,
            (port, record) => unreachable!(
                "staging record of kind {} paired with {} port '{}'",
                record.kind(),
                port.kind(),
                port.name()
            ),
        }
    };
}

impl AnyPort {
    /// Build the typed port matching `spec.kind`
    pub fn new(spec: PortSpec, capacity: usize) -> Result<Self> {
        Ok(match spec.kind {
            ScalarKind::Int8 => AnyPort::Int8(BufferedPort::new(spec, capacity)?),
            ScalarKind::Int16 => AnyPort::Int16(BufferedPort::new(spec, capacity)?),
            ScalarKind::Int32 => AnyPort::Int32(BufferedPort::new(spec, capacity)?),
            ScalarKind::Int64 => AnyPort::Int64(BufferedPort::new(spec, capacity)?),
            ScalarKind::Float32 => AnyPort::Float32(BufferedPort::new(spec, capacity)?),
            ScalarKind::Float64 => AnyPort::Float64(BufferedPort::new(spec, capacity)?),
        })
    }

    pub fn spec(&self) -> &PortSpec {
        with_port!(self, p => p.spec())
    }

    pub fn name(&self) -> &str {
        &self.spec().name
    }

    pub fn kind(&self) -> ScalarKind {
        self.spec().kind
    }

    pub fn direction(&self) -> Direction {
        self.spec().direction
    }

    pub fn is_bound(&self) -> bool {
        with_port!(self, p => p.is_bound())
    }

    pub fn consumer_count(&self) -> usize {
        with_port!(self, p => p.consumer_count())
    }

    /// Bind this input to `producer`, claiming its free buffer or cloning a
    /// new one. Kinds must match exactly; on error nothing is modified.
    /// Returns true when a new buffer was created.
    pub fn connect(&mut self, producer: &mut AnyPort) -> Result<bool> {
        match (self, producer) {
            (AnyPort::Int8(c), AnyPort::Int8(p)) => c.connect(p),
            (AnyPort::Int16(c), AnyPort::Int16(p)) => c.connect(p),
            (AnyPort::Int32(c), AnyPort::Int32(p)) => c.connect(p),
            (AnyPort::Int64(c), AnyPort::Int64(p)) => c.connect(p),
            (AnyPort::Float32(c), AnyPort::Float32(p)) => c.connect(p),
            (AnyPort::Float64(c), AnyPort::Float64(p)) => c.connect(p),
            (consumer, producer) => Err(PipelineError::KindMismatch {
                input: consumer.kind(),
                output: producer.kind(),
            }),
        }
    }

    /// Zeroed staging record shaped for this port
    pub fn staging(&self) -> RecordBuf {
        let spec = self.spec();
        RecordBuf::zeroed(spec.kind, spec.len)
    }

    pub(crate) fn pull(&self, staging: &mut RecordBuf, wait: WaitStrategy, cancel: &CancelToken) -> bool {
        with_record!(self, staging, p, r => p.pull(r, wait, cancel))
    }

    pub(crate) fn deliver(&self, staging: &RecordBuf, wait: WaitStrategy, cancel: &CancelToken) -> Delivery {
        with_record!(self, staging, p, r => p.deliver(r, wait, cancel))
    }

    pub fn reset(&self) {
        with_port!(self, p => p.reset())
    }

    pub fn stop(&self) {
        with_port!(self, p => p.stop())
    }

    pub fn stop_upstream(&self) {
        with_port!(self, p => p.stop_upstream())
    }

    pub fn stop_downstream(&self) {
        with_port!(self, p => p.stop_downstream())
    }

    pub fn is_stopped(&self) -> bool {
        with_port!(self, p => p.is_stopped())
    }

    pub fn occupancy(&self) -> Vec<usize> {
        with_port!(self, p => p.occupancy())
    }

    pub fn capacity(&self) -> usize {
        with_port!(self, p => p.capacity)
    }
}
