use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};
use crate::port::PortSpec;
use crate::scalar::{RecordBuf, Scalar, ScalarKind};
use std::marker::PhantomData;

/// A processing step driven by a pipeline stage.
///
/// The stage clones the task once per worker thread. Each clone gets its own
/// [`Frame`] holding one staging record per declared port: input records are
/// filled before `execute` runs and output records are pushed after it
/// returns.
pub trait Task: Send + 'static {
    /// Human-readable name, also used as the stage name
    fn name(&self) -> &str;

    /// Ports this task reads and writes. Names must be unique.
    fn ports(&self) -> Vec<PortSpec>;

    /// Process one set of input records into the output records
    fn execute(&mut self, frame: &mut Frame) -> Result<()>;

    /// Called on the worker thread before the first record
    fn on_start(&mut self, _worker: usize) -> Result<()> {
        Ok(())
    }

    /// Called on the worker thread after the last record
    fn on_shutdown(&mut self, _worker: usize) -> Result<()> {
        Ok(())
    }
}

/// Worker-owned staging records, one per declared port
#[derive(Debug)]
pub struct Frame {
    worker: usize,
    task: String,
    names: Vec<String>,
    records: Vec<RecordBuf>,
    cancel: CancelToken,
}

impl Frame {
    pub fn new(worker: usize, task: impl Into<String>, specs: &[PortSpec], cancel: CancelToken) -> Self {
        Self {
            worker,
            task: task.into(),
            names: specs.iter().map(|s| s.name.clone()).collect(),
            records: specs.iter().map(|s| RecordBuf::zeroed(s.kind, s.len)).collect(),
            cancel,
        }
    }

    /// Index of the worker thread owning this frame
    pub fn worker_id(&self) -> usize {
        self.worker
    }

    /// Read the record of port `name`
    pub fn input<T: Scalar>(&self, name: &str) -> Result<&[T]> {
        let idx = self.index_of(name)?;
        let record = &self.records[idx];
        record
            .as_slice::<T>()
            .ok_or_else(|| kind_error(name, record.kind(), T::KIND))
    }

    /// Write the record of port `name`
    pub fn output<T: Scalar>(&mut self, name: &str) -> Result<&mut [T]> {
        let idx = self.index_of(name)?;
        let actual = self.records[idx].kind();
        match self.records[idx].as_mut_slice::<T>() {
            Some(slice) => Ok(slice),
            None => Err(kind_error(name, actual, T::KIND)),
        }
    }

    /// Read one port while writing another
    pub fn io<I: Scalar, O: Scalar>(&mut self, input: &str, output: &str) -> Result<(&[I], &mut [O])> {
        let i = self.index_of(input)?;
        let o = self.index_of(output)?;
        if i == o {
            return Err(PipelineError::TaskError(format!(
                "port '{input}' cannot be both source and destination"
            )));
        }

        let in_kind = self.records[i].kind();
        let out_kind = self.records[o].kind();
        if in_kind != I::KIND {
            return Err(kind_error(input, in_kind, I::KIND));
        }
        if out_kind != O::KIND {
            return Err(kind_error(output, out_kind, O::KIND));
        }

        let (src, dst) = if i < o {
            let (left, right) = self.records.split_at_mut(o);
            (&left[i], &mut right[0])
        } else {
            let (left, right) = self.records.split_at_mut(i);
            (&right[0], &mut left[o])
        };
        match (src.as_slice::<I>(), dst.as_mut_slice::<O>()) {
            (Some(src), Some(dst)) => Ok((src, dst)),
            _ => unreachable!("kinds checked above"),
        }
    }

    /// Type-erased record of port `name`
    pub fn record(&self, name: &str) -> Option<&RecordBuf> {
        self.index_of(name).ok().map(|idx| &self.records[idx])
    }

    /// Ask the whole run to wind down after this call
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[inline]
    pub(crate) fn slot(&self, idx: usize) -> &RecordBuf {
        &self.records[idx]
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, idx: usize) -> &mut RecordBuf {
        &mut self.records[idx]
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| PipelineError::UnknownPort {
                stage: self.task.clone(),
                port: name.to_string(),
            })
    }
}

fn kind_error(port: &str, actual: ScalarKind, requested: ScalarKind) -> PipelineError {
    PipelineError::PortKind {
        port: port.to_string(),
        actual,
        requested,
    }
}

/// Copies port `in` to port `out` unchanged
#[derive(Debug, Clone)]
pub struct Passthrough<T: Scalar> {
    name: String,
    len: usize,
    _kind: PhantomData<T>,
}

impl<T: Scalar> Passthrough<T> {
    pub fn new(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            len,
            _kind: PhantomData,
        }
    }
}

impl<T: Scalar> Task for Passthrough<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("in", T::KIND, self.len),
            PortSpec::output("out", T::KIND, self.len),
        ]
    }

    fn execute(&mut self, frame: &mut Frame) -> Result<()> {
        let (src, dst) = frame.io::<T, T>("in", "out")?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// Applies a function from port `in` to port `out`
#[derive(Debug, Clone)]
pub struct Map<I, O, F> {
    name: String,
    in_len: usize,
    out_len: usize,
    mapper: F,
    _kinds: PhantomData<fn(I) -> O>,
}

impl<I, O, F> Map<I, O, F>
where
    I: Scalar,
    O: Scalar,
    F: FnMut(&[I], &mut [O]) + Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, in_len: usize, out_len: usize, mapper: F) -> Self {
        Self {
            name: name.into(),
            in_len,
            out_len,
            mapper,
            _kinds: PhantomData,
        }
    }
}

impl<I, O, F> Task for Map<I, O, F>
where
    I: Scalar,
    O: Scalar,
    F: FnMut(&[I], &mut [O]) + Clone + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("in", I::KIND, self.in_len),
            PortSpec::output("out", O::KIND, self.out_len),
        ]
    }

    fn execute(&mut self, frame: &mut Frame) -> Result<()> {
        let (src, dst) = frame.io::<I, O>("in", "out")?;
        (self.mapper)(src, dst);
        Ok(())
    }
}
