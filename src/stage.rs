use crate::buffer::WAIT_TICK;
use crate::cancel::CancelToken;
use crate::config::{StageConfig, WaitStrategy};
use crate::error::{PipelineError, Result};
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::port::{AnyPort, Delivery, Direction, PortSpec};
use crate::scalar::ScalarKind;
use crate::task::{Frame, Task};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Ports of one stage, in task declaration order
#[derive(Debug)]
struct PortTable {
    ports: Vec<AnyPort>,
}

impl PortTable {
    fn position(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name() == name)
    }

    /// Indices of ports fed by an upstream buffer
    fn inputs(&self) -> Vec<usize> {
        (0..self.ports.len())
            .filter(|&i| self.ports[i].is_bound())
            .collect()
    }

    /// Indices of ports feeding downstream buffers
    fn outputs(&self) -> Vec<usize> {
        (0..self.ports.len())
            .filter(|&i| self.ports[i].direction().produces_output())
            .collect()
    }

    /// Stop downstream buffers first so consumers wake, then upstream ones
    fn stop_all(&self) {
        for port in &self.ports {
            port.stop_downstream();
        }
        for port in &self.ports {
            port.stop_upstream();
        }
    }
}

fn first_duplicate(specs: &[PortSpec]) -> Option<String> {
    let mut seen = HashSet::new();
    specs
        .iter()
        .find(|spec| !seen.insert(spec.name.as_str()))
        .map(|spec| spec.name.clone())
}

/// Stops every buffer of the stage when a worker leaves, including by panic
struct StopOnExit {
    ports: Arc<PortTable>,
    cancel: CancelToken,
}

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.ports.stop_all();
    }
}

/// A counter that lets tickets through strictly in order
#[derive(Default)]
struct Turn {
    next: Mutex<u64>,
    advanced: Condvar,
}

impl Turn {
    /// Block until `ticket` is up. Returns false if `cancel` fired first.
    fn wait(&self, ticket: u64, cancel: &CancelToken) -> bool {
        let mut next = self.next.lock();
        while *next != ticket {
            if cancel.is_cancelled() {
                return false;
            }
            self.advanced.wait_for(&mut next, WAIT_TICK);
        }
        true
    }

    fn advance(&self) {
        *self.next.lock() += 1;
        self.advanced.notify_all();
    }
}

/// Ordering shared by the workers of a multi-threaded stage. Worker `w` of
/// `n` holds tickets `w, w + n, w + 2n, ...`: it pulls every input for its
/// ticket before the next worker pulls, and pushes its outputs only after
/// the previous ticket's outputs are out. Records stay paired across inputs
/// and leave the stage in arrival order.
#[derive(Default)]
struct Turns {
    pull: Turn,
    push: Turn,
}

type WorkerHandle = JoinHandle<(Box<dyn Task>, Result<()>)>;

type TaskFactory = Box<dyn Fn() -> Box<dyn Task> + Send>;

/// Everything a worker thread needs, moved into the thread
struct Worker {
    id: usize,
    stage: String,
    specs: Vec<PortSpec>,
    ports: Arc<PortTable>,
    /// Run-wide token handed to the task through its frame
    run: CancelToken,
    /// Stage-local token checked by the loop
    cancel: CancelToken,
    metrics: StageMetrics,
    wait: WaitStrategy,
    /// Present when the stage runs more than one worker
    turns: Option<Arc<Turns>>,
    stride: u64,
}

impl Worker {
    fn run(self, mut task: Box<dyn Task>) -> (Box<dyn Task>, Result<()>) {
        info!(stage = %self.stage, worker = self.id, "worker started");
        let mut frame = Frame::new(self.id, self.stage.as_str(), &self.specs, self.run.clone());

        let guard = StopOnExit {
            ports: Arc::clone(&self.ports),
            cancel: self.cancel.clone(),
        };
        let mut result = task.on_start(self.id);
        if result.is_ok() {
            result = self.drive(task.as_mut(), &mut frame);
        }
        drop(guard);

        if let Err(ref e) = result {
            warn!(stage = %self.stage, worker = self.id, error = %e, "task failed");
        }
        let shutdown = task.on_shutdown(self.id);
        info!(
            stage = %self.stage,
            worker = self.id,
            executions = self.metrics.total_executions(),
            "worker stopped"
        );
        (task, result.and(shutdown))
    }

    fn drive(&self, task: &mut dyn Task, frame: &mut Frame) -> Result<()> {
        let inputs = self.ports.inputs();
        let outputs = self.ports.outputs();
        let turns = self.turns.as_deref();
        let mut ticket = self.id as u64;

        while !self.cancel.is_cancelled() {
            if let Some(turns) = turns {
                if !turns.pull.wait(ticket, &self.cancel) {
                    return Ok(());
                }
            }
            for &idx in &inputs {
                if !self.ports.ports[idx].pull(frame.slot_mut(idx), self.wait, &self.cancel) {
                    return Ok(());
                }
            }
            if let Some(turns) = turns {
                turns.pull.advance();
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let started = Instant::now();
            if let Err(e) = task.execute(frame) {
                self.metrics.record_task_error();
                return Err(e);
            }
            self.metrics.record_execution(started.elapsed());

            if let Some(turns) = turns {
                if !turns.push.wait(ticket, &self.cancel) {
                    return Ok(());
                }
            }
            for &idx in &outputs {
                match self.ports.ports[idx].deliver(frame.slot(idx), self.wait, &self.cancel) {
                    Delivery::Immediate => {}
                    Delivery::Delayed => self.metrics.record_stall(),
                    Delivery::Abandoned => return Ok(()),
                }
            }
            if let Some(turns) = turns {
                turns.push.advance();
            }
            ticket += self.stride;
        }
        Ok(())
    }
}

/// Runs one task on N worker threads between bound ring buffers.
///
/// Each worker owns a clone of the task and its own staging records. A worker
/// loops: pop every bound input, execute, push every output. With several
/// workers, record `k` goes to worker `k mod n` and outputs keep input order.
/// When the run's
/// cancel token fires or a neighbouring buffer stops, the worker stops all of
/// the stage's buffers on its way out so peers blocked on them wake up.
pub struct PipelineStage {
    name: String,
    config: StageConfig,
    specs: Vec<PortSpec>,
    ports: Arc<PortTable>,
    tasks: Vec<Box<dyn Task>>,
    /// Fresh clones of the task as it was handed to `new`
    new_task: TaskFactory,
    workers: Vec<WorkerHandle>,
    cancel: Option<CancelToken>,
    metrics: StageMetrics,
}

impl PipelineStage {
    /// Build a stage running `config.threads` clones of `task`
    pub fn new<T: Task + Clone>(task: T, config: StageConfig) -> Result<Self> {
        config.validate()?;
        let name = task.name().to_string();
        let specs = task.ports();

        if let Some(dup) = first_duplicate(&specs) {
            return Err(PipelineError::DuplicatePort { task: name, port: dup });
        }

        let ports = specs
            .iter()
            .cloned()
            .map(|spec| AnyPort::new(spec, config.buffer_capacity))
            .collect::<Result<Vec<_>>>()?;
        let new_task: TaskFactory = Box::new(move || Box::new(task.clone()) as Box<dyn Task>);
        let tasks = (0..config.threads).map(|_| new_task()).collect();

        debug!(
            stage = %name,
            threads = config.threads,
            capacity = config.buffer_capacity,
            ports = specs.len(),
            "stage created"
        );

        Ok(Self {
            name,
            config,
            specs,
            ports: Arc::new(PortTable { ports }),
            tasks,
            new_task,
            workers: Vec::new(),
            cancel: None,
            metrics: StageMetrics::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Ports declared by the task
    pub fn port_specs(&self) -> &[PortSpec] {
        &self.specs
    }

    pub fn port(&self, name: &str) -> Option<&AnyPort> {
        self.ports.position(name).map(|i| &self.ports.ports[i])
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Workers have been spawned and not yet joined
    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Feed this stage's input port `input` from `producer`'s output port
    /// `output`. The first consumer of an output shares its initial buffer;
    /// every further consumer gets a fresh one.
    pub fn bind(&mut self, input: &str, producer: &mut PipelineStage, output: &str) -> Result<()> {
        let consumer_name = self.name.clone();
        let producer_name = producer.name.clone();

        let consumer_ports = Arc::get_mut(&mut self.ports)
            .ok_or_else(|| PipelineError::AlreadyStarted(consumer_name.clone()))?;
        let producer_ports = Arc::get_mut(&mut producer.ports)
            .ok_or_else(|| PipelineError::AlreadyStarted(producer_name.clone()))?;

        let in_idx = consumer_ports
            .position(input)
            .ok_or_else(|| PipelineError::UnknownPort {
                stage: consumer_name.clone(),
                port: input.to_string(),
            })?;
        let out_idx = producer_ports
            .position(output)
            .ok_or_else(|| PipelineError::UnknownPort {
                stage: producer_name.clone(),
                port: output.to_string(),
            })?;

        let consumer_port = &mut consumer_ports.ports[in_idx];
        let producer_port = &mut producer_ports.ports[out_idx];
        let cloned = consumer_port.connect(producer_port)?;
        debug!(
            consumer = %consumer_name,
            input,
            producer = %producer_name,
            output,
            kind = %consumer_port.kind(),
            fan_out = cloned,
            "ports bound"
        );
        Ok(())
    }

    /// Spawn the workers. They run until `cancel` fires, a neighbouring buffer
    /// stops, or a task fails; call [`join`](Self::join) to collect them.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        self.check_ready()?;
        self.spawn(cancel)
    }

    /// Buffers were stopped by an earlier run and need a [`reset`](Self::reset)
    pub fn needs_reset(&self) -> bool {
        self.ports.ports.iter().any(AnyPort::is_stopped)
    }

    /// Refuse to run while workers are alive, an input-only port is unbound,
    /// or buffers are still stopped from the last run
    pub(crate) fn check_ready(&self) -> Result<()> {
        if self.is_running() {
            return Err(PipelineError::AlreadyStarted(self.name.clone()));
        }
        if let Some(port) = self
            .ports
            .ports
            .iter()
            .find(|p| p.direction() == Direction::Input && !p.is_bound())
        {
            return Err(PipelineError::UnboundInput {
                stage: self.name.clone(),
                port: port.name().to_string(),
            });
        }
        if self.needs_reset() {
            return Err(PipelineError::NotReset(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn spawn(&mut self, cancel: &CancelToken) -> Result<()> {
        for port in &self.ports.ports {
            if port.direction().produces_output() && port.consumer_count() == 0 {
                warn!(stage = %self.name, port = port.name(), "output has no consumer, records are discarded");
            }
        }

        let stage_cancel = cancel.child();
        self.cancel = Some(stage_cancel.clone());
        let stride = self.tasks.len() as u64;
        let turns = (stride > 1).then(|| Arc::new(Turns::default()));

        let mut tasks = std::mem::take(&mut self.tasks).into_iter().enumerate();
        while let Some((id, task)) = tasks.next() {
            let worker = Worker {
                id,
                stage: self.name.clone(),
                specs: self.specs.clone(),
                ports: Arc::clone(&self.ports),
                run: cancel.clone(),
                cancel: stage_cancel.clone(),
                metrics: self.metrics.clone(),
                wait: self.config.wait,
                turns: turns.clone(),
                stride,
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.name, id))
                .spawn(move || worker.run(task));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.tasks.extend(tasks.by_ref().map(|(_, task)| task));
                    self.stop();
                    let _ = self.join();
                    while self.tasks.len() < self.config.threads {
                        self.tasks.push((self.new_task)());
                    }
                    return Err(PipelineError::ThreadError(format!(
                        "failed to spawn worker {id} of stage '{}': {e}",
                        self.name
                    )));
                }
            }
        }

        debug!(stage = %self.name, workers = self.workers.len(), "stage running");
        Ok(())
    }

    /// Wait for every worker to finish. Returns the first task error or panic.
    pub fn join(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok((task, result)) => {
                    self.tasks.push(task);
                    if let Err(e) = result {
                        first_err.get_or_insert(e);
                    }
                }
                Err(_) => {
                    warn!(stage = %self.name, "worker panicked, its task is replaced by a fresh clone");
                    self.tasks.push((self.new_task)());
                    first_err.get_or_insert(PipelineError::ThreadError(format!(
                        "worker of stage '{}' panicked",
                        self.name
                    )));
                }
            }
        }
        self.cancel = None;
        debug!(stage = %self.name, "stage joined");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel this stage's workers and stop all of its buffers
    pub fn stop(&self) {
        if let Some(ref cancel) = self.cancel {
            cancel.cancel();
        }
        self.ports.stop_all();
    }

    /// Empty every buffer and clear stop flags before another run.
    ///
    /// Peers bound to this stage must be idle as well, since shared buffers
    /// are reset from both ends.
    pub fn reset(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(PipelineError::AlreadyStarted(self.name.clone()));
        }
        for port in &self.ports.ports {
            port.reset();
        }
        self.metrics.reset();
        Ok(())
    }

    /// Per-port buffer occupancy and the stage's counters
    pub fn report(&self) -> StageReport {
        StageReport {
            name: self.name.clone(),
            threads: self.config.threads,
            running: self.is_running(),
            ports: self
                .ports
                .ports
                .iter()
                .map(|port| {
                    let spec = port.spec();
                    PortReport {
                        name: spec.name.clone(),
                        direction: spec.direction,
                        kind: spec.kind,
                        len: spec.len,
                        capacity: port.capacity(),
                        occupancy: port.occupancy(),
                    }
                })
                .collect(),
            metrics: self.metrics.snapshot(),
        }
    }
}

impl Drop for PipelineStage {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
            let _ = self.join();
        }
    }
}

impl fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("ports", &self.specs)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Buffer state of one port
#[derive(Debug, Clone)]
pub struct PortReport {
    pub name: String,
    pub direction: Direction,
    pub kind: ScalarKind,
    pub len: usize,
    pub capacity: usize,
    /// Occupied slots: the upstream buffer first if bound, then each
    /// downstream buffer
    pub occupancy: Vec<usize>,
}

/// Read-only view of a stage for operators
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub threads: usize,
    pub running: bool,
    pub ports: Vec<PortReport>,
    pub metrics: MetricsSnapshot,
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({} threads, {})",
            self.name,
            self.threads,
            if self.running { "running" } else { "idle" }
        )?;
        for port in &self.ports {
            let fill: Vec<String> = port
                .occupancy
                .iter()
                .map(|n| format!("{n}/{}", port.capacity))
                .collect();
            writeln!(
                f,
                "  {} [{} {}x{}]: [{}]",
                port.name,
                port.direction,
                port.kind,
                port.len,
                fill.join(", ")
            )?;
        }
        write!(f, "  {}", self.metrics)
    }
}
