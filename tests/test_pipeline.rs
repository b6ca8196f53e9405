use buffered_pipeline::{
    Frame, Map, Passthrough, PipelineBuilder, PipelineConfig, PipelineError, PortSpec,
    Result as PipelineResult, ScalarKind, StageConfig, Task, WaitStrategy,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Emits 0, 1, 2, ... one record per execute call
#[derive(Clone)]
struct Counter {
    name: &'static str,
    next: i64,
}

impl Counter {
    fn new(name: &'static str) -> Self {
        Self { name, next: 0 }
    }
}

impl Task for Counter {
    fn name(&self) -> &str {
        self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output("out", ScalarKind::Int64, 1)]
    }

    fn execute(&mut self, frame: &mut Frame) -> PipelineResult<()> {
        frame.output::<i64>("out")?[0] = self.next;
        self.next += 1;
        Ok(())
    }
}

/// Records everything it receives, optionally ending the run after `limit`
#[derive(Clone)]
struct Sink {
    name: &'static str,
    seen: Arc<Mutex<Vec<i64>>>,
    limit: Option<usize>,
    delay: Duration,
}

impl Sink {
    fn new(name: &'static str, limit: Option<usize>) -> Self {
        Self {
            name,
            seen: Arc::new(Mutex::new(Vec::new())),
            limit,
            delay: Duration::ZERO,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn handle(&self) -> Arc<Mutex<Vec<i64>>> {
        Arc::clone(&self.seen)
    }
}

impl Task for Sink {
    fn name(&self) -> &str {
        self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::input("in", ScalarKind::Int64, 1)]
    }

    fn execute(&mut self, frame: &mut Frame) -> PipelineResult<()> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let value = frame.input::<i64>("in")?[0];
        let mut seen = self.seen.lock();
        seen.push(value);
        if self.limit.is_some_and(|limit| seen.len() >= limit) {
            frame.request_stop();
        }
        Ok(())
    }
}

fn wait_until(timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if ready() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    ready()
}

fn run_counter_to_sink(wait: WaitStrategy) {
    let sink = Sink::new("sink", Some(1000));
    let seen = sink.handle();
    let config = StageConfig::new(1, 8).with_wait(wait);

    let pipeline = PipelineBuilder::new()
        .add_stage_with(Counter::new("source"), config)
        .add_stage_with(sink, config)
        .connect("source", "out", "sink", "in")
        .build()
        .expect("Pipeline build failed");

    let running = pipeline.start().expect("Pipeline start failed");
    running.wait().expect("Wait failed");

    let seen = seen.lock();
    assert_eq!(seen.len(), 1000);
    assert_eq!(seen.iter().sum::<i64>(), 999 * 1000 / 2);
    assert_eq!(*seen, (0..1000).collect::<Vec<i64>>());
}

#[test]
fn test_two_stage_sum() {
    run_counter_to_sink(WaitStrategy::Spin);
}

#[test]
fn test_two_stage_sum_blocking_waits() {
    run_counter_to_sink(WaitStrategy::Block);
}

#[test]
fn test_three_stage_chain_with_map() {
    let sink_task = Sink::new("sink", Some(200));
    let seen = sink_task.handle();

    let pipeline = PipelineBuilder::new()
        .add_stage(Counter::new("source"))
        .add_stage(Map::new("square", 1, 1, |src: &[i64], dst: &mut [i64]| {
            dst[0] = src[0] * src[0];
        }))
        .add_stage(sink_task)
        .connect("source", "out", "square", "in")
        .connect("square", "out", "sink", "in")
        .build()
        .expect("Pipeline build failed");

    pipeline
        .start()
        .expect("Pipeline start failed")
        .wait()
        .expect("Wait failed");

    let expected: Vec<i64> = (0..200).map(|i| i * i).collect();
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn test_fan_out_delivers_same_sequence() {
    let fast = Sink::new("fast", None);
    let slow = Sink::new("slow", None).slow(Duration::from_micros(200));
    let fast_seen = fast.handle();
    let slow_seen = slow.handle();

    let pipeline = PipelineBuilder::new()
        .add_stage_with(Counter::new("source"), StageConfig::new(1, 4))
        .add_stage(fast)
        .add_stage(slow)
        .connect("source", "out", "fast", "in")
        .connect("source", "out", "slow", "in")
        .build()
        .expect("Pipeline build failed");

    let out = pipeline.stage("source").unwrap().port("out").unwrap();
    assert_eq!(out.consumer_count(), 2);

    let running = pipeline.start().expect("Pipeline start failed");
    let ready = wait_until(Duration::from_secs(10), || {
        fast_seen.lock().len() >= 100 && slow_seen.lock().len() >= 100
    });
    running.shutdown().expect("Shutdown failed");
    assert!(ready, "consumers did not make progress");

    let fast_seen = fast_seen.lock();
    let slow_seen = slow_seen.lock();
    assert_eq!(*fast_seen, (0..fast_seen.len() as i64).collect::<Vec<_>>());
    assert_eq!(*slow_seen, (0..slow_seen.len() as i64).collect::<Vec<_>>());
    // The fast consumer is held back by the slow one once its buffer fills.
    assert!(fast_seen.len() <= slow_seen.len() + 2 * 4 + 2);
}

#[test]
fn test_kind_mismatch_rejected_at_build() {
    let result = PipelineBuilder::new()
        .add_stage(Counter::new("source"))
        .add_stage(Passthrough::<i32>::new("narrow", 1))
        .connect("source", "out", "narrow", "in")
        .build();

    assert!(matches!(
        result,
        Err(PipelineError::KindMismatch {
            input: ScalarKind::Int32,
            output: ScalarKind::Int64,
        })
    ));
}

#[test]
fn test_length_mismatch_rejected_at_build() {
    let result = PipelineBuilder::new()
        .add_stage(Passthrough::<f64>::new("wide", 3))
        .add_stage(Passthrough::<f64>::new("narrow", 2))
        .connect("wide", "out", "narrow", "in")
        .build();

    assert!(matches!(
        result,
        Err(PipelineError::LengthMismatch { input: 2, output: 3 })
    ));
}

#[test]
fn test_multi_worker_stage_keeps_order() {
    let sink = Sink::new("sink", Some(500));
    let seen = sink.handle();

    let pipeline = PipelineBuilder::new()
        .add_stage(Counter::new("source"))
        .add_stage_with(Passthrough::<i64>::new("relay", 1), StageConfig::new(3, 8))
        .add_stage(sink)
        .connect("source", "out", "relay", "in")
        .connect("relay", "out", "sink", "in")
        .build()
        .expect("Pipeline build failed");

    let pipeline = pipeline
        .start()
        .expect("Pipeline start failed")
        .wait()
        .expect("Wait failed");

    assert_eq!(*seen.lock(), (0..500).collect::<Vec<i64>>());
    assert_eq!(pipeline.stage("relay").unwrap().config().threads, 3);
}

/// Joins two inputs, failing if they come from different iterations
#[derive(Clone)]
struct Pair;

impl Task for Pair {
    fn name(&self) -> &str {
        "pair"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("x", ScalarKind::Int64, 1),
            PortSpec::input("y", ScalarKind::Int64, 1),
            PortSpec::output("out", ScalarKind::Int64, 1),
        ]
    }

    fn execute(&mut self, frame: &mut Frame) -> PipelineResult<()> {
        let x = frame.input::<i64>("x")?[0];
        let y = frame.input::<i64>("y")?[0];
        if x != y {
            return Err(PipelineError::TaskError(format!("paired {x} with {y}")));
        }
        frame.output::<i64>("out")?[0] = x;
        Ok(())
    }
}

#[test]
fn test_multi_worker_stage_pairs_inputs() {
    let sink = Sink::new("sink", Some(5_000));
    let seen = sink.handle();

    let pipeline = PipelineBuilder::new()
        .add_stage(Counter::new("left"))
        .add_stage(Counter::new("right"))
        .add_stage_with(Pair, StageConfig::new(4, 8))
        .add_stage(sink)
        .connect("left", "out", "pair", "x")
        .connect("right", "out", "pair", "y")
        .connect("pair", "out", "sink", "in")
        .build()
        .expect("Pipeline build failed");

    let pipeline = pipeline
        .start()
        .expect("Pipeline start failed")
        .wait()
        .expect("Inputs were paired across iterations");

    assert_eq!(*seen.lock(), (0..5_000).collect::<Vec<i64>>());
    assert_eq!(pipeline.stage("pair").unwrap().metrics().total_task_errors(), 0);
}

#[test]
fn test_task_error_surfaces_from_wait() {
    #[derive(Clone)]
    struct Picky;

    impl Task for Picky {
        fn name(&self) -> &str {
            "picky"
        }

        fn ports(&self) -> Vec<PortSpec> {
            vec![PortSpec::input("in", ScalarKind::Int64, 1)]
        }

        fn execute(&mut self, frame: &mut Frame) -> PipelineResult<()> {
            let value = frame.input::<i64>("in")?[0];
            if value == 42 {
                return Err(PipelineError::TaskError(format!("rejected {value}")));
            }
            Ok(())
        }
    }

    let pipeline = PipelineBuilder::new()
        .add_stage(Counter::new("source"))
        .add_stage(Picky)
        .connect("source", "out", "picky", "in")
        .build()
        .expect("Pipeline build failed");

    let result = pipeline.start().expect("Pipeline start failed").wait();
    assert!(matches!(result, Err(PipelineError::TaskError(ref m)) if m == "rejected 42"));
}

#[test]
fn test_reset_and_restart() {
    let sink = Sink::new("sink", Some(50));
    let seen = sink.handle();

    let mut pipeline = PipelineBuilder::new()
        .add_stage(Counter::new("source"))
        .add_stage(sink)
        .connect("source", "out", "sink", "in")
        .build()
        .expect("Pipeline build failed");

    for cycle in 0..3 {
        seen.lock().clear();
        pipeline.reset().expect("Reset failed");
        pipeline = pipeline
            .start()
            .expect("Pipeline start failed")
            .wait()
            .expect("Wait failed");

        let seen = seen.lock();
        assert_eq!(seen.len(), 50, "cycle {cycle}");
        let first = seen[0];
        assert_eq!(*seen, (first..first + 50).collect::<Vec<_>>(), "cycle {cycle}");
        if cycle > 0 {
            assert!(first >= 50);
        }
    }
}

#[test]
fn test_report_after_run() {
    let sink = Sink::new("sink", Some(10));

    let pipeline = PipelineBuilder::new()
        .add_stage(Counter::new("source"))
        .add_stage(sink)
        .connect("source", "out", "sink", "in")
        .build()
        .expect("Pipeline build failed");

    let pipeline = pipeline.start().unwrap().wait().unwrap();
    let reports = pipeline.report();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| !r.running));

    let sink_report = reports.iter().find(|r| r.name == "sink").unwrap();
    assert_eq!(sink_report.metrics.executions, 10);
    assert_eq!(sink_report.ports[0].capacity, 8);

    let text = reports[0].to_string();
    assert!(text.starts_with("source (1 threads, idle)"));
    assert!(pipeline.metrics_summary().contains("sink: Executions: 10"));
}

#[test]
fn test_pipeline_from_toml_config() {
    let config = PipelineConfig::from_toml_str(
        r#"
        [defaults]
        buffer_capacity = 2

        [stages.sink]
        threads = 1
        buffer_capacity = 16
        wait = "block"
        "#,
    )
    .expect("Config parse failed");

    let sink = Sink::new("sink", Some(100));
    let seen = sink.handle();
    let pipeline = PipelineBuilder::new()
        .with_config(config)
        .add_stage(Counter::new("source"))
        .add_stage(sink)
        .connect("source", "out", "sink", "in")
        .build()
        .expect("Pipeline build failed");

    assert_eq!(pipeline.stage("source").unwrap().config().buffer_capacity, 2);
    assert_eq!(pipeline.stage("sink").unwrap().config().wait, WaitStrategy::Block);

    pipeline.start().unwrap().wait().unwrap();
    assert_eq!(*seen.lock(), (0..100).collect::<Vec<i64>>());
}

#[test]
fn test_external_cancel_stops_endless_run() {
    let sink = Sink::new("sink", None);
    let seen = sink.handle();

    let pipeline = PipelineBuilder::new()
        .add_stage(Counter::new("source"))
        .add_stage(sink)
        .connect("source", "out", "sink", "in")
        .build()
        .expect("Pipeline build failed");

    let running = pipeline.start().expect("Pipeline start failed");
    let token = running.cancel_token();
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() >= 10));

    let started = Instant::now();
    token.cancel();
    assert!(running.is_cancelled());
    running.wait().expect("Wait failed");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_restart_without_reset_rejected() {
    let sink = Sink::new("sink", Some(10));
    let seen = sink.handle();

    let pipeline = PipelineBuilder::new()
        .add_stage(Counter::new("source"))
        .add_stage(sink)
        .connect("source", "out", "sink", "in")
        .build()
        .expect("Pipeline build failed");

    let pipeline = pipeline.start().unwrap().wait().unwrap();
    assert!(pipeline.stages().iter().all(|s| s.needs_reset()));

    let result = pipeline.start();
    assert!(matches!(result, Err(PipelineError::NotReset(_))));
    assert_eq!(seen.lock().len(), 10);
}
