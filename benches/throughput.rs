use buffered_pipeline::{
    CancelToken, Frame, Passthrough, PipelineBuilder, PortSpec, Result as PipelineResult,
    RingBuffer, ScalarKind, StageConfig, Task, WaitStrategy,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WIDTH: usize = 16;

#[derive(Clone)]
struct Source {
    next: f32,
}

impl Task for Source {
    fn name(&self) -> &str {
        "source"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output("out", ScalarKind::Float32, WIDTH)]
    }

    fn execute(&mut self, frame: &mut Frame) -> PipelineResult<()> {
        frame.output::<f32>("out")?.fill(self.next);
        self.next += 1.0;
        Ok(())
    }
}

#[derive(Clone)]
struct Drain {
    left: usize,
}

impl Task for Drain {
    fn name(&self) -> &str {
        "drain"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::input("in", ScalarKind::Float32, WIDTH)]
    }

    fn execute(&mut self, frame: &mut Frame) -> PipelineResult<()> {
        black_box(frame.input::<f32>("in")?);
        self.left -= 1;
        if self.left == 0 {
            frame.request_stop();
        }
        Ok(())
    }
}

fn run_chain(relays: usize, records: usize, wait: WaitStrategy) {
    let config = StageConfig::new(1, 64).with_wait(wait);
    let mut builder = PipelineBuilder::new().add_stage_with(Source { next: 0.0 }, config);
    let mut previous = "source".to_string();
    for i in 0..relays {
        let name = format!("relay{i}");
        builder = builder
            .add_stage_with(Passthrough::<f32>::new(name.clone(), WIDTH), config)
            .connect(previous, "out", name.clone(), "in");
        previous = name;
    }
    let pipeline = builder
        .add_stage_with(Drain { left: records }, config)
        .connect(previous, "out", "drain", "in")
        .build()
        .expect("Build failed");

    let _ = pipeline.start().expect("Start failed").wait();
}

fn benchmark_ring_buffer_spsc(c: &mut Criterion) {
    c.bench_function("ring_buffer_spsc_10000_records", |b| {
        b.iter(|| {
            let buffer = Arc::new(RingBuffer::<f32>::new(64, WIDTH).expect("Buffer failed"));
            let producer = {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    let cancel = CancelToken::new();
                    let record = [1.0f32; WIDTH];
                    for _ in 0..10_000 {
                        buffer.wait_push_cancellable(black_box(&record), &cancel);
                    }
                })
            };
            let mut out = [0.0f32; WIDTH];
            for _ in 0..10_000 {
                buffer.wait_pop(&mut out);
            }
            producer.join().expect("Producer panicked");
        });
    });
}

fn benchmark_two_stage_throughput(c: &mut Criterion) {
    c.bench_function("two_stage_10000_records", |b| {
        b.iter(|| run_chain(0, 10_000, WaitStrategy::Spin));
    });
}

fn benchmark_four_stage_throughput(c: &mut Criterion) {
    c.bench_function("four_stage_10000_records", |b| {
        b.iter(|| run_chain(2, 10_000, WaitStrategy::Spin));
    });
}

fn benchmark_blocking_waits(c: &mut Criterion) {
    c.bench_function("four_stage_10000_records_blocking", |b| {
        b.iter(|| run_chain(2, 10_000, WaitStrategy::Block));
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_ring_buffer_spsc, benchmark_two_stage_throughput,
        benchmark_four_stage_throughput, benchmark_blocking_waits
);
criterion_main!(benches);
