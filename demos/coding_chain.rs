//! A toy communication chain: random bits, 3x repetition code, antipodal
//! mapping with additive noise, majority decoding, and a monitor that counts
//! bit errors. The source output fans out to both the encoder and the monitor.
//!
//! Pass a TOML file as the first argument to override stage settings.
//! Run with `RUST_LOG=debug` to see binding and worker logs.

use buffered_pipeline::{
    Frame, Map, PipelineBuilder, PipelineConfig, PortSpec, Result, ScalarKind, Task,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const K: usize = 64;
const REPEAT: usize = 3;
const N: usize = K * REPEAT;
const FRAMES: u64 = 2_000;

/// xorshift64, good enough for a demo
#[derive(Clone)]
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    /// Roughly uniform in [-1, 1)
    fn unit(&mut self) -> f32 {
        (self.next() >> 40) as f32 / (1u64 << 23) as f32 - 1.0
    }
}

#[derive(Clone)]
struct Source {
    rng: XorShift,
}

impl Task for Source {
    fn name(&self) -> &str {
        "source"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output("bits", ScalarKind::Int8, K)]
    }

    fn execute(&mut self, frame: &mut Frame) -> Result<()> {
        for bit in frame.output::<i8>("bits")? {
            *bit = (self.rng.next() & 1) as i8;
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Channel {
    rng: XorShift,
    amplitude: f32,
}

impl Task for Channel {
    fn name(&self) -> &str {
        "channel"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("symbols", ScalarKind::Float32, N),
            PortSpec::output("noisy", ScalarKind::Float32, N),
        ]
    }

    fn execute(&mut self, frame: &mut Frame) -> Result<()> {
        let (src, dst) = frame.io::<f32, f32>("symbols", "noisy")?;
        for (d, s) in dst.iter_mut().zip(src) {
            *d = *s + self.amplitude * self.rng.unit();
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Monitor {
    frames: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl Task for Monitor {
    fn name(&self) -> &str {
        "monitor"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("sent", ScalarKind::Int8, K),
            PortSpec::input("decoded", ScalarKind::Int8, K),
        ]
    }

    fn execute(&mut self, frame: &mut Frame) -> Result<()> {
        let sent = frame.input::<i8>("sent")?;
        let decoded = frame.input::<i8>("decoded")?;
        let wrong = sent.iter().zip(decoded).filter(|(a, b)| a != b).count();
        self.errors.fetch_add(wrong as u64, Ordering::Relaxed);
        if self.frames.fetch_add(1, Ordering::Relaxed) + 1 >= FRAMES {
            frame.request_stop();
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };

    let frames = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    let pipeline = PipelineBuilder::new()
        .with_config(config)
        .add_stage(Source { rng: XorShift(0x9e37_79b9_7f4a_7c15) })
        .add_stage(Map::new("encoder", K, N, |src: &[i8], dst: &mut [i8]| {
            for (chunk, bit) in dst.chunks_mut(REPEAT).zip(src) {
                chunk.fill(*bit);
            }
        }))
        .add_stage(Map::new("modulator", N, N, |src: &[i8], dst: &mut [f32]| {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = if *s == 0 { 1.0 } else { -1.0 };
            }
        }))
        .add_stage(Channel {
            rng: XorShift(0x2545_f491_4f6c_dd1d),
            amplitude: 1.2,
        })
        .add_stage(Map::new("decoder", N, K, |src: &[f32], dst: &mut [i8]| {
            for (d, chunk) in dst.iter_mut().zip(src.chunks(REPEAT)) {
                *d = i8::from(chunk.iter().sum::<f32>() < 0.0);
            }
        }))
        .add_stage(Monitor {
            frames: Arc::clone(&frames),
            errors: Arc::clone(&errors),
        })
        .connect("source", "bits", "encoder", "in")
        .connect("source", "bits", "monitor", "sent")
        .connect("encoder", "out", "modulator", "in")
        .connect("modulator", "out", "channel", "symbols")
        .connect("channel", "noisy", "decoder", "in")
        .connect("decoder", "out", "monitor", "decoded")
        .build()?;

    let running = pipeline.start()?;
    let pipeline = running.wait()?;

    for report in pipeline.report() {
        println!("{report}");
    }

    let frames = frames.load(Ordering::Relaxed);
    let errors = errors.load(Ordering::Relaxed);
    let ber = errors as f64 / (frames * K as u64) as f64;
    info!(frames, errors, ber, "simulation finished");
    println!("frames: {frames}, bit errors: {errors}, BER: {ber:.3e}");
    Ok(())
}
