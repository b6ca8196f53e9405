//! One producer feeding two consumers that drain at different rates.
//! Both see the same sequence; the slow one holds the fast one back once
//! its buffer fills.

use buffered_pipeline::{
    Frame, PipelineBuilder, PortSpec, Result, ScalarKind, StageConfig, Task, WaitStrategy,
};
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct Ticker {
    next: i32,
}

impl Task for Ticker {
    fn name(&self) -> &str {
        "ticker"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output("ticks", ScalarKind::Int32, 1)]
    }

    fn execute(&mut self, frame: &mut Frame) -> Result<()> {
        frame.output::<i32>("ticks")?[0] = self.next;
        self.next += 1;
        Ok(())
    }
}

#[derive(Clone)]
struct Reader {
    name: &'static str,
    delay: Duration,
    last: Option<i32>,
}

impl Task for Reader {
    fn name(&self) -> &str {
        self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::input("ticks", ScalarKind::Int32, 1)]
    }

    fn execute(&mut self, frame: &mut Frame) -> Result<()> {
        thread::sleep(self.delay);
        let tick = frame.input::<i32>("ticks")?[0];
        if let Some(last) = self.last {
            debug_assert_eq!(tick, last + 1);
        }
        self.last = Some(tick);
        Ok(())
    }

    fn on_shutdown(&mut self, worker: usize) -> Result<()> {
        info!(reader = self.name, worker, last = ?self.last, "reader done");
        Ok(())
    }
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let pipeline = PipelineBuilder::new()
        .add_stage_with(Ticker { next: 0 }, StageConfig::new(1, 4).with_wait(WaitStrategy::Block))
        .add_stage(Reader {
            name: "fast",
            delay: Duration::from_micros(50),
            last: None,
        })
        .add_stage(Reader {
            name: "slow",
            delay: Duration::from_millis(2),
            last: None,
        })
        .connect("ticker", "ticks", "fast", "ticks")
        .connect("ticker", "ticks", "slow", "ticks")
        .build()?;

    let running = pipeline.start()?;
    for _ in 0..5 {
        thread::sleep(Duration::from_millis(100));
        for report in running.report() {
            println!("{report}");
        }
    }
    running.shutdown()?;
    Ok(())
}
