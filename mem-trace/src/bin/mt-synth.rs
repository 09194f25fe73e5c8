use anyhow::{Context, Result};
use clap::Parser;

use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;

use memtrace::instrument::{self, InstructionInfo, Probe, RecordMode};
use memtrace::{Collector, Config, GateState, MemTracer, ThreadId};
use tracing_subscriber::filter::EnvFilter;

/// Runs a synthetic multi-threaded workload through the memory trace collector.
///
/// Each worker thread executes a fixed loop of loads, stores and register-only instructions over
/// its own array. The first thread brackets the loop with the region-of-interest markers unless
/// `--no-roi` is given.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Trace output file.
    #[arg(short, long, default_value = memtrace::config::DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Number of worker threads.
    #[arg(short, long, default_value_t = 2)]
    threads: u32,

    /// Loop iterations per thread.
    #[arg(short, long, default_value_t = 1000)]
    iterations: u64,

    /// Capture buffer size in pages.
    #[arg(short, long, default_value_t = memtrace::config::DEFAULT_BUFFER_PAGES)]
    pages: usize,

    /// Also record instructions without a memory operand.
    #[arg(long)]
    all_instructions: bool,

    /// Run without region-of-interest markers; capture follows the initial gate state.
    #[arg(long)]
    no_roi: bool,

    /// Close the trace at the end of the region of interest.
    #[arg(long)]
    roi_only: bool,
}

const LOOP_BASE: u64 = 0x40_1000;
const ARRAY_BASE: u64 = 0x7f00_0000_0000;
const ARRAY_STRIDE: u64 = 0x10_0000;

/// `a[i] += b[i]; n++` as a sequence of instructions.
fn loop_body() -> [InstructionInfo; 4] {
    [
        InstructionInfo {
            pc: LOOP_BASE,
            read_size: Some(8),
            ..Default::default()
        },
        InstructionInfo {
            pc: LOOP_BASE + 4,
            read_size: Some(8),
            has_second_read: true,
            ..Default::default()
        },
        InstructionInfo {
            pc: LOOP_BASE + 8,
            write_size: Some(8),
            ..Default::default()
        },
        InstructionInfo {
            pc: LOOP_BASE + 12,
            ..Default::default()
        },
    ]
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("MT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config {
        output: args.output.clone(),
        buffer_pages: args.pages,
        initial_gate: if args.no_roi {
            GateState::Enabled
        } else {
            GateState::Disabled
        },
        roi_only: args.roi_only,
        record_mode: if args.all_instructions {
            RecordMode::AllInstructions
        } else {
            RecordMode::MemoryOnly
        },
        ..Config::default()
    };

    let tracer = Arc::new(MemTracer::open(&config).context("failed to start the collector")?);

    let program: Vec<Vec<Probe>> = loop_body()
        .iter()
        .map(|info| instrument::plan(info, config.record_mode))
        .collect();
    let program = Arc::new(program);

    let threads = args.threads.max(1);
    tracing::debug! {
        threads = threads,
        iterations = args.iterations,
        buffer_records = tracer.buffer().capacity(),
        "starting synthetic workload"
    };
    let start = Arc::new(Barrier::new(threads as usize));
    let finish = Arc::new(Barrier::new(threads as usize));

    let handles: Vec<_> = (0..threads)
        .map(|n| {
            let tracer = Arc::clone(&tracer);
            let program = Arc::clone(&program);
            let start = Arc::clone(&start);
            let finish = Arc::clone(&finish);
            let roi = !args.no_roi && n == 0;
            let iterations = args.iterations;

            thread::spawn(move || {
                let worker = Worker {
                    tid: ThreadId::new(n),
                    roi,
                    iterations,
                };
                // a worker that cannot trace would leave the others waiting at a barrier
                if let Err(err) = worker.run(&*tracer, &program, &start, &finish) {
                    tracing::error!(thread = n, error = %err, "collector failed, exiting");
                    std::process::exit(1);
                }
            })
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            anyhow::bail!("worker thread panicked");
        }
    }

    tracer.on_exit()?;
    eprintln!("trace written to {}", args.output.display());

    Ok(())
}

struct Worker {
    tid: ThreadId,
    roi: bool,
    iterations: u64,
}

impl Worker {
    fn run<C: Collector + ?Sized>(
        &self,
        tracer: &C,
        program: &[Vec<Probe>],
        start: &Barrier,
        finish: &Barrier,
    ) -> Result<()> {
        let tid = self.tid;
        tracer.on_thread_start(tid)?;

        if self.roi {
            tracer.on_region_enter(tid)?;
        }
        start.wait();

        let base = ARRAY_BASE + u64::from(tid.get()) * ARRAY_STRIDE;
        for i in 0..self.iterations {
            for (slot, probes) in program.iter().enumerate() {
                for probe in probes {
                    let address = base + (slot as u64) * 0x1_0000 + i * 8;
                    tracer.on_memory_access(probe.record(address, tid))?;
                }
            }
        }

        finish.wait();
        if self.roi {
            tracer.on_region_exit(tid)?;
        }
        tracer.on_thread_end(tid, 0)?;
        Ok(())
    }
}
