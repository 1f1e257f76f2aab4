//! tomoflow - command line front end
//!
//! Builds a raw-file pipeline (source, optional kernel stage, writer) and
//! runs it on the available compute nodes.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tomoflow::tasks::{KernelTask, RawSource, RawSourceConfig, RawWriter};
use tomoflow::{EngineBuilder, EngineConfig, Graph, TaskState};

#[derive(Parser)]
#[command(name = "tomoflow")]
#[command(about = "Streaming dataflow engine for GPU image pipelines", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Buffers per channel (overrides the configuration file)
    #[arg(short, long)]
    pool_size: Option<usize>,

    /// Record kernel timings
    #[arg(long)]
    profile: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List compute nodes
    Devices,

    /// Read raw frames, optionally run a kernel on them, write the result
    Run {
        /// Directory with input frames
        input: PathBuf,

        /// Directory for output frames
        #[arg(short, long, default_value = "out")]
        output: PathBuf,

        #[arg(long)]
        width: usize,

        #[arg(long)]
        height: usize,

        /// Bits per input sample (8, 16 or 32)
        #[arg(short, long, default_value_t = 32)]
        bits: u16,

        /// Input file extension
        #[arg(long, default_value = "raw")]
        suffix: String,

        /// Maximum number of frames, -1 for all
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        count: i64,

        /// 1-based index of the first frame, -1 for the first one
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        nth: i64,

        /// Scale 8/16-bit samples to [0, 1]
        #[arg(long)]
        normalize: bool,

        /// Kernel stage as MODULE:ENTRY, resolved on the kernel paths
        #[arg(short, long)]
        kernel: Option<String>,

        /// Output file prefix
        #[arg(long, default_value = "frame")]
        prefix: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(pool_size) = cli.pool_size {
        config.pool_size = pool_size;
    }
    config.profiling |= cli.profile;

    let engine = EngineBuilder::from_config(config).build()?;

    match cli.command {
        Commands::Devices => {
            for node in engine.resources().nodes() {
                let info = node.info();
                println!(
                    "{:>2}  {:?}  {} ({}){}",
                    node.id(),
                    node.kind(),
                    info.device_name,
                    info.backend,
                    if info.unified_memory { ", unified memory" } else { "" }
                );
            }
        }

        Commands::Run {
            input,
            output,
            width,
            height,
            bits,
            suffix,
            count,
            nth,
            normalize,
            kernel,
            prefix,
        } => {
            let source = RawSource::new(RawSourceConfig {
                path: input,
                suffix,
                width,
                height,
                bits_per_sample: bits,
                count,
                nth,
                normalize,
            })?;

            let mut graph = Graph::new();
            let mut last = graph.add_task(source);

            if let Some(stage_arg) = kernel {
                let Some((module, entry)) = stage_arg.split_once(':') else {
                    bail!("kernel must be given as MODULE:ENTRY, got `{stage_arg}`");
                };
                let stage = graph.add_task(KernelTask::new(module, entry, 1).with_rank(2));
                graph.connect(last, stage, 0)?;
                last = stage;
            }

            let writer = graph.add_task(RawWriter::new(&output, prefix));
            graph.connect(last, writer, 0)?;

            let report = engine.run(graph)?;

            for task in &report.tasks {
                let status = if task.state == TaskState::Finished { "ok" } else { "FAILED" };
                println!(
                    "{:<16} node {}  {:>6} frame(s)  {:>10.2?}  {}",
                    task.name, task.node, task.processed, task.elapsed, status
                );
            }
            for kernel in &report.profile {
                println!(
                    "  kernel {:<24} {:>6} call(s)  {:>10.2?}",
                    kernel.kernel, kernel.calls, kernel.total
                );
            }

            report.into_result()?;
        }
    }

    Ok(())
}
