//! framepipe — CLI entrypoint.
//!
//! ```bash
//! framepipe run -i frames.raw --width 640 --height 480 -o detected.raw
//! framepipe run -i frames.raw --width 640 --height 480 --transform mock --json
//! framepipe stress --frames 5000 --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};

use framepipe::io::sinks::{NullSink, RawFileSink};
use framepipe::io::sources::RawFileSource;
use framepipe::transforms::{EdgeTransform, MockTransform};
use framepipe::{FrameSink, Pipeline, PipelineConfig, Result, RunReport, Transform};

#[derive(Parser, Debug)]
#[command(
    name = "framepipe",
    version,
    about = "Bounded frame-processing pipeline with backpressure and cooperative shutdown",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline over a raw grayscale frame file.
    Run(RunArgs),
    /// Run a synthetic self-check without real I/O.
    Stress(StressArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Input file of tightly packed 8-bit grayscale frames.
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Frame width in pixels.
    #[arg(long = "width")]
    width: u32,

    /// Frame height in pixels.
    #[arg(long = "height")]
    height: u32,

    /// Optional output file; frame payloads are written back in order.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Transform to apply to each frame.
    #[arg(long = "transform", value_enum, default_value_t = TransformArg::Edge)]
    transform: TransformArg,

    /// Sobel gradient threshold for the edge transform.
    #[arg(long = "edge-threshold", default_value_t = 128)]
    edge_threshold: u32,

    #[command(flatten)]
    tuning: TuningArgs,

    /// Emit the final report as JSON on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct StressArgs {
    /// Number of synthetic frames to push through.
    #[arg(long = "frames", default_value_t = 1000)]
    frames: u64,

    #[command(flatten)]
    tuning: TuningArgs,

    /// Emit the final report as JSON on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// Channel capacity: source → transform.
    #[arg(long = "raw-cap", default_value_t = 4)]
    raw_cap: usize,

    /// Channel capacity: transform → sink.
    #[arg(long = "detected-cap", default_value_t = 4)]
    detected_cap: usize,

    /// Offloader worker bound.
    #[arg(long = "workers", default_value_t = 4)]
    workers: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransformArg {
    /// Sobel gradient edge detection.
    Edge,
    /// Instant passthrough with no detections.
    Mock,
}

impl TuningArgs {
    fn to_config(&self) -> PipelineConfig {
        PipelineConfig {
            raw_capacity: self.raw_cap,
            detected_capacity: self.detected_cap,
            workers: self.workers,
            ..PipelineConfig::default()
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    let result = match cli.command {
        Commands::Run(args) => rt.block_on(cmd_run(args)),
        Commands::Stress(args) => rt.block_on(cmd_stress(args)),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, code = e.error_code(), "Command failed");
            std::process::exit(e.error_code() as i32);
        }
    }
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    tracing::info!(
        input = %args.input.display(),
        width = args.width,
        height = args.height,
        transform = ?args.transform,
        "framepipe starting"
    );

    let pipeline = Pipeline::new(args.tuning.to_config());
    spawn_interrupt_handler(&pipeline);

    let source = RawFileSource::new(&args.input, args.width, args.height);
    let transform: Arc<dyn Transform> = match args.transform {
        TransformArg::Edge => Arc::new(EdgeTransform::new(args.edge_threshold)),
        TransformArg::Mock => Arc::new(MockTransform::default()),
    };
    let sink: Box<dyn FrameSink> = match &args.output {
        Some(path) => Box::new(RawFileSink::create(path)?),
        None => Box::new(NullSink::default()),
    };

    let report = pipeline.run(source, transform, sink, None).await?;
    emit_report("run", &report, args.json);
    Ok(())
}

async fn cmd_stress(args: StressArgs) -> Result<()> {
    let report = Pipeline::stress(args.tuning.to_config(), args.frames).await?;
    emit_report("stress", &report, args.json);
    Ok(())
}

/// First Ctrl-C requests a cooperative stop; the run then winds down on its
/// own and reports what it consumed.
fn spawn_interrupt_handler(pipeline: &Pipeline) {
    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, requesting stop");
            cancel.cancel();
        }
    });
}

fn emit_report(command: &str, report: &RunReport, json: bool) {
    if json {
        let payload = serde_json::json!({
            "command": command,
            "ok": true,
            "report": report,
        });
        println!("{payload}");
    } else {
        println!(
            "{command}: ok frames_read={} frames_consumed={} transform_failures={} elapsed_ms={} peak_depths={}/{}",
            report.frames_read,
            report.frames_consumed,
            report.transform_failures,
            report.elapsed_ms,
            report.raw_peak_depth,
            report.detected_peak_depth
        );
    }
}
