use clap::{Parser, Subcommand};

mod config;
mod frame;
mod mesh;
mod samples;

use self::{config::DemoConfig, samples::Sample};

#[derive(Debug, Subcommand)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Single triangle traced every frame.
    HelloTriangle,
    /// Triangle refitted every frame from double-buffered vertices.
    DynamicBlas,
    /// Instances moving every frame, top-level structure rebuilt each time.
    DynamicTlas,
    /// Static meshes compacted once sizes are known.
    Compaction,
    /// Meshes with per-geometry materials and shared transforms.
    MeshMaterials,
    /// Procedural boxes.
    BoxIntersections,
    /// Runs every sample in sequence.
    All,
}

#[derive(Debug, Parser)]
#[command(name = "acst-demo")]
#[command(about = "Acceleration structure samples on a simulated device")]
#[command(rename_all = "kebab-case")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Number of frames to run each sample.
    #[arg(long, value_name = "count")]
    frames: Option<u32>,

    /// Number of frames recorded ahead of the device.
    #[arg(long, value_name = "count")]
    frames_in_flight: Option<u32>,

    /// Frames before compacted sizes can be read.
    #[arg(long, value_name = "frames")]
    query_latency: Option<u64>,

    /// Device memory budget in bytes.
    #[arg(long, value_name = "bytes")]
    memory_budget: Option<usize>,
}

fn main() -> miette::Result<()> {
    install_tracing_subscriber();

    let cli = Cli::parse();
    let mut config = DemoConfig::load()?;

    if let Some(frames) = cli.frames {
        config.frames = frames;
    }
    if let Some(frames_in_flight) = cli.frames_in_flight {
        config.frames_in_flight = frames_in_flight;
    }
    if let Some(query_latency) = cli.query_latency {
        config.query_latency = query_latency;
    }
    if let Some(memory_budget) = cli.memory_budget {
        config.memory_budget = Some(memory_budget);
    }

    tracing::debug!("Running with {config:?}");

    let samples: &[Sample] = match cli.command.unwrap_or(Command::All) {
        Command::HelloTriangle => &[Sample::HelloTriangle],
        Command::DynamicBlas => &[Sample::DynamicBlas],
        Command::DynamicTlas => &[Sample::DynamicTlas],
        Command::Compaction => &[Sample::Compaction],
        Command::MeshMaterials => &[Sample::MeshMaterials],
        Command::BoxIntersections => &[Sample::BoxIntersections],
        Command::All => &Sample::ALL,
    };

    for sample in samples {
        let summary = sample.run(&config)?;
        println!(
            "{}: {} frames, {} commands, {} dispatches",
            sample.name(),
            summary.frames,
            summary.commands,
            summary.traces.len()
        );
    }

    Ok(())
}

fn install_tracing_subscriber() {
    use tracing_subscriber::layer::SubscriberExt as _;
    if let Err(err) = tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish()
            .with(tracing_error::ErrorLayer::default()),
    ) {
        panic!("Failed to install tracing subscriber: {}", err);
    }
}
