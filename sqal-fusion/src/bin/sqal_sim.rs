//! sqal-sim - frame simulator for the fusion service
//!
//! Generates synthetic depth/spectral frames or replays a JSON-lines
//! recording at a fixed throughput, either into an in-process pipeline or
//! against a running `sqal-fusion` server.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqal_common::config::SqalConfig;
use sqal_common::events::EventBus;
use sqal_common::types::FramePayload;
use sqal_fusion::simulator::{recording, replay, FrameGenerator, FrameSink, QualityProfile};
use sqal_fusion::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "sqal-sim")]
#[command(about = "Frame simulator for sqal-fusion")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write synthetic frames to a JSON-lines recording
    Generate {
        #[command(flatten)]
        source: SyntheticArgs,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Send frames to a pipeline
    Run {
        #[command(flatten)]
        source: SyntheticArgs,

        /// Replay this recording instead of generating frames
        #[arg(short, long)]
        recording: Option<PathBuf>,

        /// Frames per second
        #[arg(long, default_value = "50")]
        rate: NonZeroU32,

        /// Server base URL; runs an in-process pipeline when omitted
        #[arg(long, env = "SQAL_SERVER")]
        server: Option<String>,

        /// Configuration for the in-process pipeline
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug)]
struct SyntheticArgs {
    /// Quality profile of the synthetic product
    #[arg(long, value_enum, default_value = "good")]
    profile: QualityProfile,

    /// Number of samples (two frames each)
    #[arg(short = 'n', long, default_value = "100")]
    samples: usize,

    /// RNG seed for reproducible output
    #[arg(long)]
    seed: Option<u64>,

    /// Sample id prefix
    #[arg(long, default_value = "SIM")]
    prefix: String,
}

impl SyntheticArgs {
    fn frames(&self) -> Vec<FramePayload> {
        let generator = match self.seed {
            Some(seed) => FrameGenerator::seeded(self.profile, seed),
            None => FrameGenerator::new(self.profile),
        };
        generator.with_prefix(self.prefix.clone()).samples(self.samples)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sqal_sim=info,sqal_fusion=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Generate { source, output } => {
            let frames = source.frames();
            recording::save_recording(&output, &frames)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Wrote {} frames ({} profile) to {}",
                frames.len(),
                source.profile,
                output.display()
            );
        }
        Command::Run {
            source,
            recording: recording_path,
            rate,
            server,
            config,
        } => {
            let frames = match &recording_path {
                Some(path) => recording::read_recording(path)
                    .with_context(|| format!("Failed to read recording {}", path.display()))?,
                None => source.frames(),
            };

            match server {
                Some(url) => {
                    info!("Sending {} frames to {} at {} frames/s", frames.len(), url, rate);
                    let sink = FrameSink::http(&url).context("Failed to build HTTP client")?;
                    let summary = replay(frames, &sink, rate).await.context("Replay failed")?;
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                None => run_in_process(frames, rate, config).await?,
            }
        }
    }

    Ok(())
}

/// Run frames through a local pipeline and print the grade distribution
async fn run_in_process(
    frames: Vec<FramePayload>,
    rate: NonZeroU32,
    config: Option<PathBuf>,
) -> Result<()> {
    let (config, _) = SqalConfig::load_or_default(config.as_deref())
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    let wait = std::time::Duration::from_millis(config.fusion.timeout_ms);

    let event_bus = EventBus::new(config.delivery.event_bus_capacity);
    let pipeline = Pipeline::from_config(&config, event_bus);
    let results = Arc::new(pipeline.subscribe("simulator"));
    let sink = FrameSink::InProcess(pipeline.clone());

    let collector_results = Arc::clone(&results);
    let collector = tokio::spawn(async move {
        let mut grades = BTreeMap::new();
        let mut low_confidence = 0u64;
        while let Some(result) = collector_results.recv().await {
            *grades.entry(result.final_grade.to_string()).or_insert(0u64) += 1;
            if result.low_confidence {
                low_confidence += 1;
            }
        }
        (grades, low_confidence)
    });

    info!("Running {} frames through an in-process pipeline at {} frames/s", frames.len(), rate);
    let summary = replay(frames, &sink, rate).await.context("Replay failed")?;

    // Let partial samples reach their timeout, then end the result stream
    tokio::time::sleep(wait + std::time::Duration::from_millis(100)).await;
    results.close();
    let (grades, low_confidence) = collector.await.context("Result collector failed")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("Grades: {:?}", grades);
    println!("Low confidence: {}", low_confidence);
    println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);
    pipeline.shutdown();
    Ok(())
}
