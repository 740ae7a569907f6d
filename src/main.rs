//! tutor-narrator-rs: delivery and narration engine service.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tutor_narrator::api::{start_api, ApiState};
use tutor_narrator::config::{Config, NarrationMode};
use tutor_narrator::engine;
use tutor_narrator::gate::UnlockGate;
use tutor_narrator::history::default_history_dir;
use tutor_narrator::playback::RodioOutput;
use tutor_narrator::synth::HttpSynthesizer;

#[derive(Parser, Debug)]
#[command(name = "tutor-narrator-rs", about = "Paced transcript delivery with narration")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control API port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Narration mode: single or bulk
    #[arg(short, long)]
    mode: Option<String>,

    /// Enable narration at startup
    #[arg(long)]
    narration: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy http internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info")
    } else {
        EnvFilter::new("info,hyper=warn,reqwest=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tutor-narrator-rs starting");

    let mut config = Config::load(args.config.as_deref());
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(mode) = args.mode.as_deref() {
        config.narration.mode = NarrationMode::from_str(mode);
    }
    if args.narration {
        config.narration.enabled = true;
    }
    info!(
        "Narration: enabled={}, mode={}; synthesis at {}",
        config.narration.enabled, config.narration.mode, config.synthesis.host
    );

    let synth = Arc::new(HttpSynthesizer::new(config.synthesis.clone())?);
    let output = Arc::new(RodioOutput::new());
    let gate = UnlockGate::new();

    let (handle, task) = engine::spawn(&config, synth, output, gate);

    if config.api.enabled {
        let state = ApiState {
            engine: handle.clone(),
            history_dir: if config.history.enabled {
                default_history_dir()
            } else {
                None
            },
        };
        start_api(state, config.api.port).await;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown();
    task.await?;

    Ok(())
}
