mod config;
mod console;
mod devices;

use crate::config::Config;
use crate::console::ConsoleObserver;
use crate::devices::{CpalMicrophone, CpalSpeaker, NoMicrophone, NullSink};
use anyhow::{Context, Result};
use clap::Parser;
use duplex_voice::{AudioSink, Conductor, Microphone, WsConnector};
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Duplex voice client for the recognition and generation backends")]
struct Cli {
    /// Input device name (defaults to the system default)
    #[arg(long)]
    input_device: Option<String>,
    /// Output device name (defaults to the system default)
    #[arg(long)]
    output_device: Option<String>,
    /// Print the available audio devices and exit
    #[arg(long)]
    list_devices: bool,
    /// Run without microphone or speaker
    #[arg(long)]
    text_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();

    if args.list_devices {
        println!("inputs:\n{}", duplex_voice_utils::device::get_available_inputs()?);
        println!("outputs:\n{}", duplex_voice_utils::device::get_available_outputs()?);
        return Ok(());
    }

    // --- 4. Audio Devices ---
    let (microphone, sink): (Box<dyn Microphone>, Arc<dyn AudioSink>) = if args.text_only {
        tracing::info!("text-only mode: no audio devices");
        (Box::new(NoMicrophone), Arc::new(NullSink))
    } else {
        let speaker = CpalSpeaker::new(args.output_device, config.segment_format)
            .context("Failed to open audio output")?;
        (
            Box::new(CpalMicrophone::new(args.input_device)),
            Arc::new(speaker),
        )
    };

    // --- 5. Client ---
    tracing::info!(
        "recognition at {}, generation at {}",
        config.recognition_url,
        config.generation_url
    );
    let (mut conductor, handle) = Conductor::new(
        config.client_config(),
        Arc::new(WsConnector::new()),
        microphone,
        sink,
    );
    conductor.subscribe(Box::new(ConsoleObserver::default()));
    let mut event_loop = tokio::spawn(conductor.run());

    // stdin blocks, so it gets a plain thread rather than a task.
    let console_handle = handle.clone();
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || console::run(console_handle))
        .context("Failed to start console")?;

    tokio::select! {
        result = &mut event_loop => {
            result.context("Event loop panicked")?;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down...");
        }
    }

    if let Err(e) = handle.shutdown() {
        tracing::debug!("{}", e);
    }
    event_loop.await.context("Event loop panicked")?;
    tracing::info!("Shutting down...");
    Ok(())
}
