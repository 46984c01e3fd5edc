//! pharmabot-daemon: serial command daemon for a sample-delivery robot
//!
//! The robot controller sends one text command per line over a serial port
//! and waits for a one-line answer. This daemon provides:
//! - Line-oriented serial transport with a dedicated receive thread
//! - A dispatcher mapping each command to exactly one response token
//! - Recognition, voice and operator journal collaborators
//!
//! Camera capture and QR/OCR decoding are provided by an attached
//! recognition backend; the built-in simulated backend replays boards from
//! the configuration file.

mod config;
mod events;
mod gateway;
mod lifecycle;
mod protocol;
mod serial;
mod state;
mod stations;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::TaskEvent;
use crate::gateway::{
    CommandSynthesizer, FileJournal, Journal, Recognition, SimulatedRecognition,
    UnavailableRecognition, VoicePlayer,
};
use crate::lifecycle::ShutdownSignal;
use crate::serial::SerialLink;
use crate::state::{Dispatcher, Gateways};

const DISPATCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "pharmabot-daemon starting"
    );

    let config = Config::load().context("failed to load configuration")?;
    info!(
        port = %config.serial.port,
        baud_rate = config.serial.baud_rate,
        simulation = config.simulation.enabled,
        "configuration loaded"
    );

    let shutdown = ShutdownSignal::new();

    let journal = Arc::new(
        FileJournal::create(&config.journal.log_dir).context("failed to open journal")?,
    );
    journal.system("system started");

    let voice = match VoicePlayer::start(
        Arc::new(CommandSynthesizer::new(&config.voice)),
        journal.clone(),
        config.voice.idle_poll(),
    ) {
        Ok(voice) => Arc::new(voice),
        Err(e) => {
            journal.stop();
            return Err(e).context("failed to start voice playback");
        }
    };

    let recognition: Arc<dyn Recognition> = if config.simulation.enabled {
        info!("using simulated recognition backend");
        Arc::new(SimulatedRecognition::from_config(&config.simulation))
    } else {
        warn!("no recognition backend attached, board scans will answer error");
        Arc::new(UnavailableRecognition)
    };

    // Serial receive thread -> dispatcher
    let (line_tx, line_rx) = mpsc::channel(config.serial.line_queue);
    // Dispatcher -> task event log
    let (event_tx, mut event_rx) = broadcast::channel::<TaskEvent>(64);

    let link = match SerialLink::connect(&config.serial, line_tx) {
        Ok(link) => Arc::new(link),
        Err(e) => {
            error!(error = %e, "failed to open serial link");
            journal.communication_error("connect", &e.to_string());
            voice.stop();
            journal.stop();
            return Err(e).context("serial link unavailable");
        }
    };

    let dispatcher = Dispatcher::new(
        Arc::new(config.stations.clone()),
        Gateways {
            recognition,
            voice: voice.clone(),
            journal: journal.clone(),
        },
        config.recognition.clone(),
        event_tx,
    );

    let running = Arc::new(AtomicBool::new(true));
    let mut dispatcher = match dispatcher.spawn(line_rx, link.clone(), Arc::clone(&running)) {
        Ok(handle) => handle,
        Err(e) => {
            link.disconnect();
            voice.stop();
            journal.stop();
            return Err(e).context("failed to start dispatcher");
        }
    };

    info!("daemon initialized, waiting for commands");

    tokio::select! {
        _ = dispatcher.exited() => {
            info!("dispatcher exited");
        }

        _ = async {
            loop {
                match event_rx.recv().await {
                    Ok(event) => info!(%event, "task event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "task event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("task event handler exited");
        }

        result = shutdown.wait() => {
            match result {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(error = %e, "failed to install signal handlers"),
            }
        }
    }

    info!("shutting down...");

    running.store(false, Ordering::SeqCst);
    // Closes the line channel once the receive thread is gone
    link.disconnect();

    if let Some(status) = dispatcher.join(DISPATCHER_JOIN_TIMEOUT) {
        match serde_json::to_string(&status) {
            Ok(json) => info!(status = %json, "final dispatcher status"),
            Err(e) => warn!(error = %e, "failed to serialize dispatcher status"),
        }
    }

    if voice.is_speaking() {
        warn!("dropping pending announcements");
    }
    voice.stop();
    journal.stop();

    info!("pharmabot-daemon stopped");

    Ok(())
}
