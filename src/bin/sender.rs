//! Audio Sender Application
//!
//! Captures one local input device, encodes it with Opus, and fans the
//! frames out to every listener that announces itself on the control port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lancast::{
    audio::{capture::CpalCapture, device::list_devices},
    codec::{CodecParams, OpusEncoder},
    config::AppConfig,
    events::SenderObserver,
    network::{
        discovery::{BroadcastDiscovery, Discovery},
        sender::SenderPipeline,
    },
};

/// Logs joins and leaves as they happen; the status loop covers the rest.
struct LogEvents;

impl SenderObserver for LogEvents {
    fn listener_joined(&self, addr: SocketAddr, display_name: &str) {
        tracing::info!("{} joined from {}", display_name, addr.ip());
    }

    fn listener_left(&self, addr: SocketAddr, display_name: &str) {
        tracing::info!("{} left ({})", display_name, addr.ip());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting lancast sender");

    // Load config, writing defaults on first run so there is a file to edit
    let config = AppConfig::load()?;
    if let Some(path) = AppConfig::default_path() {
        if !path.exists() {
            if let Err(e) = config.save() {
                tracing::debug!("Could not write default config: {}", e);
            }
        }
    }

    // List available devices
    println!("\n=== Available Audio Devices ===");
    let devices = list_devices();
    for device in &devices {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    // Capture device from args, falling back to config, then system default
    let device_id = std::env::args()
        .nth(1)
        .or_else(|| config.sender.device_id.clone());

    let mut capture = CpalCapture::new(
        device_id.as_deref(),
        config.audio.sample_rate,
        config.audio.channels,
    )
    .context("opening capture device")?;
    capture.start().context("starting capture")?;
    tracing::info!("Audio capture started");

    let params = CodecParams::from(&config.audio);
    let encoder = OpusEncoder::new(&params).context("creating encoder")?;
    tracing::info!(
        "Opus encoder initialized: {}Hz, {} channels, {} samples/frame ({}ms)",
        params.sample_rate,
        params.channels,
        params.frame_len() / params.channels as usize,
        params.frame_ms,
    );

    let mut pipeline = SenderPipeline::new(config.clone(), Arc::new(LogEvents));
    pipeline.start(Box::new(capture), Box::new(encoder))?;
    let registry = pipeline.registry();

    let mut discovery =
        BroadcastDiscovery::new(&config.sender.service_name, config.discovery_port());
    if let Err(e) = discovery.advertise(config.stream_port()) {
        tracing::warn!("Discovery disabled, receivers must be given our address: {}", e);
    }

    tracing::info!(
        "Broadcasting on port {} ({} Hz, {} ch, {} kbps) - press Ctrl+C to stop",
        config.stream_port(),
        config.audio.sample_rate,
        config.audio.channels,
        config.audio.bitrate / 1000,
    );

    let mut status = tokio::time::interval(Duration::from_secs(5));
    status.tick().await; // the first tick completes immediately
    loop {
        tokio::select! {
            _ = status.tick() => {
                let stats = pipeline.stats();
                let listeners = registry.snapshot();
                tracing::info!(
                    "Stats: {} frames encoded, {} packets sent, {:.1} KB sent, {} send failures, {} listeners",
                    stats.frames_encoded,
                    stats.packets_sent,
                    stats.bytes_sent as f64 / 1024.0,
                    stats.send_failures,
                    listeners.len(),
                );
                for info in &listeners {
                    let rtt = info
                        .rtt_ms
                        .map_or_else(|| "-".to_string(), |ms| format!("{}ms", ms));
                    tracing::info!(
                        "  {} @ {} rtt={} {}",
                        info.display_name(),
                        info.addr.ip(),
                        rtt,
                        if info.enabled { "streaming" } else { "muted" },
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    discovery.unadvertise();
    pipeline.stop();
    Ok(())
}
