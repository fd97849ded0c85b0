//! Audio Receiver Application
//!
//! Joins a sender by address or discovery, buffers the incoming stream
//! against jitter, decodes, and plays it on a local output device.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lancast::{
    audio::{device::list_devices, playback::CpalPlayback},
    codec::{CodecParams, DecoderMode, OpusDecoder},
    config::AppConfig,
    events::ReceiverObserver,
    network::{
        control::{send_goodbye, send_hello, KeepAlive},
        discovery::{BroadcastDiscovery, Discovery},
        receiver::ReceiverPipeline,
    },
};

/// How long discovery waits for a sender to answer before giving up.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

struct LogEvents;

impl ReceiverObserver for LogEvents {
    fn mode_changed(&self, mode: DecoderMode) {
        tracing::info!("Decoder switched to {:?} payloads", mode);
    }

    fn playback_degraded(&self, detail: &str) {
        tracing::warn!("Playback degraded: {}", detail);
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

    tracing::info!("Starting lancast receiver");

    // Load or create config
    let mut config = AppConfig::load()?;

    // List available output devices
    println!("\n=== Available Output Devices ===");
    let devices = list_devices();
    for device in &devices {
        if device.is_output {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}:", device.name, default_marker);
            println!("    ID: {}", device.id);
            println!("    Sample rates: {:?}", device.sample_rates);
            println!("    Channels: {:?}", device.channels);
        }
    }
    println!();

    // Sender address from args, or probe the network for one
    let sender_ip: IpAddr = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .context("sender address must be an IP address")?,
        None => {
            tracing::info!("No sender address given, probing the network...");
            let resolver =
                BroadcastDiscovery::new(&config.sender.service_name, config.discovery_port());
            match resolver.resolve_one(&config.sender.service_name, RESOLVE_TIMEOUT)? {
                Some((ip, port)) => {
                    if port != config.net.base_port {
                        tracing::info!("Sender streams on port {}, overriding config", port);
                        config.net.base_port = port;
                    }
                    ip
                }
                None => bail!("no sender found; pass its address as an argument"),
            }
        }
    };
    tracing::info!("Sender: {}:{}", sender_ip, config.stream_port());

    let decoder = OpusDecoder::new(&CodecParams::from(&config.audio), DecoderMode::Framed)
        .context("creating decoder")?;

    let mut playback = CpalPlayback::new(
        config.receiver.device_id.as_deref(),
        config.audio.sample_rate,
        config.audio.channels,
    )
    .context("opening output device")?;
    playback.start().context("starting playback")?;
    tracing::info!("Playback started");

    let mut pipeline = ReceiverPipeline::new(config.clone(), Arc::new(LogEvents));
    pipeline.start(Box::new(decoder), Box::new(playback))?;

    // Announce ourselves, then keep the registration fresh
    send_hello(sender_ip, config.net.base_port, &config.receiver.name)?;
    let mut keep_alive = KeepAlive::new(
        sender_ip,
        config.net.base_port,
        &config.receiver.name,
        Duration::from_secs(config.net.hello_refresh_secs),
    );
    keep_alive.start()?;

    tracing::info!(
        "Listening on port {} as \"{}\" - press Ctrl+C to stop",
        config.stream_port(),
        config.receiver.name,
    );
    tracing::info!("Waiting for audio...");

    let mut status = tokio::time::interval(Duration::from_secs(5));
    status.tick().await; // the first tick completes immediately
    loop {
        tokio::select! {
            _ = status.tick() => {
                let stats = pipeline.stats();
                let jitter = pipeline.jitter_stats();
                tracing::info!(
                    "Stats: {} packets, {:.1} KB, {} invalid, {} frames decoded, jitter buffer {}/{} ({:.1}% evicted)",
                    stats.packets_received,
                    stats.bytes_received as f64 / 1024.0,
                    stats.invalid_packets,
                    stats.frames_decoded,
                    jitter.level,
                    jitter.capacity,
                    jitter.eviction_rate() * 100.0,
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    // Tell the sender we are leaving so it can drop us right away
    if let Err(e) = send_goodbye(sender_ip, config.net.base_port) {
        tracing::warn!("Goodbye not delivered: {}", e);
    }
    keep_alive.stop();
    pipeline.stop();
    Ok(())
}
