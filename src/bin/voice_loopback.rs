//! Voice Loopback
//!
//! Captures the default microphone, runs each chunk through Opus and feeds
//! it back in as a remote participant, so you hear yourself with the full
//! pipeline's latency.
//!
//! `voice_loopback --write-config` writes the default config file and exits.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_pipeline::{
    audio::{capture::OutboundCallback, list_input_devices, CpalBackend, CpalSinkFactory},
    codec::{DecoderPool, VoiceEncoder},
    monitor::PollingDeviceMonitor,
    VoiceChat, VoiceChatConfig, VoiceEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::env::args().any(|arg| arg == "--write-config") {
        let path = VoiceChatConfig::default_path()
            .ok_or_else(|| anyhow::anyhow!("no home directory to place the config in"))?;
        VoiceChatConfig::default().save(&path)?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    tracing::info!("Starting voice loopback");
    let config = VoiceChatConfig::load_or_default();

    // List available devices
    println!("\n=== Available Input Devices ===");
    for device in list_input_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    // Captured chunks leave the capture thread through this channel
    let (chunk_tx, mut chunk_rx) = tokio::sync::mpsc::unbounded_channel::<(Vec<f32>, u32)>();
    let outbound: OutboundCallback = Arc::new(move |chunk: &[f32], sample_rate: u32, _channels: u16| {
        let _ = chunk_tx.send((chunk.to_vec(), sample_rate));
    });

    let voice_chat = Arc::new(VoiceChat::new(
        config.clone(),
        Arc::new(CpalBackend),
        Arc::new(CpalSinkFactory::new(config.playback.buffer_duration_secs)),
        outbound,
    )?);

    voice_chat.attach_monitor(Box::new(PollingDeviceMonitor::new(config.device.poll_interval())))?;

    let events = voice_chat.subscribe();
    std::thread::spawn(move || {
        for event in events.iter() {
            match event {
                VoiceEvent::StreamTimeout { participant_id } => {
                    tracing::info!("Participant {} went quiet", participant_id)
                }
                other => tracing::debug!("{:?}", other),
            }
        }
    });

    // Encode, decode and ingest as a remote participant
    let participant_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("Looping back as participant {}", participant_id);

    let sample_rate = config.audio.target_sample_rate;
    let mut encoder = VoiceEncoder::new(sample_rate, config.codec.clone())?;
    let decoders = Arc::new(DecoderPool::new(sample_rate));
    decoders.spawn_evictor(voice_chat.subscribe())?;
    let loopback_chat = voice_chat.clone();

    let loopback = tokio::spawn(async move {
        while let Some((chunk, rate)) = chunk_rx.recv().await {
            let packets = match encoder.encode(&chunk) {
                Ok(packets) => packets,
                Err(e) => {
                    tracing::warn!("Encode failed: {}", e);
                    continue;
                }
            };

            for packet in packets {
                match decoders.decode(&participant_id, &packet) {
                    Ok(samples) => loopback_chat.ingest(&participant_id, &samples, rate, 1),
                    Err(e) => {
                        tracing::warn!("Decode failed, concealing: {}", e);
                        if let Ok(samples) = decoders.decode_plc(&participant_id) {
                            loopback_chat.ingest(&participant_id, &samples, rate, 1);
                        }
                    }
                }
            }
        }
    });

    if let Err(e) = voice_chat.start_voice_chat() {
        tracing::error!("Capture did not start ({}); waiting for a device", e);
    }
    voice_chat.play_voice_chat()?;

    tracing::info!("Press Ctrl+C to stop");

    let mut stats_interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = stats_interval.tick() => {
                let capture = voice_chat.capture_stats();
                let playback = voice_chat.registry_stats();
                tracing::info!(
                    "Capture: {} frames, {} dropped, {} chunks, {} resampler rebuilds | Playback: {} streams, {} chunks played",
                    capture.frames_captured,
                    capture.frames_dropped,
                    capture.chunks_emitted,
                    capture.resampler_rebuilds,
                    playback.active_streams,
                    playback.chunks_played
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    loopback.abort();
    voice_chat.shutdown();

    Ok(())
}
