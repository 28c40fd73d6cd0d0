//! # Voice Pipeline
//!
//! Real-time voice chat audio: microphone capture with mono mixdown and
//! resampling on the way out, per-participant jitter buffers and paced
//! playback on the way in.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SEND ─────────────────────────────────┐
//! │  ┌────────────┐   ┌──────────────────────────────┐   ┌─────────────┐  │
//! │  │ Microphone │──▶│ CaptureEngine (device thread)│──▶│ RingBuffer  │  │
//! │  │ (cpal)     │   │  mixdown → StreamResampler   │   │ 48 kHz mono │  │
//! │  └────────────┘   └──────────────────────────────┘   └──────┬──────┘  │
//! │                                                              │         │
//! │                                   consumer thread, 960-sample chunks  │
//! │                                                              ▼         │
//! │                                                   outbound callback    │
//! │                                                   (network sender)     │
//! └────────────────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────── RECEIVE ───────────────────────────────┐
//! │  network ──▶ VoiceChat::ingest ──▶ PlaybackStreamRegistry             │
//! │                                     ┌──────────┐ ┌──────────┐         │
//! │              unseen participant ──▶ │ alice    │ │ bob      │  ...    │
//! │              (coordinator creates   │ buffer   │ │ buffer   │         │
//! │               the sink)             │ sink     │ │ sink     │         │
//! │                                     └────┬─────┘ └────┬─────┘         │
//! │                                          ▼            ▼               │
//! │              PlaybackScheduler (20 ms tick): drain ≥512 samples,      │
//! │              PCM16 → sink, sweep idle streams                          │
//! └────────────────────────────────────────────────────────────────────────┘
//!
//!   DeviceMonitor ──▶ coordinator: disconnect stops capture,
//!                     reconnect restarts it after 0.5 s
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod playback;
pub mod session;

pub use config::VoiceChatConfig;
pub use error::{Error, Result};
pub use events::{EventBus, VoiceEvent};
pub use session::VoiceChat;

/// Application-wide constants
pub mod constants {
    /// Rate all captured audio is converted to
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Captured audio is mono
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Capture and playback buffer length in seconds
    pub const DEFAULT_BUFFER_SECONDS: f32 = 2.0;

    /// Samples per outbound capture chunk (20 ms at 48 kHz)
    pub const DEFAULT_CHUNK_SIZE: usize = 960;

    /// Samples a playback stream needs buffered before it is drained
    pub const MIN_PLAYBACK_CHUNK: usize = 512;

    /// Most samples drained from a playback stream per tick
    pub const MAX_PLAYBACK_CHUNK: usize = 960;

    /// Longest capture or playback buffer a config may ask for
    pub const MAX_BUFFER_SECONDS: f32 = 60.0;

    /// Idle time before a playback stream is removed
    pub const DEFAULT_STREAM_TIMEOUT_SECS: f32 = 2.0;

    /// Longest idle time a stream may be given before removal
    pub const MAX_STREAM_TIMEOUT_SECS: f32 = 3600.0;

    /// Playback scheduler period
    pub const DEFAULT_TICK_INTERVAL_MS: u64 = 20;

    /// Delay between a device reconnecting and capture restarting
    pub const DEFAULT_RESTART_DELAY_MS: u64 = 500;

    /// Capture consumer sleep when less than a chunk is buffered
    pub const CONSUMER_BACKOFF_MS: u64 = 1;

    /// Default Opus bitrate for voice in bits per second
    pub const DEFAULT_VOICE_BITRATE: u32 = 24_000;
}
