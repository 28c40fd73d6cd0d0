//! Opus voice codec
//!
//! What a network sender wraps around the capture engine's outbound chunks,
//! and what the receive path uses before handing audio to `ingest`.

pub mod decoder;
pub mod encoder;
pub mod pool;

pub use decoder::{DecoderStats, VoiceDecoder};
pub use encoder::{EncoderStats, VoiceEncoder, VOICE_FRAME_SIZE};
pub use pool::DecoderPool;
