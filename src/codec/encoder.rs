//! Opus voice encoder
//!
//! Encodes the capture engine's mono chunks. A chunk is split into fixed
//! Opus frames; a short final frame is padded with silence.

use bytes::Bytes;
use opus::{Application, Bitrate, Channels, Encoder};

use crate::config::CodecSettings;
use crate::error::CodecError;

/// Samples per Opus frame at 48 kHz (20 ms)
pub const VOICE_FRAME_SIZE: usize = 960;

/// Largest packet Opus will produce for one frame
const MAX_PACKET_SIZE: usize = 4000;

/// Mono Opus encoder tuned for speech
pub struct VoiceEncoder {
    encoder: Encoder,
    settings: CodecSettings,
    sample_rate: u32,
    frame_size: usize,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Padded copy of a short final frame
    frame_scratch: Vec<f32>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl VoiceEncoder {
    /// Create an encoder for 20 ms mono frames at `sample_rate`
    pub fn new(sample_rate: u32, settings: CodecSettings) -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(sample_rate, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, &settings)?;

        let frame_size = sample_rate as usize / 50;
        Ok(Self {
            encoder,
            settings,
            sample_rate,
            frame_size,
            encode_buffer: vec![0u8; MAX_PACKET_SIZE],
            frame_scratch: vec![0.0; frame_size],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encoder with default voice settings at 48 kHz
    pub fn voice() -> Result<Self, CodecError> {
        Self::new(48000, CodecSettings::default())
    }

    fn configure_encoder(encoder: &mut Encoder, settings: &CodecSettings) -> Result<(), CodecError> {
        encoder
            .set_bitrate(Bitrate::Bits(settings.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(settings.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        encoder
            .set_inband_fec(settings.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if settings.fec {
            encoder
                .set_packet_loss_perc(settings.packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }

    /// Encode exactly one frame
    pub fn encode_frame(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        if samples.len() != self.frame_size {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// Encode a chunk of any length into one packet per frame
    pub fn encode(&mut self, samples: &[f32]) -> Result<Vec<Bytes>, CodecError> {
        let mut packets = Vec::with_capacity(samples.len().div_ceil(self.frame_size));

        for frame in samples.chunks(self.frame_size) {
            if frame.len() == self.frame_size {
                packets.push(self.encode_frame(frame)?);
            } else {
                let mut padded = std::mem::take(&mut self.frame_scratch);
                padded[..frame.len()].copy_from_slice(frame);
                padded[frame.len()..].fill(0.0);
                let packet = self.encode_frame(&padded);
                self.frame_scratch = padded;
                packets.push(packet?);
            }
        }

        Ok(packets)
    }

    /// Update bitrate dynamically
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError> {
        self.encoder
            .set_bitrate(Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        self.settings.bitrate = bitrate;
        Ok(())
    }

    /// Update FEC setting dynamically
    pub fn set_fec(&mut self, enabled: bool, packet_loss_perc: u8) -> Result<(), CodecError> {
        self.encoder
            .set_inband_fec(enabled)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if enabled {
            self.encoder
                .set_packet_loss_perc(packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        self.settings.fec = enabled;
        self.settings.packet_loss_perc = packet_loss_perc;
        Ok(())
    }

    pub fn settings(&self) -> &CodecSettings {
        &self.settings
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
