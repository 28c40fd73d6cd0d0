//! Opus voice decoder with packet loss concealment

use opus::{Channels, Decoder};

use crate::error::CodecError;

/// Mono Opus decoder
pub struct VoiceDecoder {
    decoder: Decoder,
    sample_rate: u32,
    /// Decoding buffer, sized for the longest Opus frame (120 ms)
    decode_buffer: Vec<f32>,
    /// Length of the last decoded frame, used for concealment
    last_frame_size: usize,
    frames_decoded: u64,
    /// Frames concealed by PLC
    frames_lost: u64,
    samples_produced: u64,
}

impl VoiceDecoder {
    pub fn new(sample_rate: u32) -> Result<Self, CodecError> {
        let decoder = Decoder::new(sample_rate, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            sample_rate,
            decode_buffer: vec![0.0f32; sample_rate as usize * 120 / 1000],
            last_frame_size: sample_rate as usize / 50,
            frames_decoded: 0,
            frames_lost: 0,
            samples_produced: 0,
        })
    }

    /// Decode one packet to mono f32 samples
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>, CodecError> {
        self.decode_inner(packet, false)
    }

    /// Recover the previous, lost frame from this packet's FEC data
    pub fn decode_fec(&mut self, packet: &[u8]) -> Result<Vec<f32>, CodecError> {
        self.decode_inner(packet, true)
    }

    fn decode_inner(&mut self, packet: &[u8], fec: bool) -> Result<Vec<f32>, CodecError> {
        let samples = self
            .decoder
            .decode_float(packet, &mut self.decode_buffer, fec)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        if !fec {
            self.last_frame_size = samples;
        }
        self.frames_decoded += 1;
        self.samples_produced += samples as u64;

        Ok(self.decode_buffer[..samples].to_vec())
    }

    /// Synthesize one frame, as long as the last decoded one, for a lost
    /// packet
    pub fn decode_plc(&mut self) -> Result<Vec<f32>, CodecError> {
        let frame = self.last_frame_size.min(self.decode_buffer.len());
        let samples = self
            .decoder
            .decode_float(&[], &mut self.decode_buffer[..frame], false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_lost += 1;
        self.samples_produced += samples as u64;

        Ok(self.decode_buffer[..samples].to_vec())
    }

    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn stats(&self) -> DecoderStats {
        let total = self.frames_decoded + self.frames_lost;
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_lost: self.frames_lost,
            samples_produced: self.samples_produced,
            loss_rate: if total > 0 {
                self.frames_lost as f32 / total as f32
            } else {
                0.0
            },
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_lost: u64,
    pub samples_produced: u64,
    pub loss_rate: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{VoiceEncoder, VOICE_FRAME_SIZE};

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = VoiceEncoder::voice().unwrap();
        let mut decoder = VoiceDecoder::new(48000).unwrap();

        let samples: Vec<f32> = (0..VOICE_FRAME_SIZE)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 48000.0).sin() * 0.5)
            .collect();

        let packet = encoder.encode_frame(&samples).unwrap();
        let decoded = decoder.decode(&packet).unwrap();

        assert_eq!(decoded.len(), VOICE_FRAME_SIZE);
    }

    #[test]
    fn test_plc() {
        let mut decoder = VoiceDecoder::new(48000).unwrap();
        let mut encoder = VoiceEncoder::voice().unwrap();

        let packet = encoder.encode_frame(&vec![0.0; VOICE_FRAME_SIZE]).unwrap();
        decoder.decode(&packet).unwrap();

        let concealed = decoder.decode_plc().unwrap();
        assert_eq!(concealed.len(), VOICE_FRAME_SIZE);

        let stats = decoder.stats();
        assert_eq!(stats.frames_lost, 1);
        assert!((stats.loss_rate - 0.5).abs() < f32::EPSILON);
    }
}
