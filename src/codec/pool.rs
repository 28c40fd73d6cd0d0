//! One decoder per remote participant
//!
//! Opus decoders carry state between packets, so each participant needs
//! their own. Decoders are created on a participant's first packet and
//! dropped when their playback stream ends.

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::codec::VoiceDecoder;
use crate::error::CodecError;
use crate::events::VoiceEvent;

pub struct DecoderPool {
    sample_rate: u32,
    decoders: Mutex<HashMap<String, VoiceDecoder>>,
}

impl DecoderPool {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            decoders: Mutex::new(HashMap::new()),
        }
    }

    /// Decode a packet with the participant's decoder, creating it if needed
    pub fn decode(&self, participant_id: &str, packet: &[u8]) -> Result<Vec<f32>, CodecError> {
        self.with_decoder(participant_id, |decoder| decoder.decode(packet))
    }

    /// Conceal a lost packet for the participant
    pub fn decode_plc(&self, participant_id: &str) -> Result<Vec<f32>, CodecError> {
        self.with_decoder(participant_id, |decoder| decoder.decode_plc())
    }

    fn with_decoder<T>(
        &self,
        participant_id: &str,
        f: impl FnOnce(&mut VoiceDecoder) -> Result<T, CodecError>,
    ) -> Result<T, CodecError> {
        let mut decoders = self.decoders.lock();
        if !decoders.contains_key(participant_id) {
            let decoder = VoiceDecoder::new(self.sample_rate)?;
            tracing::debug!("Created decoder for {}", participant_id);
            decoders.insert(participant_id.to_string(), decoder);
        }
        match decoders.get_mut(participant_id) {
            Some(decoder) => f(decoder),
            None => Err(CodecError::DecoderInit(format!("no decoder for {}", participant_id))),
        }
    }

    /// Drop the participant's decoder. Returns whether one existed.
    pub fn remove(&self, participant_id: &str) -> bool {
        let removed = self.decoders.lock().remove(participant_id).is_some();
        if removed {
            tracing::debug!("Released decoder for {}", participant_id);
        }
        removed
    }

    /// Release decoders for streams that timed out or were removed
    pub fn handle_event(&self, event: &VoiceEvent) -> bool {
        match event {
            VoiceEvent::StreamTimeout { participant_id } | VoiceEvent::StreamRemoved { participant_id } => {
                self.remove(participant_id)
            }
            _ => false,
        }
    }

    /// Release decoders from a background thread as stream events arrive.
    /// The thread exits when the event bus goes away.
    pub fn spawn_evictor(self: &Arc<Self>, events: Receiver<VoiceEvent>) -> std::io::Result<JoinHandle<()>> {
        let pool = self.clone();
        thread::Builder::new()
            .name("voice-decoder-evictor".to_string())
            .spawn(move || {
                for event in events.iter() {
                    pool.handle_event(&event);
                }
            })
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.decoders.lock().contains_key(participant_id)
    }

    pub fn len(&self) -> usize {
        self.decoders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.lock().is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{VoiceEncoder, VOICE_FRAME_SIZE};
    use crate::events::EventBus;
    use std::time::{Duration, Instant};

    fn packet() -> Vec<u8> {
        let mut encoder = VoiceEncoder::voice().unwrap();
        encoder.encode_frame(&vec![0.1; VOICE_FRAME_SIZE]).unwrap().to_vec()
    }

    #[test]
    fn test_decoder_per_participant() {
        let pool = DecoderPool::new(48000);
        let packet = packet();

        assert_eq!(pool.decode("alice", &packet).unwrap().len(), VOICE_FRAME_SIZE);
        assert_eq!(pool.decode("alice", &packet).unwrap().len(), VOICE_FRAME_SIZE);
        assert_eq!(pool.len(), 1);

        assert_eq!(pool.decode_plc("bob").unwrap().len(), VOICE_FRAME_SIZE);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_stream_end_releases_decoder() {
        let pool = DecoderPool::new(48000);
        let packet = packet();
        pool.decode("alice", &packet).unwrap();
        pool.decode("bob", &packet).unwrap();

        assert!(!pool.handle_event(&VoiceEvent::StreamCreated { participant_id: "alice".into() }));
        assert!(pool.contains("alice"));

        assert!(pool.handle_event(&VoiceEvent::StreamTimeout { participant_id: "alice".into() }));
        assert!(!pool.contains("alice"));
        assert!(pool.contains("bob"));

        assert!(pool.handle_event(&VoiceEvent::StreamRemoved { participant_id: "bob".into() }));
        assert!(pool.is_empty());

        // Already gone
        assert!(!pool.handle_event(&VoiceEvent::StreamTimeout { participant_id: "alice".into() }));
    }

    #[test]
    fn test_evictor_follows_event_bus() {
        let bus = EventBus::new();
        let pool = Arc::new(DecoderPool::new(48000));
        let handle = pool.spawn_evictor(bus.subscribe()).unwrap();
        pool.decode("carol", &packet()).unwrap();

        bus.emit(VoiceEvent::StreamTimeout { participant_id: "carol".into() });

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.contains("carol") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!pool.contains("carol"));

        drop(bus);
        handle.join().unwrap();
    }
}
