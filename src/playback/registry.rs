//! Per-participant playback streams
//!
//! Inbound audio is routed here by participant id. The first packet for an
//! unseen participant allocates its jitter buffer immediately and asks the
//! coordinator to create the sink; packets that arrive before the sink exists
//! are kept in that buffer, so nothing is lost and order is preserved.
//!
//! One lock guards the participant map. Buffer operations take the buffer's
//! own lock inside it; sink calls always happen outside it.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::buffer::{create_shared_buffer, SharedRingBuffer};
use crate::audio::format::mix_to_mono;
use crate::audio::sink::{AudioSink, SinkFactory};
use crate::config::PlaybackSettings;
use crate::error::AudioError;
use crate::events::{EventBus, VoiceEvent};

/// Sink shared between the registry and the scheduler
pub type SharedSink = Arc<Mutex<Box<dyn AudioSink>>>;

/// Request to create the sink for a newly seen participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub participant_id: String,
    pub sample_rate: u32,
}

/// Playback state for one remote participant
struct PlayerStream {
    buffer: SharedRingBuffer,
    sink: SharedSink,
    sample_rate: u32,
    last_activity: Instant,
}

/// Seen, but the sink is not created yet
struct PendingStream {
    buffer: SharedRingBuffer,
    sample_rate: u32,
    last_activity: Instant,
}

enum StreamSlot {
    Pending(PendingStream),
    Active(PlayerStream),
}

impl StreamSlot {
    fn buffer(&self) -> &SharedRingBuffer {
        match self {
            StreamSlot::Pending(p) => &p.buffer,
            StreamSlot::Active(s) => &s.buffer,
        }
    }

    fn last_activity(&self) -> Instant {
        match self {
            StreamSlot::Pending(p) => p.last_activity,
            StreamSlot::Active(s) => s.last_activity,
        }
    }

    fn touch(&mut self, now: Instant) {
        match self {
            StreamSlot::Pending(p) => p.last_activity = now,
            StreamSlot::Active(s) => s.last_activity = now,
        }
    }
}

/// What the scheduler needs to drain one stream
#[derive(Clone)]
pub struct StreamSnapshot {
    pub participant_id: String,
    pub buffer: SharedRingBuffer,
    pub sink: SharedSink,
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_streams: usize,
    pub streams_created: u64,
    pub streams_timed_out: u64,
    pub chunks_played: u64,
}

pub struct PlaybackStreamRegistry {
    streams: Mutex<HashMap<String, StreamSlot>>,
    sinks: Arc<dyn SinkFactory>,
    events: EventBus,
    buffer_duration_secs: f32,
    /// Idle threshold in microseconds, changeable at runtime
    timeout_micros: AtomicU64,

    requests_tx: Sender<StreamRequest>,
    requests_rx: Receiver<StreamRequest>,

    streams_created: AtomicU64,
    streams_timed_out: AtomicU64,
    chunks_played: AtomicU64,
}

impl PlaybackStreamRegistry {
    pub fn new(settings: &PlaybackSettings, sinks: Arc<dyn SinkFactory>, events: EventBus) -> Self {
        let (requests_tx, requests_rx) = unbounded();
        Self {
            streams: Mutex::new(HashMap::new()),
            sinks,
            events,
            buffer_duration_secs: settings.buffer_duration_secs,
            timeout_micros: AtomicU64::new(settings.stream_timeout().as_micros() as u64),
            requests_tx,
            requests_rx,
            streams_created: AtomicU64::new(0),
            streams_timed_out: AtomicU64::new(0),
            chunks_played: AtomicU64::new(0),
        }
    }

    /// Queue of sink creation requests, serviced by the coordinator
    pub fn requests(&self) -> Receiver<StreamRequest> {
        self.requests_rx.clone()
    }

    /// Route one inbound packet to its participant's stream.
    ///
    /// Multi-channel input is mixed down to mono. Malformed input is logged
    /// and ignored.
    pub fn ingest(&self, participant_id: &str, samples: &[f32], sample_rate: u32, channels: u16) {
        if samples.is_empty() || channels == 0 || sample_rate == 0 {
            tracing::warn!(
                "Dropping malformed audio from {}: {} samples, {} Hz, {} channels",
                participant_id,
                samples.len(),
                sample_rate,
                channels
            );
            return;
        }

        let mono = mix_to_mono(samples, channels);
        let now = Instant::now();
        let mut streams = self.streams.lock();

        if let Some(slot) = streams.get_mut(participant_id) {
            if !slot.buffer().enqueue(&mono) {
                tracing::warn!("Failed to buffer audio for {}", participant_id);
            }
            slot.touch(now);
            tracing::trace!("Buffered {} samples for {}", mono.len(), participant_id);
            return;
        }

        let buffer = create_shared_buffer(sample_rate, 1, self.buffer_duration_secs);
        buffer.enqueue(&mono);
        streams.insert(
            participant_id.to_string(),
            StreamSlot::Pending(PendingStream {
                buffer,
                sample_rate,
                last_activity: now,
            }),
        );

        let request = StreamRequest {
            participant_id: participant_id.to_string(),
            sample_rate,
        };
        if self.requests_tx.send(request).is_err() {
            tracing::warn!("No coordinator to create stream for {}", participant_id);
        }
        tracing::debug!("New participant {} at {} Hz, stream requested", participant_id, sample_rate);
    }

    /// Return the participant's buffer, creating the stream and its sink
    /// now if needed. Runs on the calling thread.
    pub fn get_or_create(&self, participant_id: &str, sample_rate: u32) -> Result<SharedRingBuffer, AudioError> {
        {
            let mut streams = self.streams.lock();
            match streams.get_mut(participant_id) {
                Some(StreamSlot::Active(stream)) => {
                    stream.last_activity = Instant::now();
                    return Ok(stream.buffer.clone());
                }
                Some(StreamSlot::Pending(_)) => {}
                None => {
                    streams.insert(
                        participant_id.to_string(),
                        StreamSlot::Pending(PendingStream {
                            buffer: create_shared_buffer(sample_rate, 1, self.buffer_duration_secs),
                            sample_rate,
                            last_activity: Instant::now(),
                        }),
                    );
                }
            }
        }
        self.activate(participant_id)
    }

    /// Create the sink for a requested stream
    pub fn fulfil(&self, request: &StreamRequest) {
        if let Err(e) = self.activate(&request.participant_id) {
            tracing::warn!("Could not create stream for {}: {}", request.participant_id, e);
        }
    }

    /// Fulfil every queued request on the calling thread. Returns how many
    /// were handled.
    pub fn process_requests(&self) -> usize {
        let mut handled = 0;
        while let Ok(request) = self.requests_rx.try_recv() {
            self.fulfil(&request);
            handled += 1;
        }
        handled
    }

    fn activate(&self, participant_id: &str) -> Result<SharedRingBuffer, AudioError> {
        let sample_rate = match self.streams.lock().get(participant_id) {
            Some(StreamSlot::Active(stream)) => return Ok(stream.buffer.clone()),
            Some(StreamSlot::Pending(pending)) => pending.sample_rate,
            None => {
                return Err(AudioError::StreamError(format!(
                    "no pending stream for {}",
                    participant_id
                )))
            }
        };

        let mut sink = match self.sinks.create_sink(participant_id, sample_rate) {
            Ok(sink) => sink,
            Err(e) => {
                // Forget the pending entry so the next packet retries
                let mut streams = self.streams.lock();
                if matches!(streams.get(participant_id), Some(StreamSlot::Pending(_))) {
                    streams.remove(participant_id);
                }
                return Err(e);
            }
        };

        let mut streams = self.streams.lock();
        match streams.remove(participant_id) {
            Some(StreamSlot::Pending(pending)) => {
                let buffer = pending.buffer.clone();
                streams.insert(
                    participant_id.to_string(),
                    StreamSlot::Active(PlayerStream {
                        buffer: pending.buffer,
                        sink: Arc::new(Mutex::new(sink)),
                        sample_rate: pending.sample_rate,
                        last_activity: pending.last_activity,
                    }),
                );
                drop(streams);

                self.streams_created.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Created playback stream for {} at {} Hz", participant_id, sample_rate);
                self.events.emit(VoiceEvent::StreamCreated {
                    participant_id: participant_id.to_string(),
                });
                Ok(buffer)
            }
            Some(active @ StreamSlot::Active(_)) => {
                let buffer = active.buffer().clone();
                streams.insert(participant_id.to_string(), active);
                drop(streams);
                sink.stop();
                Ok(buffer)
            }
            None => {
                drop(streams);
                sink.stop();
                Err(AudioError::StreamError(format!(
                    "stream for {} removed during creation",
                    participant_id
                )))
            }
        }
    }

    /// Stop and drop the participant's stream. Returns false if there was
    /// none.
    pub fn remove(&self, participant_id: &str) -> bool {
        let slot = self.streams.lock().remove(participant_id);
        match slot {
            Some(slot) => {
                let announced = teardown(slot);
                tracing::info!("Removed playback stream for {}", participant_id);
                if announced {
                    self.events.emit(VoiceEvent::StreamRemoved {
                        participant_id: participant_id.to_string(),
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Remove every stream, e.g. on shutdown
    pub fn clear(&self) {
        let drained: Vec<(String, StreamSlot)> = self.streams.lock().drain().collect();
        for (participant_id, slot) in drained {
            if teardown(slot) {
                self.events.emit(VoiceEvent::StreamRemoved { participant_id });
            }
        }
    }

    pub fn sweep_timeouts(&self) -> Vec<String> {
        self.sweep_timeouts_at(Instant::now())
    }

    /// Remove streams idle for longer than the timeout as of `now`. Returns
    /// the participants whose streams timed out.
    pub fn sweep_timeouts_at(&self, now: Instant) -> Vec<String> {
        let timeout = self.stream_timeout();

        let expired: Vec<(String, StreamSlot)> = {
            let mut streams = self.streams.lock();
            let ids: Vec<String> = streams
                .iter()
                .filter(|(_, slot)| now.saturating_duration_since(slot.last_activity()) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| streams.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        let mut timed_out = Vec::with_capacity(expired.len());
        for (participant_id, slot) in expired {
            if teardown(slot) {
                self.streams_timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Playback stream for {} timed out", participant_id);
                self.events.emit(VoiceEvent::StreamTimeout {
                    participant_id: participant_id.clone(),
                });
                timed_out.push(participant_id);
            } else {
                tracing::debug!("Dropped pending stream for {} before its sink was created", participant_id);
            }
        }
        timed_out
    }

    /// Streams with a sink, captured under the map lock
    pub fn active_streams(&self) -> Vec<StreamSnapshot> {
        self.streams
            .lock()
            .iter()
            .filter_map(|(id, slot)| match slot {
                StreamSlot::Active(stream) => Some(StreamSnapshot {
                    participant_id: id.clone(),
                    buffer: stream.buffer.clone(),
                    sink: stream.sink.clone(),
                }),
                StreamSlot::Pending(_) => None,
            })
            .collect()
    }

    pub fn set_stream_timeout(&self, timeout: Duration) {
        self.timeout_micros
            .store(timeout.as_micros() as u64, Ordering::Relaxed);
        tracing::debug!("Stream timeout set to {:?}", timeout);
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_micros.load(Ordering::Relaxed))
    }

    /// True once the participant's sink exists
    pub fn is_active(&self, participant_id: &str) -> bool {
        matches!(self.streams.lock().get(participant_id), Some(StreamSlot::Active(_)))
    }

    /// True if the participant has a stream, pending or active
    pub fn contains(&self, participant_id: &str) -> bool {
        self.streams.lock().contains_key(participant_id)
    }

    pub fn stream_sample_rate(&self, participant_id: &str) -> Option<u32> {
        match self.streams.lock().get(participant_id)? {
            StreamSlot::Active(stream) => Some(stream.sample_rate),
            StreamSlot::Pending(pending) => Some(pending.sample_rate),
        }
    }

    pub fn buffered_samples(&self, participant_id: &str) -> Option<usize> {
        self.streams
            .lock()
            .get(participant_id)
            .map(|slot| slot.buffer().available_count())
    }

    pub fn participants(&self) -> Vec<String> {
        self.streams.lock().keys().cloned().collect()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    pub(crate) fn record_chunk_played(&self) {
        self.chunks_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RegistryStats {
        let active_streams = self
            .streams
            .lock()
            .values()
            .filter(|slot| matches!(slot, StreamSlot::Active(_)))
            .count();
        RegistryStats {
            active_streams,
            streams_created: self.streams_created.load(Ordering::Relaxed),
            streams_timed_out: self.streams_timed_out.load(Ordering::Relaxed),
            chunks_played: self.chunks_played.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PlaybackStreamRegistry {
    fn drop(&mut self) {
        for (_, slot) in self.streams.get_mut().drain() {
            teardown(slot);
        }
    }
}

/// Stop the sink and clear the buffer. Returns true if the stream had a sink.
fn teardown(slot: StreamSlot) -> bool {
    match slot {
        StreamSlot::Active(stream) => {
            stream.sink.lock().stop();
            stream.buffer.reset();
            true
        }
        StreamSlot::Pending(pending) => {
            pending.buffer.reset();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::MockSinkFactory;

    fn registry() -> (PlaybackStreamRegistry, MockSinkFactory, EventBus) {
        let sinks = MockSinkFactory::new();
        let events = EventBus::new();
        let registry = PlaybackStreamRegistry::new(
            &PlaybackSettings::default(),
            Arc::new(sinks.clone()),
            events.clone(),
        );
        (registry, sinks, events)
    }

    #[test]
    fn test_first_packet_requests_stream() {
        let (registry, sinks, _) = registry();
        registry.ingest("alice", &[0.1; 480], 48000, 1);

        assert!(registry.contains("alice"));
        assert!(!registry.is_active("alice"));
        assert_eq!(sinks.created(), 0);

        assert_eq!(registry.process_requests(), 1);
        assert!(registry.is_active("alice"));
        assert_eq!(sinks.created(), 1);
        assert_eq!(registry.buffered_samples("alice"), Some(480));
    }

    #[test]
    fn test_early_packets_kept_in_order() {
        let (registry, _, _) = registry();
        registry.ingest("bob", &[0.1; 100], 48000, 1);
        registry.ingest("bob", &[0.2; 100], 48000, 1);
        registry.process_requests();
        registry.ingest("bob", &[0.3; 100], 48000, 1);

        let buffer = registry.get_or_create("bob", 48000).unwrap();
        let samples = buffer.dequeue(300).unwrap();
        assert!(samples[..100].iter().all(|&s| s == 0.1));
        assert!(samples[100..200].iter().all(|&s| s == 0.2));
        assert!(samples[200..].iter().all(|&s| s == 0.3));
    }

    #[test]
    fn test_get_or_create_is_synchronous() {
        let (registry, sinks, events) = registry();
        let rx = events.subscribe();

        let buffer = registry.get_or_create("carol", 24000).unwrap();
        assert_eq!(buffer.capacity(), 48000);
        assert!(registry.is_active("carol"));
        assert_eq!(registry.stream_sample_rate("carol"), Some(24000));

        registry.get_or_create("carol", 24000).unwrap();
        assert_eq!(sinks.created(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            VoiceEvent::StreamCreated { participant_id: "carol".into() }
        );
    }

    #[test]
    fn test_stereo_ingest_mixed_down() {
        let (registry, _, _) = registry();
        registry.ingest("dave", &[0.2, 0.4, 0.2, 0.4], 48000, 2);
        assert_eq!(registry.buffered_samples("dave"), Some(2));
    }

    #[test]
    fn test_malformed_ingest_ignored() {
        let (registry, _, _) = registry();
        registry.ingest("erin", &[], 48000, 1);
        registry.ingest("erin", &[0.1; 10], 48000, 0);
        registry.ingest("erin", &[0.1; 10], 0, 1);

        assert!(!registry.contains("erin"));
        assert_eq!(registry.process_requests(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (registry, sinks, events) = registry();
        let rx = events.subscribe();
        registry.get_or_create("frank", 48000).unwrap();
        let _ = rx.try_recv();

        assert!(registry.remove("frank"));
        assert!(sinks.sink("frank").unwrap().is_stopped());
        assert_eq!(
            rx.try_recv().unwrap(),
            VoiceEvent::StreamRemoved { participant_id: "frank".into() }
        );

        assert!(!registry.remove("frank"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_request_for_removed_stream_discarded() {
        let (registry, sinks, _) = registry();
        registry.ingest("gina", &[0.1; 10], 48000, 1);
        registry.remove("gina");

        registry.process_requests();
        assert!(!registry.contains("gina"));
        assert_eq!(sinks.created(), 0);
    }

    #[test]
    fn test_timeout_sweep() {
        let (registry, sinks, events) = registry();
        let rx = events.subscribe();
        registry.get_or_create("hank", 48000).unwrap();
        let _ = rx.try_recv();

        let now = Instant::now();
        assert!(registry.sweep_timeouts_at(now + Duration::from_millis(1500)).is_empty());

        let timed_out = registry.sweep_timeouts_at(now + Duration::from_millis(2500));
        assert_eq!(timed_out, vec!["hank".to_string()]);
        assert!(sinks.sink("hank").unwrap().is_stopped());
        assert_eq!(
            rx.try_recv().unwrap(),
            VoiceEvent::StreamTimeout { participant_id: "hank".into() }
        );

        assert!(registry.sweep_timeouts_at(now + Duration::from_secs(10)).is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.stats().streams_timed_out, 1);
    }

    #[test]
    fn test_activity_refreshes_timeout() {
        let (registry, _, _) = registry();
        registry.get_or_create("iris", 48000).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        registry.ingest("iris", &[0.1; 10], 48000, 1);

        registry.set_stream_timeout(Duration::from_millis(80));
        assert!(registry.sweep_timeouts().is_empty());
        assert!(registry.contains("iris"));
    }

    #[test]
    fn test_runtime_timeout_change() {
        let (registry, _, _) = registry();
        registry.set_stream_timeout(Duration::from_secs(10));
        assert_eq!(registry.stream_timeout(), Duration::from_secs(10));

        registry.get_or_create("jack", 48000).unwrap();
        let later = Instant::now() + Duration::from_secs(5);
        assert!(registry.sweep_timeouts_at(later).is_empty());
    }
}
