//! Periodic playback draining and timeout sweeping
//!
//! Every tick, each active stream with at least `min_chunk` samples buffered
//! gives up to `max_chunk` samples, converted to PCM16 and queued on its
//! sink. Then idle streams are swept. Draining only happens while incoming
//! audio processing is enabled; sweeping happens on every tick.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::format::to_pcm16_bytes;
use crate::config::PlaybackSettings;
use crate::error::AudioError;
use crate::playback::registry::{PlaybackStreamRegistry, StreamSnapshot};

/// Longest single sleep between ticks, so stop is noticed promptly
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Result of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Chunks handed to sinks
    pub chunks_played: usize,
    /// Participants whose streams timed out
    pub timed_out: Vec<String>,
}

struct SchedulerCore {
    registry: Arc<PlaybackStreamRegistry>,
    min_chunk: usize,
    max_chunk: usize,
    processing: AtomicBool,
}

impl SchedulerCore {
    fn tick(&self) -> TickReport {
        let chunks_played = if self.processing.load(Ordering::Relaxed) {
            self.drain_streams()
        } else {
            0
        };

        TickReport {
            chunks_played,
            timed_out: self.registry.sweep_timeouts(),
        }
    }

    fn drain_streams(&self) -> usize {
        // Snapshot first; the map lock is not held while sinks are fed
        let streams = self.registry.active_streams();
        streams.iter().filter(|stream| self.drain_one(stream)).count()
    }

    fn drain_one(&self, stream: &StreamSnapshot) -> bool {
        let available = stream.buffer.available_count();
        if available < self.min_chunk {
            return false;
        }

        let Some(samples) = stream.buffer.dequeue(available.min(self.max_chunk)) else {
            return false;
        };
        let pcm = to_pcm16_bytes(&samples);

        let mut sink = stream.sink.lock();
        if let Err(e) = sink.queue_pcm(pcm) {
            tracing::warn!("Failed to queue audio for {}: {}", stream.participant_id, e);
            return false;
        }
        if !sink.is_playing() {
            if let Err(e) = sink.play() {
                tracing::warn!("Failed to start playback for {}: {}", stream.participant_id, e);
                return false;
            }
        }
        drop(sink);

        self.registry.record_chunk_played();
        tracing::trace!("Played {} samples for {}", samples.len(), stream.participant_id);
        true
    }
}

/// Drives [`PlaybackStreamRegistry`] from a background thread at a fixed
/// tick interval
pub struct PlaybackScheduler {
    core: Arc<SchedulerCore>,
    tick_interval: Duration,
    ticking: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackScheduler {
    pub fn new(settings: &PlaybackSettings, registry: Arc<PlaybackStreamRegistry>) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                registry,
                min_chunk: settings.min_chunk,
                max_chunk: settings.max_chunk.max(settings.min_chunk),
                processing: AtomicBool::new(false),
            }),
            tick_interval: settings.tick_interval(),
            ticking: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Start the tick thread. No-op if already ticking.
    pub fn start(&self) -> Result<(), AudioError> {
        let mut handle = self.handle.lock();
        if self.ticking.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let core = self.core.clone();
        let ticking = self.ticking.clone();
        let interval = self.tick_interval;

        let spawned = thread::Builder::new()
            .name("voice-playback-scheduler".to_string())
            .spawn(move || run_ticks(core, ticking, interval));

        match spawned {
            Ok(h) => {
                *handle = Some(h);
                tracing::info!("Playback scheduler started ({:?} ticks)", interval);
                Ok(())
            }
            Err(e) => {
                self.ticking.store(false, Ordering::SeqCst);
                Err(AudioError::StreamError(format!("failed to spawn scheduler: {}", e)))
            }
        }
    }

    /// Clear the ticking flag and wait for the loop to exit
    pub fn stop(&self) {
        let mut handle = self.handle.lock();
        self.ticking.store(false, Ordering::SeqCst);
        if let Some(h) = handle.take() {
            let _ = h.join();
            tracing::info!("Playback scheduler stopped");
        }
    }

    /// Run one tick on the calling thread
    pub fn tick(&self) -> TickReport {
        self.core.tick()
    }

    /// Enable or disable draining of incoming audio
    pub fn set_processing(&self, enabled: bool) {
        self.core.processing.store(enabled, Ordering::SeqCst);
    }

    pub fn is_processing(&self) -> bool {
        self.core.processing.load(Ordering::SeqCst)
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking.load(Ordering::SeqCst)
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_ticks(core: Arc<SchedulerCore>, ticking: Arc<AtomicBool>, interval: Duration) {
    let mut next_tick = Instant::now();

    while ticking.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next_tick {
            thread::sleep((next_tick - now).min(MAX_IDLE_SLEEP));
            continue;
        }

        core.tick();

        next_tick += interval;
        // Fell behind; don't try to catch up with a burst of ticks
        if next_tick < now {
            next_tick = now + interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::MockSinkFactory;
    use crate::events::EventBus;

    fn setup() -> (PlaybackScheduler, Arc<PlaybackStreamRegistry>, MockSinkFactory) {
        let settings = PlaybackSettings::default();
        let sinks = MockSinkFactory::new();
        let registry = Arc::new(PlaybackStreamRegistry::new(
            &settings,
            Arc::new(sinks.clone()),
            EventBus::new(),
        ));
        let scheduler = PlaybackScheduler::new(&settings, registry.clone());
        (scheduler, registry, sinks)
    }

    #[test]
    fn test_drains_up_to_max_chunk() {
        let (scheduler, registry, sinks) = setup();
        scheduler.set_processing(true);
        registry.get_or_create("alice", 48000).unwrap();
        registry.ingest("alice", &[0.5; 1500], 48000, 1);

        let report = scheduler.tick();
        assert_eq!(report.chunks_played, 1);

        let sink = sinks.sink("alice").unwrap();
        assert_eq!(sink.samples().len(), 960);
        assert!(sink.samples().iter().all(|&s| s == 16383));
        assert!(sink.is_playing());
        assert_eq!(registry.buffered_samples("alice"), Some(540));

        // 540 left: enough for another drain
        scheduler.tick();
        assert_eq!(sink.samples().len(), 1500);
        assert_eq!(sink.play_calls(), 1);
    }

    #[test]
    fn test_below_min_chunk_not_drained() {
        let (scheduler, registry, sinks) = setup();
        scheduler.set_processing(true);
        registry.get_or_create("bob", 48000).unwrap();
        registry.ingest("bob", &[0.1; 511], 48000, 1);

        assert_eq!(scheduler.tick().chunks_played, 0);
        assert_eq!(sinks.sink("bob").unwrap().bytes_queued(), 0);
        assert!(!sinks.sink("bob").unwrap().is_playing());
    }

    #[test]
    fn test_failed_play_not_counted() {
        let (scheduler, registry, sinks) = setup();
        scheduler.set_processing(true);
        registry.get_or_create("erin", 48000).unwrap();
        let sink = sinks.sink("erin").unwrap();
        sink.set_fail_play(true);
        registry.ingest("erin", &[0.1; 960], 48000, 1);

        assert_eq!(scheduler.tick().chunks_played, 0);
        assert_eq!(registry.stats().chunks_played, 0);
        assert!(!sink.is_playing());

        // Device back: the next chunk plays
        sink.set_fail_play(false);
        registry.ingest("erin", &[0.1; 960], 48000, 1);
        assert_eq!(scheduler.tick().chunks_played, 1);
        assert!(sink.is_playing());
    }

    #[test]
    fn test_muted_still_sweeps() {
        let (scheduler, registry, _) = setup();
        registry.set_stream_timeout(Duration::from_millis(10));
        registry.get_or_create("carol", 48000).unwrap();
        registry.ingest("carol", &[0.1; 960], 48000, 1);

        thread::sleep(Duration::from_millis(30));
        let report = scheduler.tick();
        assert_eq!(report.chunks_played, 0);
        assert_eq!(report.timed_out, vec!["carol".to_string()]);
    }

    #[test]
    fn test_background_loop() {
        let (scheduler, registry, sinks) = setup();
        scheduler.set_processing(true);
        registry.get_or_create("dave", 48000).unwrap();
        registry.ingest("dave", &[0.25; 960], 48000, 1);

        scheduler.start().unwrap();
        assert!(scheduler.is_ticking());

        let deadline = Instant::now() + Duration::from_secs(2);
        while sinks.sink("dave").unwrap().bytes_queued() < 1920 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();

        assert!(!scheduler.is_ticking());
        assert_eq!(sinks.sink("dave").unwrap().bytes_queued(), 1920);
        assert_eq!(registry.stats().chunks_played, 1);
    }
}
