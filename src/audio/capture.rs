//! Microphone capture engine
//!
//! Frames from the input device are mixed down to mono, resampled to the
//! target rate when the device runs at a different rate, and written into
//! the capture ring buffer from the device's own thread. A separate consumer
//! thread takes fixed-size chunks out of the buffer and hands them to the
//! outbound callback (normally the network sender).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{create_shared_buffer, SharedRingBuffer};
use crate::audio::device::{CaptureBackend, CaptureDevice};
use crate::audio::format::{mix_to_mono, DeviceFormat};
use crate::audio::resample::StreamResampler;
use crate::config::AudioSettings;
use crate::error::AudioError;

/// Receives each captured chunk: `(samples, sample_rate, channels)`
pub type OutboundCallback = Arc<dyn Fn(&[f32], u32, u16) + Send + Sync>;

/// Capture engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    /// Device acquired, stream not yet running
    MicrophoneOpen,
    Capturing,
}

#[derive(Default)]
struct CaptureCounters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    samples_enqueued: AtomicU64,
    chunks_emitted: AtomicU64,
}

/// Capture statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub samples_enqueued: u64,
    pub chunks_emitted: u64,
    pub resampler_rebuilds: u64,
}

/// Owns the microphone and the capture side of the pipeline
pub struct CaptureEngine {
    settings: AudioSettings,
    backend: Arc<dyn CaptureBackend>,
    outbound: OutboundCallback,

    /// Capture ring buffer, target rate, mono
    buffer: SharedRingBuffer,

    /// Survives restarts so the filter is only rebuilt on a rate change
    resampler: Arc<Mutex<StreamResampler>>,

    /// Open device; the lock also serializes start/stop
    device: Mutex<Option<Box<dyn CaptureDevice>>>,
    state: Mutex<CaptureState>,

    capturing: Arc<AtomicBool>,
    processing: Arc<AtomicBool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<CaptureCounters>,
}

impl CaptureEngine {
    pub fn new(settings: AudioSettings, backend: Arc<dyn CaptureBackend>, outbound: OutboundCallback) -> Self {
        let buffer = create_shared_buffer(
            settings.target_sample_rate,
            settings.target_channels,
            settings.buffer_duration_secs,
        );
        let resampler = Arc::new(Mutex::new(StreamResampler::new(settings.target_sample_rate)));

        Self {
            settings,
            backend,
            outbound,
            buffer,
            resampler,
            device: Mutex::new(None),
            state: Mutex::new(CaptureState::Idle),
            capturing: Arc::new(AtomicBool::new(false)),
            processing: Arc::new(AtomicBool::new(false)),
            consumer: Mutex::new(None),
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Open the default input device and start capturing.
    ///
    /// Returns whether this call started capture; `Ok(false)` if it was
    /// already running. On failure the error is logged and returned, and the
    /// engine stays idle.
    pub fn start(&self) -> Result<bool, AudioError> {
        let mut device_slot = self.device.lock();
        if device_slot.is_some() {
            return Ok(false);
        }

        self.buffer.reset();

        let mut device = match self.backend.open_default() {
            Ok(device) => device,
            Err(e) => {
                tracing::error!("Failed to open default audio stream: {}", e);
                return Err(e);
            }
        };
        *self.state.lock() = CaptureState::MicrophoneOpen;

        let processor = FrameProcessor {
            target_rate: self.settings.target_sample_rate,
            buffer: self.buffer.clone(),
            resampler: self.resampler.clone(),
            capturing: self.capturing.clone(),
            counters: self.counters.clone(),
        };

        self.capturing.store(true, Ordering::SeqCst);
        let on_frame = Box::new(move |data: &[f32], format: DeviceFormat| processor.process(data, format));
        let format = match device.start(on_frame) {
            Ok(format) => format,
            Err(e) => {
                self.capturing.store(false, Ordering::SeqCst);
                *self.state.lock() = CaptureState::Idle;
                tracing::error!("Failed to start voice capture: {}", e);
                return Err(e);
            }
        };

        self.processing.store(true, Ordering::SeqCst);
        let consumer = ChunkConsumer {
            buffer: self.buffer.clone(),
            processing: self.processing.clone(),
            chunk_size: self.settings.chunk_size,
            backoff: self.settings.consumer_backoff(),
            sample_rate: self.settings.target_sample_rate,
            channels: self.settings.target_channels,
            outbound: self.outbound.clone(),
            counters: self.counters.clone(),
        };

        let handle = thread::Builder::new()
            .name("voice-capture-consumer".to_string())
            .spawn(move || consumer.run());

        match handle {
            Ok(handle) => *self.consumer.lock() = Some(handle),
            Err(e) => {
                self.capturing.store(false, Ordering::SeqCst);
                self.processing.store(false, Ordering::SeqCst);
                device.stop();
                *self.state.lock() = CaptureState::Idle;
                tracing::error!("Failed to spawn capture consumer: {}", e);
                return Err(AudioError::StreamError(e.to_string()));
            }
        }

        *device_slot = Some(device);
        *self.state.lock() = CaptureState::Capturing;

        tracing::info!(
            "Voice capture started: device {} Hz x{} -> {} Hz mono, {}-sample chunks",
            format.sample_rate,
            format.channels,
            self.settings.target_sample_rate,
            self.settings.chunk_size
        );
        Ok(true)
    }

    /// Stop capturing and release the device. No-op when idle; returns
    /// whether anything was stopped.
    pub fn stop(&self) -> bool {
        let mut device_slot = self.device.lock();
        let Some(mut device) = device_slot.take() else {
            return false;
        };

        self.capturing.store(false, Ordering::SeqCst);
        device.stop();
        drop(device);

        self.processing.store(false, Ordering::SeqCst);
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }

        *self.state.lock() = CaptureState::Idle;
        tracing::info!("Voice capture stopped");
        true
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    /// Samples waiting in the capture buffer
    pub fn buffered_samples(&self) -> usize {
        self.buffer.available_count()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.counters.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            samples_enqueued: self.counters.samples_enqueued.load(Ordering::Relaxed),
            chunks_emitted: self.counters.chunks_emitted.load(Ordering::Relaxed),
            resampler_rebuilds: self.resampler.lock().rebuilds(),
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Runs on the device thread for every captured frame
struct FrameProcessor {
    target_rate: u32,
    buffer: SharedRingBuffer,
    resampler: Arc<Mutex<StreamResampler>>,
    capturing: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
}

impl FrameProcessor {
    fn process(&self, data: &[f32], format: DeviceFormat) {
        if !self.capturing.load(Ordering::Relaxed) {
            return;
        }
        if data.is_empty() || format.channels == 0 {
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);

        let mono = mix_to_mono(data, format.channels);

        if format.sample_rate == self.target_rate {
            self.enqueue(&mono);
            return;
        }

        let resampled = self.resampler.lock().process(&mono, format.sample_rate);
        match resampled {
            Ok(resampled) => {
                if !resampled.is_empty() {
                    self.enqueue(&resampled);
                }
            }
            Err(e) => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Resampling error, dropping frame: {}", e);
            }
        }
    }

    fn enqueue(&self, samples: &[f32]) {
        if self.buffer.enqueue(samples) {
            self.counters
                .samples_enqueued
                .fetch_add(samples.len() as u64, Ordering::Relaxed);
        }
    }
}

/// Drains fixed-size chunks from the capture buffer to the outbound callback
struct ChunkConsumer {
    buffer: SharedRingBuffer,
    processing: Arc<AtomicBool>,
    chunk_size: usize,
    backoff: Duration,
    sample_rate: u32,
    channels: u16,
    outbound: OutboundCallback,
    counters: Arc<CaptureCounters>,
}

impl ChunkConsumer {
    fn run(self) {
        let mut chunk = Vec::with_capacity(self.chunk_size);

        while self.processing.load(Ordering::Relaxed) {
            if self.buffer.available_count() >= self.chunk_size
                && self.buffer.dequeue_into(&mut chunk, self.chunk_size)
            {
                self.counters.chunks_emitted.fetch_add(1, Ordering::Relaxed);
                (self.outbound)(&chunk, self.sample_rate, self.channels);
            } else {
                thread::sleep(self.backoff);
            }
        }

        tracing::debug!("Capture consumer exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::MockBackend;
    use crossbeam_channel::unbounded;

    fn engine_with(format: DeviceFormat) -> (CaptureEngine, MockBackend, crossbeam_channel::Receiver<Vec<f32>>) {
        let backend = MockBackend::new(format);
        let (tx, rx) = unbounded();
        let outbound: OutboundCallback = Arc::new(move |chunk: &[f32], _rate: u32, _channels: u16| {
            let _ = tx.send(chunk.to_vec());
        });
        let engine = CaptureEngine::new(AudioSettings::default(), Arc::new(backend.clone()), outbound);
        (engine, backend, rx)
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let (engine, backend, _rx) = engine_with(DeviceFormat::new(48000, 1));
        assert_eq!(engine.state(), CaptureState::Idle);

        assert!(engine.start().unwrap());
        assert_eq!(engine.state(), CaptureState::Capturing);
        assert!(engine.is_capturing());
        assert!(backend.microphone().is_capturing());

        // Second start is a no-op and says so
        assert!(!engine.start().unwrap());
        assert_eq!(backend.microphone().open_count(), 1);

        assert!(engine.stop());
        assert_eq!(engine.state(), CaptureState::Idle);
        assert!(!backend.microphone().is_capturing());

        // Idempotent
        assert!(!engine.stop());
        assert!(!engine.is_capturing());
    }

    #[test]
    fn test_open_failure_leaves_engine_idle() {
        let (engine, backend, _rx) = engine_with(DeviceFormat::new(48000, 1));
        backend.microphone().set_unavailable(true);

        assert!(engine.start().is_err());
        assert_eq!(engine.state(), CaptureState::Idle);
        assert!(!engine.is_capturing());
    }

    #[test]
    fn test_frames_ignored_after_stop() {
        let (engine, backend, _rx) = engine_with(DeviceFormat::new(48000, 1));
        let mic = backend.microphone();

        engine.start().unwrap();
        engine.stop();

        assert!(!mic.push(&[0.1; 480]));
        assert_eq!(engine.stats().frames_captured, 0);
    }

    #[test]
    fn test_stereo_frames_mixed_down() {
        let (engine, backend, rx) = engine_with(DeviceFormat::new(48000, 2));
        engine.start().unwrap();

        let stereo: Vec<f32> = (0..1920).map(|i| if i % 2 == 0 { 0.5 } else { 0.25 }).collect();
        assert!(backend.microphone().push(&stereo));

        let chunk = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(chunk.len(), 960);
        assert!(chunk.iter().all(|&s| (s - 0.375).abs() < 1e-6));

        engine.stop();
    }

    #[test]
    fn test_partial_chunk_waits_for_more() {
        let (engine, backend, rx) = engine_with(DeviceFormat::new(48000, 1));
        engine.start().unwrap();

        backend.microphone().push(&[0.2; 500]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(engine.buffered_samples(), 500);

        backend.microphone().push(&[0.2; 500]);
        let chunk = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(chunk.len(), 960);

        engine.stop();
    }
}
