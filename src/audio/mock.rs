//! In-process capture backend and sinks.
//!
//! Useful for tests and for embedding the pipeline where audio I/O is done
//! elsewhere. [`MockMicrophone`] pushes frames synchronously through the
//! same callback a real device would use; [`MockSinkFactory`] records the
//! PCM each participant's sink receives.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::device::{CaptureBackend, CaptureDevice, FrameCallback};
use crate::audio::format::{pcm16_to_i16, DeviceFormat};
use crate::audio::sink::{AudioSink, SinkFactory};
use crate::error::AudioError;

/// Handle for driving a mock microphone from the test side
#[derive(Clone)]
pub struct MockMicrophone {
    callback: Arc<Mutex<Option<FrameCallback>>>,
    format: Arc<Mutex<DeviceFormat>>,
    fail_open: Arc<AtomicBool>,
    opened: Arc<AtomicUsize>,
}

impl MockMicrophone {
    pub fn new(format: DeviceFormat) -> Self {
        Self {
            callback: Arc::new(Mutex::new(None)),
            format: Arc::new(Mutex::new(format)),
            fail_open: Arc::new(AtomicBool::new(false)),
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliver one interleaved frame. Returns false if nothing is capturing.
    pub fn push(&self, samples: &[f32]) -> bool {
        let format = *self.format.lock();
        let mut callback = self.callback.lock();
        match callback.as_mut() {
            Some(on_frame) => {
                on_frame(samples, format);
                true
            }
            None => false,
        }
    }

    /// Change the format reported with subsequent frames
    pub fn set_format(&self, format: DeviceFormat) {
        *self.format.lock() = format;
    }

    /// Make the next `open_default` calls fail, as if no device were present
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_open.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_capturing(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Number of successful device opens
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

/// Backend whose default device is a [`MockMicrophone`]
#[derive(Clone)]
pub struct MockBackend {
    microphone: MockMicrophone,
}

impl MockBackend {
    pub fn new(format: DeviceFormat) -> Self {
        Self {
            microphone: MockMicrophone::new(format),
        }
    }

    pub fn microphone(&self) -> MockMicrophone {
        self.microphone.clone()
    }
}

impl CaptureBackend for MockBackend {
    fn open_default(&self) -> Result<Box<dyn CaptureDevice>, AudioError> {
        if self.microphone.fail_open.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceNotFound("mock microphone unavailable".into()));
        }
        self.microphone.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCaptureDevice {
            microphone: self.microphone.clone(),
        }))
    }
}

struct MockCaptureDevice {
    microphone: MockMicrophone,
}

impl CaptureDevice for MockCaptureDevice {
    fn start(&mut self, on_frame: FrameCallback) -> Result<DeviceFormat, AudioError> {
        *self.microphone.callback.lock() = Some(on_frame);
        Ok(*self.microphone.format.lock())
    }

    fn stop(&mut self) {
        self.microphone.callback.lock().take();
    }

    fn is_capturing(&self) -> bool {
        self.microphone.is_capturing()
    }
}

/// Observable state of one mock sink
#[derive(Default)]
pub struct MockSinkState {
    pcm: Mutex<Vec<u8>>,
    playing: AtomicBool,
    stopped: AtomicBool,
    play_calls: AtomicUsize,
    fail_play: AtomicBool,
}

impl MockSinkState {
    /// All PCM queued so far, decoded to i16 samples
    pub fn samples(&self) -> Vec<i16> {
        pcm16_to_i16(&self.pcm.lock())
    }

    pub fn bytes_queued(&self) -> usize {
        self.pcm.lock().len()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn play_calls(&self) -> usize {
        self.play_calls.load(Ordering::SeqCst)
    }

    /// Make `play` fail, as if the output device rejected the stream
    pub fn set_fail_play(&self, fail: bool) {
        self.fail_play.store(fail, Ordering::SeqCst);
    }
}

struct MockSink {
    state: Arc<MockSinkState>,
}

impl AudioSink for MockSink {
    fn queue_pcm(&mut self, pcm: Bytes) -> Result<(), AudioError> {
        self.state.pcm.lock().extend_from_slice(&pcm);
        Ok(())
    }

    fn play(&mut self) -> Result<(), AudioError> {
        self.state.play_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_play.load(Ordering::SeqCst) {
            return Err(AudioError::Sink("mock output unavailable".into()));
        }
        self.state.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    fn stop(&mut self) {
        self.state.playing.store(false, Ordering::SeqCst);
        self.state.stopped.store(true, Ordering::SeqCst);
    }
}

/// Factory recording every sink it creates, keyed by participant
#[derive(Clone, Default)]
pub struct MockSinkFactory {
    sinks: Arc<Mutex<HashMap<String, Arc<MockSinkState>>>>,
    created: Arc<AtomicUsize>,
}

impl MockSinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of the most recent sink created for `participant_id`
    pub fn sink(&self, participant_id: &str) -> Option<Arc<MockSinkState>> {
        self.sinks.lock().get(participant_id).cloned()
    }

    /// Total sinks created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl SinkFactory for MockSinkFactory {
    fn create_sink(&self, participant_id: &str, _sample_rate: u32) -> Result<Box<dyn AudioSink>, AudioError> {
        let state = Arc::new(MockSinkState::default());
        self.sinks.lock().insert(participant_id.to_string(), state.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSink { state }))
    }
}
