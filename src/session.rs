//! Voice chat session
//!
//! [`VoiceChat`] ties the pipeline together: the capture engine on the send
//! side, the stream registry and playback scheduler on the receive side, and
//! a coordinator thread that owns everything which must happen in one place:
//!
//! - creating sinks for newly seen participants
//! - reacting to input devices disappearing and coming back
//! - the delayed capture restart after a reconnect

use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::capture::{CaptureEngine, CaptureStats, OutboundCallback};
use crate::audio::device::CaptureBackend;
use crate::audio::sink::SinkFactory;
use crate::config::VoiceChatConfig;
use crate::constants;
use crate::error::{AudioError, Error, Result};
use crate::events::{EventBus, VoiceEvent};
use crate::monitor::{DeviceEvent, DeviceMonitor, ReconnectAction, ReconnectPolicy};
use crate::playback::registry::{PlaybackStreamRegistry, RegistryStats, StreamRequest};
use crate::playback::scheduler::PlaybackScheduler;

pub struct VoiceChat {
    capture: Arc<CaptureEngine>,
    registry: Arc<PlaybackStreamRegistry>,
    scheduler: PlaybackScheduler,
    events: EventBus,

    /// Whether voice chat should be running, independent of the device
    voice_chat_active: Arc<AtomicBool>,

    device_tx: Sender<DeviceEvent>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<Box<dyn DeviceMonitor>>>,
}

impl VoiceChat {
    /// Build the pipeline and start its coordinator. Capture and playback
    /// stay off until requested.
    pub fn new(
        config: VoiceChatConfig,
        backend: Arc<dyn CaptureBackend>,
        sinks: Arc<dyn SinkFactory>,
        outbound: OutboundCallback,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new();
        let capture = Arc::new(CaptureEngine::new(config.audio.clone(), backend, outbound));
        let registry = Arc::new(PlaybackStreamRegistry::new(&config.playback, sinks, events.clone()));
        let scheduler = PlaybackScheduler::new(&config.playback, registry.clone());
        let voice_chat_active = Arc::new(AtomicBool::new(false));

        let (device_tx, device_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let coordinator = Coordinator {
            capture: capture.clone(),
            registry: registry.clone(),
            events: events.clone(),
            voice_chat_active: voice_chat_active.clone(),
            policy: ReconnectPolicy::new(config.device.restart_delay()),
            requests: registry.requests(),
            device_rx,
            shutdown_rx,
        };

        let handle = thread::Builder::new()
            .name("voice-coordinator".to_string())
            .spawn(move || coordinator.run())
            .map_err(|e| Error::Audio(AudioError::StreamError(format!("failed to spawn coordinator: {}", e))))?;

        Ok(Self {
            capture,
            registry,
            scheduler,
            events,
            voice_chat_active,
            device_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            coordinator: Mutex::new(Some(handle)),
            monitor: Mutex::new(None),
        })
    }

    /// Start capturing. Voice chat is marked active even if the device
    /// cannot be opened, so a later reconnect brings capture up.
    pub fn start_voice_chat(&self) -> Result<()> {
        self.voice_chat_active.store(true, Ordering::SeqCst);
        start_capture(&self.capture, &self.events)?;
        Ok(())
    }

    pub fn stop_voice_chat(&self) {
        self.voice_chat_active.store(false, Ordering::SeqCst);
        stop_capture(&self.capture, &self.events);
    }

    /// Start draining incoming audio to the sinks
    pub fn play_voice_chat(&self) -> Result<()> {
        self.scheduler.set_processing(true);
        self.scheduler.start()?;
        Ok(())
    }

    /// Stop draining incoming audio and stop the playback tick
    pub fn mute_voice_chat(&self) {
        self.scheduler.set_processing(false);
        self.scheduler.stop();
    }

    /// Inbound audio from the network for one participant
    pub fn ingest(&self, participant_id: &str, samples: &[f32], sample_rate: u32, channels: u16) {
        self.registry.ingest(participant_id, samples, sample_rate, channels);
    }

    pub fn remove_stream(&self, participant_id: &str) -> bool {
        self.registry.remove(participant_id)
    }

    /// Change how long a stream may stay idle before it is removed
    pub fn set_stream_timeout(&self, secs: f32) {
        if !(secs > 0.0 && secs <= constants::MAX_STREAM_TIMEOUT_SECS) {
            tracing::warn!("Ignoring invalid stream timeout {}", secs);
            return;
        }
        match Duration::try_from_secs_f32(secs) {
            Ok(timeout) => self.registry.set_stream_timeout(timeout),
            Err(e) => tracing::warn!("Ignoring stream timeout {}: {}", secs, e),
        }
    }

    pub fn subscribe(&self) -> Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    /// Channel for reporting device connectivity from outside the crate
    pub fn device_events(&self) -> Sender<DeviceEvent> {
        self.device_tx.clone()
    }

    /// Start `monitor` feeding this session, replacing any previous one
    pub fn attach_monitor(&self, mut monitor: Box<dyn DeviceMonitor>) -> Result<()> {
        monitor.start(self.device_tx.clone())?;
        if let Some(mut previous) = self.monitor.lock().replace(monitor) {
            previous.stop();
        }
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_capturing()
    }

    pub fn is_voice_chat_active(&self) -> bool {
        self.voice_chat_active.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.scheduler.is_ticking() && self.scheduler.is_processing()
    }

    pub fn registry(&self) -> &Arc<PlaybackStreamRegistry> {
        &self.registry
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Stop everything and join the background threads. Safe to call twice.
    pub fn shutdown(&self) {
        if let Some(mut monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.coordinator.lock().take() {
            let _ = handle.join();
        }

        self.mute_voice_chat();
        self.stop_voice_chat();
        self.registry.clear();
    }
}

impl Drop for VoiceChat {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn start_capture(capture: &CaptureEngine, events: &EventBus) -> std::result::Result<(), AudioError> {
    if capture.start()? {
        events.emit(VoiceEvent::CaptureStarted);
    }
    Ok(())
}

fn stop_capture(capture: &CaptureEngine, events: &EventBus) {
    if capture.stop() {
        events.emit(VoiceEvent::CaptureStopped);
    }
}

/// Single thread that creates streams and applies the reconnection policy
struct Coordinator {
    capture: Arc<CaptureEngine>,
    registry: Arc<PlaybackStreamRegistry>,
    events: EventBus,
    voice_chat_active: Arc<AtomicBool>,
    policy: ReconnectPolicy,
    requests: Receiver<StreamRequest>,
    device_rx: Receiver<DeviceEvent>,
    shutdown_rx: Receiver<()>,
}

impl Coordinator {
    fn run(self) {
        let mut restart_at: Option<Instant> = None;

        loop {
            let restart_timer = match restart_at {
                Some(deadline) => crossbeam_channel::at(deadline),
                None => never(),
            };

            select! {
                recv(self.requests) -> request => match request {
                    Ok(request) => self.registry.fulfil(&request),
                    Err(_) => break,
                },
                recv(self.device_rx) -> event => match event {
                    Ok(event) => self.on_device_event(event, &mut restart_at),
                    Err(_) => break,
                },
                recv(restart_timer) -> _ => {
                    restart_at = None;
                    self.restart_capture();
                },
                recv(self.shutdown_rx) -> _ => break,
            }
        }

        tracing::debug!("Voice coordinator exited");
    }

    fn on_device_event(&self, event: DeviceEvent, restart_at: &mut Option<Instant>) {
        let device_id = event.device_id().to_string();
        match &event {
            DeviceEvent::Connected(_) => {
                tracing::info!("Audio device connected: {}", device_id);
                self.events.emit(VoiceEvent::DeviceConnected { device_id });
            }
            DeviceEvent::Disconnected(_) => {
                tracing::info!("Audio device disconnected: {}", device_id);
                self.events.emit(VoiceEvent::DeviceDisconnected { device_id });
            }
        }

        let action = self.policy.decide(
            &event,
            self.capture.is_capturing(),
            self.voice_chat_active.load(Ordering::SeqCst),
        );

        match action {
            ReconnectAction::None => {}
            ReconnectAction::StopCapture => stop_capture(&self.capture, &self.events),
            ReconnectAction::RestartAfter(delay) => {
                // Start from a clean state; a newer connect pushes the restart back
                stop_capture(&self.capture, &self.events);
                *restart_at = Some(Instant::now() + delay);
                tracing::info!("Restarting voice capture in {:?}", delay);
                self.events.emit(VoiceEvent::RestartScheduled { delay });
            }
        }
    }

    fn restart_capture(&self) {
        if !self.voice_chat_active.load(Ordering::SeqCst) {
            tracing::debug!("Voice chat stopped before restart, skipping");
            return;
        }
        if let Err(e) = start_capture(&self.capture, &self.events) {
            tracing::error!("Failed to restart voice capture: {}", e);
        }
    }
}
