//! Input device connectivity and the reconnection policy
//!
//! A [`DeviceMonitor`] reports devices appearing and disappearing. The
//! session feeds those reports through [`ReconnectPolicy`]: losing a device
//! stops capture straight away, and a device coming back restarts capture
//! after a short delay if voice chat was meant to be running.

use crossbeam_channel::Sender;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::list_input_devices;
use crate::error::AudioError;

/// Connectivity change for one input device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(String),
    Disconnected(String),
}

impl DeviceEvent {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::Connected(id) | DeviceEvent::Disconnected(id) => id,
        }
    }
}

/// Source of device connectivity notifications
pub trait DeviceMonitor: Send {
    /// Begin reporting events on `events`
    fn start(&mut self, events: Sender<DeviceEvent>) -> Result<(), AudioError>;

    fn stop(&mut self);
}

/// What the session should do about a device event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    None,
    StopCapture,
    /// Stop whatever is left of capture, then start it again after the delay
    RestartAfter(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub restart_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(restart_delay: Duration) -> Self {
        Self { restart_delay }
    }

    pub fn decide(&self, event: &DeviceEvent, capturing: bool, voice_chat_active: bool) -> ReconnectAction {
        match event {
            DeviceEvent::Disconnected(_) if capturing => ReconnectAction::StopCapture,
            DeviceEvent::Connected(_) if voice_chat_active => {
                ReconnectAction::RestartAfter(self.restart_delay)
            }
            _ => ReconnectAction::None,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::constants::DEFAULT_RESTART_DELAY_MS))
    }
}

type Enumerator = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Portable monitor that re-enumerates input devices on an interval and
/// reports the difference
pub struct PollingDeviceMonitor {
    interval: Duration,
    enumerate: Enumerator,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PollingDeviceMonitor {
    /// Poll the default cpal host's input devices
    pub fn new(interval: Duration) -> Self {
        Self::with_enumerator(interval, || {
            list_input_devices().into_iter().map(|device| device.id).collect()
        })
    }

    /// Poll a custom device list
    pub fn with_enumerator<F>(interval: Duration, enumerate: F) -> Self
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            interval,
            enumerate: Arc::new(enumerate),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl DeviceMonitor for PollingDeviceMonitor {
    fn start(&mut self, events: Sender<DeviceEvent>) -> Result<(), AudioError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = self.running.clone();
        let enumerate = self.enumerate.clone();
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("voice-device-monitor".to_string())
            .spawn(move || {
                // The first enumeration is the baseline, not a burst of connects
                let mut known: BTreeSet<String> = enumerate().into_iter().collect();
                tracing::debug!("Device monitor watching {} input devices", known.len());

                while running.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }

                    let current: BTreeSet<String> = enumerate().into_iter().collect();
                    for event in diff_devices(&known, &current) {
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    known = current;
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::StreamError(e.to_string())
            })?;

        self.handle = Some(handle);
        tracing::info!("Polling device monitor started ({:?} interval)", interval);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PollingDeviceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Disconnects first, then connects, each in id order
fn diff_devices(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Vec<DeviceEvent> {
    before
        .difference(after)
        .map(|id| DeviceEvent::Disconnected(id.clone()))
        .chain(after.difference(before).map(|id| DeviceEvent::Connected(id.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;

    #[test]
    fn test_policy() {
        let policy = ReconnectPolicy::new(Duration::from_millis(500));
        let gone = DeviceEvent::Disconnected("mic".into());
        let back = DeviceEvent::Connected("mic".into());

        assert_eq!(policy.decide(&gone, true, true), ReconnectAction::StopCapture);
        assert_eq!(policy.decide(&gone, false, true), ReconnectAction::None);
        assert_eq!(
            policy.decide(&back, false, true),
            ReconnectAction::RestartAfter(Duration::from_millis(500))
        );
        assert_eq!(policy.decide(&back, true, false), ReconnectAction::None);
    }

    #[test]
    fn test_diff() {
        let before: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let after: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();

        assert_eq!(
            diff_devices(&before, &after),
            vec![DeviceEvent::Disconnected("a".into()), DeviceEvent::Connected("c".into())]
        );
        assert!(diff_devices(&after, &after).is_empty());
    }

    #[test]
    fn test_polling_reports_changes() {
        let devices = Arc::new(Mutex::new(vec!["usb-mic".to_string()]));
        let source = devices.clone();
        let mut monitor =
            PollingDeviceMonitor::with_enumerator(Duration::from_millis(10), move || source.lock().clone());

        let (tx, rx) = unbounded();
        monitor.start(tx).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());

        devices.lock().clear();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            DeviceEvent::Disconnected("usb-mic".into())
        );

        devices.lock().push("usb-mic".to_string());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            DeviceEvent::Connected("usb-mic".into())
        );

        monitor.stop();
        assert!(!monitor.is_running());
    }
}
