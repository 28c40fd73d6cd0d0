//! Pipeline notifications
//!
//! Listeners subscribe to an [`EventBus`] and receive [`VoiceEvent`]s over
//! their own unbounded channel. Emitting never blocks.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Something listeners outside the pipeline may care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    CaptureStarted,
    CaptureStopped,
    StreamCreated { participant_id: String },
    /// Stream removed after going idle
    StreamTimeout { participant_id: String },
    /// Stream removed on request
    StreamRemoved { participant_id: String },
    DeviceConnected { device_id: String },
    DeviceDisconnected { device_id: String },
    /// Capture will restart after `delay`
    RestartScheduled { delay: Duration },
}

/// Fan-out of [`VoiceEvent`]s to any number of subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<VoiceEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<VoiceEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned
    pub fn emit(&self, event: VoiceEvent) {
        tracing::trace!("Event: {:?}", event);
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.emit(VoiceEvent::CaptureStarted);

        assert_eq!(a.try_recv().unwrap(), VoiceEvent::CaptureStarted);
        assert_eq!(b.try_recv().unwrap(), VoiceEvent::CaptureStarted);
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.emit(VoiceEvent::CaptureStopped);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), VoiceEvent::CaptureStopped);
    }
}
