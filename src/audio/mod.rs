//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod format;
pub mod mock;
pub mod resample;
pub mod sink;

pub use buffer::{create_shared_buffer, RingBuffer, SharedRingBuffer};
pub use capture::{CaptureEngine, CaptureState, CaptureStats, OutboundCallback};
pub use device::{list_input_devices, CaptureBackend, CaptureDevice, CpalBackend, InputDeviceInfo};
pub use format::DeviceFormat;
pub use resample::StreamResampler;
pub use sink::{AudioSink, CpalSinkFactory, SinkFactory};
