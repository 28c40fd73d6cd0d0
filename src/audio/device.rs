//! Audio device enumeration and microphone capture backends
//!
//! The capture engine talks to the microphone through [`CaptureBackend`] and
//! [`CaptureDevice`]. [`CpalBackend`] is the real implementation; tests use
//! the in-process one in [`crate::audio::mock`].

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::format::DeviceFormat;
use crate::error::AudioError;

/// Called from the device thread with each interleaved frame it captures
pub type FrameCallback = Box<dyn FnMut(&[f32], DeviceFormat) + Send>;

/// An opened microphone
pub trait CaptureDevice: Send {
    /// Begin delivering frames to `on_frame`. Returns the device format.
    fn start(&mut self, on_frame: FrameCallback) -> Result<DeviceFormat, AudioError>;

    /// Stop delivering frames and release the device stream
    fn stop(&mut self);

    fn is_capturing(&self) -> bool;
}

/// Source of microphone handles
pub trait CaptureBackend: Send + Sync {
    /// Open the system's default input device
    fn open_default(&self) -> Result<Box<dyn CaptureDevice>, AudioError>;
}

/// Basic information about an input device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available input devices
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let mut devices = Vec::new();

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device);
                devices.push(InputDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_name.as_ref() == Some(&name),
                    name,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

/// Get device capabilities
fn get_device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    if let Ok(configs) = device.supported_input_configs() {
        for config in configs {
            for rate_val in [8000u32, 16000, 22050, 32000, 44100, 48000, 96000] {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !sample_rates.contains(&rate_val)
                {
                    sample_rates.push(rate_val);
                }
            }

            let ch = config.channels();
            if !channels.contains(&ch) {
                channels.push(ch);
            }
        }
    }

    sample_rates.sort();
    channels.sort();

    (sample_rates, channels)
}

/// Get default input device
pub fn default_input_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
}

/// cpal-backed capture backend using the default host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CaptureBackend for CpalBackend {
    fn open_default(&self) -> Result<Box<dyn CaptureDevice>, AudioError> {
        let device = default_input_device()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let default_config = device.default_input_config()?;

        tracing::info!(
            "Opened input device '{}': {} Hz, {} channels, {:?}",
            name,
            default_config.sample_rate().0,
            default_config.channels(),
            default_config.sample_format()
        );

        Ok(Box::new(CpalCaptureDevice {
            name,
            sample_format: default_config.sample_format(),
            config: default_config.config(),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }))
    }
}

/// A cpal input stream driven from a dedicated thread.
///
/// cpal streams are not `Send`, so the stream is built and kept alive inside
/// the thread for as long as capture runs.
pub struct CpalCaptureDevice {
    name: String,
    sample_format: SampleFormat,
    config: StreamConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CaptureDevice for CpalCaptureDevice {
    fn start(&mut self, on_frame: FrameCallback) -> Result<DeviceFormat, AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::StreamError(format!("'{}' is already capturing", self.name)));
        }

        let format = DeviceFormat::new(self.config.sample_rate.0, self.config.channels);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = self.running.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let name = self.name.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || {
                let device = match default_input_device() {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let stream = match sample_format {
                    SampleFormat::F32 => build_input::<f32>(&device, &config, format, on_frame),
                    SampleFormat::I16 => build_input::<i16>(&device, &config, format, on_frame),
                    SampleFormat::U16 => build_input::<u16>(&device, &config, format, on_frame),
                    other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                tracing::debug!("Capture stream for '{}' released", name);
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::StreamError(e.to_string())
            })?;

        self.thread_handle = Some(handle);

        let ready = ready_rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread did not report".into())));

        if let Err(e) = ready {
            self.stop();
            return Err(e);
        }
        Ok(format)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_capturing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CpalCaptureDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    format: DeviceFormat,
    mut on_frame: FrameCallback,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
            on_frame(&scratch, format);
        },
        |err| tracing::error!("Input stream error: {}", err),
        None,
    )?;
    Ok(stream)
}
