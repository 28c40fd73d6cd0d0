//! Playback sinks for remote participants
//!
//! Each remote participant gets its own [`AudioSink`], created through a
//! [`SinkFactory`] when their stream is first seen. The scheduler feeds it
//! little-endian 16-bit mono PCM.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::format::pcm16_to_i16;
use crate::audio::resample::StreamResampler;
use crate::constants;
use crate::error::AudioError;

/// Playback endpoint bound to one participant
pub trait AudioSink: Send {
    /// Queue PCM16 little-endian mono bytes for playback
    fn queue_pcm(&mut self, pcm: Bytes) -> Result<(), AudioError>;

    /// Start playback if not already playing
    fn play(&mut self) -> Result<(), AudioError>;

    fn is_playing(&self) -> bool;

    /// Stop playback and release the output stream
    fn stop(&mut self);
}

/// Creates sinks for newly seen participants
pub trait SinkFactory: Send + Sync {
    fn create_sink(&self, participant_id: &str, sample_rate: u32) -> Result<Box<dyn AudioSink>, AudioError>;
}

/// Sinks on the default output device, one cpal stream per participant
#[derive(Debug, Clone)]
pub struct CpalSinkFactory {
    /// Queued audio per sink, in seconds
    queue_secs: f32,
}

impl CpalSinkFactory {
    pub fn new(queue_secs: f32) -> Self {
        let queue_secs = if queue_secs.is_finite() {
            queue_secs.clamp(0.0, constants::MAX_BUFFER_SECONDS)
        } else {
            constants::DEFAULT_BUFFER_SECONDS
        };
        Self { queue_secs }
    }
}

impl Default for CpalSinkFactory {
    fn default() -> Self {
        Self::new(2.0)
    }
}

impl SinkFactory for CpalSinkFactory {
    fn create_sink(&self, participant_id: &str, sample_rate: u32) -> Result<Box<dyn AudioSink>, AudioError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))?;
        let default_config = device.default_output_config()?;

        let sample_format = default_config.sample_format();
        if !matches!(sample_format, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16) {
            return Err(AudioError::UnsupportedFormat(format!("{:?}", sample_format)));
        }

        // The device runs at its own rate; participant audio is converted
        let config: StreamConfig = default_config.config();
        let device_rate = config.sample_rate.0;
        let resampler = (device_rate != sample_rate).then(|| StreamResampler::new(device_rate));
        if resampler.is_some() {
            tracing::debug!(
                "Sink for {} resamples {} Hz -> {} Hz",
                participant_id,
                sample_rate,
                device_rate
            );
        }

        let capacity = ((device_rate as f32 * self.queue_secs) as usize).max(1);

        Ok(Box::new(CpalSink {
            participant_id: participant_id.to_string(),
            sample_format,
            config,
            source_rate: sample_rate,
            resampler,
            queue: Arc::new(ArrayQueue::new(capacity)),
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            thread_handle: None,
        }))
    }
}

/// cpal output stream for one participant.
///
/// Like capture, the `!Send` stream lives on its own thread. Samples cross
/// over through a bounded lock-free queue; underruns play silence.
pub struct CpalSink {
    participant_id: String,
    sample_format: SampleFormat,
    config: StreamConfig,
    /// Rate of the PCM handed to `queue_pcm`
    source_rate: u32,
    /// Present when the participant's rate differs from the device's
    resampler: Option<StreamResampler>,
    queue: Arc<ArrayQueue<f32>>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Samples discarded because the output queue was full
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AudioSink for CpalSink {
    fn queue_pcm(&mut self, pcm: Bytes) -> Result<(), AudioError> {
        let samples = pcm_to_device_rate(&pcm, self.resampler.as_mut(), self.source_rate)?;

        let mut dropped = 0u64;
        for sample in samples {
            if self.queue.push(sample).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            tracing::trace!("Sink for {} dropped {} samples", self.participant_id, dropped);
        }
        Ok(())
    }

    fn play(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = self.running.clone();
        let queue = self.queue.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("voice-playback-{}", self.participant_id))
            .spawn(move || {
                let device = match cpal::default_host().default_output_device() {
                    Some(device) => device,
                    None => {
                        let _ = ready_tx.send(Err(AudioError::DeviceNotFound(
                            "No default output device".to_string(),
                        )));
                        return;
                    }
                };

                let stream = match sample_format {
                    SampleFormat::F32 => build_output::<f32>(&device, &config, queue),
                    SampleFormat::I16 => build_output::<i16>(&device, &config, queue),
                    SampleFormat::U16 => build_output::<u16>(&device, &config, queue),
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

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::Sink(e.to_string())
            })?;

        self.thread_handle = Some(handle);

        let ready = ready_rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap_or_else(|_| Err(AudioError::Sink("playback thread did not report".into())));

        if let Err(e) = ready {
            self.stop();
            return Err(e);
        }

        tracing::debug!("Playback started for {}", self.participant_id);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        while self.queue.pop().is_some() {}
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    queue: Arc<ArrayQueue<f32>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // Mono source duplicated across every output channel
            for frame in data.chunks_mut(channels) {
                let sample = T::from_sample(queue.pop().unwrap_or(0.0));
                for out in frame.iter_mut() {
                    *out = sample;
                }
            }
        },
        |err| tracing::error!("Output stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

/// Decode PCM16 to f32 and convert it to the output device's rate
fn pcm_to_device_rate(
    pcm: &[u8],
    resampler: Option<&mut StreamResampler>,
    source_rate: u32,
) -> Result<Vec<f32>, AudioError> {
    let samples: Vec<f32> = pcm16_to_i16(pcm)
        .into_iter()
        .map(|sample| sample.to_sample::<f32>())
        .collect();
    match resampler {
        Some(resampler) => resampler.process(&samples, source_rate),
        None => Ok(samples),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::to_pcm16_bytes;

    #[test]
    fn test_matching_rate_passes_through() {
        let pcm = to_pcm16_bytes(&[0.5; 960]);
        let samples = pcm_to_device_rate(&pcm, None, 48000).unwrap();
        assert_eq!(samples.len(), 960);
        assert!(samples.iter().all(|&s| (s - 0.5).abs() < 1e-3));
    }

    #[test]
    fn test_low_rate_participant_upsampled_to_device() {
        let mut resampler = StreamResampler::new(48000);
        let tone: Vec<f32> = (0..3200)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16000.0).sin() * 0.5)
            .collect();

        let mut produced = 0;
        for block in tone.chunks(320) {
            let pcm = to_pcm16_bytes(block);
            produced += pcm_to_device_rate(&pcm, Some(&mut resampler), 16000).unwrap().len();
        }

        // 0.2 s of 16 kHz audio is about 9600 samples at 48 kHz
        assert!(produced > 9000 && produced <= 9600, "produced {}", produced);
        assert_eq!(resampler.rebuilds(), 1);
    }

    #[test]
    fn test_queue_length_bounded() {
        assert_eq!(CpalSinkFactory::new(f32::INFINITY).queue_secs, constants::DEFAULT_BUFFER_SECONDS);
        assert_eq!(CpalSinkFactory::new(1e9).queue_secs, constants::MAX_BUFFER_SECONDS);
    }
}
