//! Stateful sample-rate conversion for captured audio
//!
//! Wraps a rubato sinc resampler so that device frames of any length can be
//! converted to the pipeline's target rate. Input is fed to rubato in fixed
//! sub-chunks; the remainder is carried into the next call, and the filter
//! history is kept as long as the source rate does not change, so chunk
//! boundaries do not click.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::AudioError;

/// Input frames handed to rubato per process call
pub const RESAMPLER_CHUNK_FRAMES: usize = 64;

/// Mono sinc resampler that preserves state between calls
pub struct StreamResampler {
    target_rate: u32,
    source_rate: Option<u32>,
    resampler: Option<SincFixedIn<f32>>,
    /// Input not yet consumed by a full sub-chunk
    pending: Vec<f32>,
    rebuilds: u64,
}

impl StreamResampler {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            source_rate: None,
            resampler: None,
            pending: Vec::with_capacity(RESAMPLER_CHUNK_FRAMES * 2),
            rebuilds: 0,
        }
    }

    /// Resample a mono block captured at `source_rate` to the target rate.
    ///
    /// Output length tracks `input.len() * target / source`, give or take the
    /// sub-chunk carried over. A rate change discards the previous filter
    /// state. On error the pending input is dropped and the caller should
    /// drop the block.
    pub fn process(&mut self, input: &[f32], source_rate: u32) -> Result<Vec<f32>, AudioError> {
        if source_rate == 0 {
            return Err(AudioError::UnsupportedFormat("source sample rate is zero".into()));
        }
        if source_rate == self.target_rate {
            return Ok(input.to_vec());
        }
        if self.source_rate != Some(source_rate) || self.resampler.is_none() {
            self.rebuild(source_rate)?;
        }

        self.pending.extend_from_slice(input);

        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };

        let ratio = self.target_rate as f64 / source_rate as f64;
        let mut output = Vec::with_capacity((self.pending.len() as f64 * ratio) as usize + 8);
        let mut consumed = 0;

        while self.pending.len() - consumed >= RESAMPLER_CHUNK_FRAMES {
            let chunk = &self.pending[consumed..consumed + RESAMPLER_CHUNK_FRAMES];
            match resampler.process(&[chunk], None) {
                Ok(waves) => {
                    if let Some(channel) = waves.first() {
                        output.extend_from_slice(channel);
                    }
                }
                Err(e) => {
                    self.pending.clear();
                    return Err(e.into());
                }
            }
            consumed += RESAMPLER_CHUNK_FRAMES;
        }

        self.pending.drain(..consumed);
        Ok(output)
    }

    fn rebuild(&mut self, source_rate: u32) -> Result<(), AudioError> {
        let ratio = self.target_rate as f64 / source_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        self.resampler = None;
        self.pending.clear();
        self.source_rate = Some(source_rate);

        let resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLER_CHUNK_FRAMES, 1)?;
        self.resampler = Some(resampler);
        self.rebuilds += 1;

        tracing::debug!(
            "Resampler initialized: {} Hz -> {} Hz (ratio: {:.4})",
            source_rate,
            self.target_rate,
            ratio
        );
        Ok(())
    }

    /// Drop filter state; the next call rebuilds from scratch
    pub fn reset(&mut self) {
        self.resampler = None;
        self.source_rate = None;
        self.pending.clear();
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Source rate of the current filter state, if any
    pub fn source_rate(&self) -> Option<u32> {
        self.source_rate
    }

    /// How many times the filter has been (re)created
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, offset: usize, rate: u32) -> Vec<f32> {
        (offset..offset + len)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_same_rate_passthrough() {
        let mut resampler = StreamResampler::new(48000);
        let input = sine(960, 0, 48000);

        assert_eq!(resampler.process(&input, 48000).unwrap(), input);
        assert_eq!(resampler.rebuilds(), 0);
    }

    #[test]
    fn test_upsample_length() {
        let mut resampler = StreamResampler::new(48000);
        let expected = 960.0 * 48000.0 / 44100.0;

        // The first block also fills the filter's history
        let first = resampler.process(&sine(960, 0, 44100), 44100).unwrap();
        assert!(first.len() as f64 <= expected + 3.0);
        assert!(first.len() as f64 >= expected - 160.0, "first block {}", first.len());

        let second = resampler.process(&sine(960, 960, 44100), 44100).unwrap();
        assert!(
            (second.len() as f64 - expected).abs() <= 3.0,
            "got {} samples, expected ~{:.1}",
            second.len(),
            expected
        );
    }

    #[test]
    fn test_state_carried_between_calls() {
        let mut resampler = StreamResampler::new(48000);
        let mut output = resampler.process(&sine(960, 0, 44100), 44100).unwrap();
        let boundary = output.len();
        output.extend(resampler.process(&sine(960, 960, 44100), 44100).unwrap());

        assert_eq!(resampler.rebuilds(), 1);

        // 440 Hz at 0.5 amplitude moves at most ~0.029 per sample at 48 kHz.
        // Skip the filter's start-up delay.
        let max_step = output[300..]
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0f32, f32::max);
        assert!(max_step < 0.05, "max step {}", max_step);

        let boundary_step = (output[boundary] - output[boundary - 1]).abs();
        assert!(boundary_step < 0.05, "boundary step {}", boundary_step);
    }

    #[test]
    fn test_output_independent_of_call_boundaries() {
        let input = sine(1000, 0, 32000);

        let mut whole = StreamResampler::new(48000);
        let expected = whole.process(&input, 32000).unwrap();

        let mut split = StreamResampler::new(48000);
        let mut output = Vec::new();
        for block in input.chunks(100) {
            output.extend(split.process(block, 32000).unwrap());
        }

        assert_eq!(output, expected);
        assert_eq!(split.rebuilds(), 1);
    }

    #[test]
    fn test_rate_change_rebuilds() {
        let mut resampler = StreamResampler::new(48000);
        resampler.process(&sine(256, 0, 44100), 44100).unwrap();
        resampler.process(&sine(256, 0, 16000), 16000).unwrap();
        resampler.process(&sine(256, 256, 16000), 16000).unwrap();

        assert_eq!(resampler.rebuilds(), 2);
        assert_eq!(resampler.source_rate(), Some(16000));
    }

    #[test]
    fn test_zero_rate_rejected() {
        let mut resampler = StreamResampler::new(48000);
        assert!(resampler.process(&[0.0; 64], 0).is_err());
    }
}
