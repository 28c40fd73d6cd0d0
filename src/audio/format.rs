//! Sample format helpers: mono mixdown and PCM16 conversion

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;

/// Format reported by a capture device for the frames it delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl DeviceFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }
}

/// Average interleaved channels into a single mono channel.
///
/// Mono input is borrowed as-is. A trailing partial frame is ignored.
pub fn mix_to_mono(samples: &[f32], channels: u16) -> Cow<'_, [f32]> {
    if channels <= 1 {
        return Cow::Borrowed(samples);
    }

    let channels = channels as usize;
    let inv_channels = 1.0 / channels as f32;
    let mono = samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * inv_channels)
        .collect();
    Cow::Owned(mono)
}

/// Convert float samples in [-1, 1] to little-endian 16-bit PCM bytes.
///
/// Samples are clamped before scaling by 32767.
pub fn to_pcm16_bytes(samples: &[f32]) -> Bytes {
    let mut pcm = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        pcm.put_i16_le((sample.clamp(-1.0, 1.0) * 32767.0) as i16);
    }
    pcm.freeze()
}

/// Decode little-endian 16-bit PCM bytes. An odd trailing byte is ignored.
pub fn pcm16_to_i16(mut pcm: &[u8]) -> Vec<i16> {
    let mut out = Vec::with_capacity(pcm.len() / 2);
    while pcm.remaining() >= 2 {
        out.push(pcm.get_i16_le());
    }
    out
}
