//! Channel conversion
//!
//! The echo canceller and the rate converter are single-channel; the
//! codec DAC path is stereo. These helpers move interleaved PCM between
//! the two layouts.

use crate::Sample;

/// Downmix interleaved stereo to mono by averaging each L/R pair.
///
/// A trailing unpaired sample is passed through unchanged.
pub fn stereo_to_mono(input: &[Sample]) -> Vec<Sample> {
    let mut out = Vec::with_capacity(input.len() / 2 + 1);
    let mut chunks = input.chunks_exact(2);
    for pair in &mut chunks {
        out.push(((pair[0] as i32 + pair[1] as i32) / 2) as Sample);
    }
    out.extend_from_slice(chunks.remainder());
    out
}

/// Upmix mono to interleaved stereo by duplicating every sample.
pub fn mono_to_stereo(input: &[Sample]) -> Vec<Sample> {
    let mut out = Vec::with_capacity(input.len() * 2);
    for &s in input {
        out.push(s);
        out.push(s);
    }
    out
}
