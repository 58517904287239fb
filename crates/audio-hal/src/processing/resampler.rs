//! Stream rate converter
//!
//! Linear-interpolating sample-rate conversion between an
//! application-requested rate and the hardware-forced rate. The
//! converter is stateful across calls: it carries the interpolation
//! position, the last input sample and, because the device writes
//! must stay 32-bit aligned, a one-sample remainder whenever a
//! conversion produces an odd sample count. No sample is ever dropped.

use crate::Sample;

/// Mono PCM rate converter
#[derive(Debug)]
pub struct Resampler {
    source_rate: u32,
    target_rate: u32,
    /// Fractional read position relative to the current chunk start
    pos: f64,
    /// Last sample of the previous chunk, virtual index -1
    prev: Sample,
    has_prev: bool,
    /// Odd-count remainder buffered for the next call
    pending: Option<Sample>,
}

impl Resampler {
    /// Create a converter between two rates
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            source_rate,
            target_rate,
            pos: 0.0,
            prev: 0,
            has_prev: false,
            pending: None,
        }
    }

    /// Source rate in Hz
    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    /// Target rate in Hz
    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Expected output size for an input of `input_len` samples
    pub fn estimated_output(&self, input_len: usize) -> usize {
        (input_len as f64 * self.target_rate as f64 / self.source_rate as f64).ceil() as usize
    }

    /// Convert a chunk of mono samples.
    ///
    /// Equal rates are the identity transform, byte for byte. The
    /// returned chunk always has an even sample count; an odd trailing
    /// sample is buffered and prepended to the next call's output.
    pub fn process(&mut self, input: &[Sample]) -> Vec<Sample> {
        if self.source_rate == self.target_rate {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let step = self.source_rate as f64 / self.target_rate as f64;
        let mut out = Vec::with_capacity(self.estimated_output(input.len()) + 2);
        if let Some(p) = self.pending.take() {
            out.push(p);
        }

        let mut pos = self.pos;
        while pos < input.len() as f64 {
            let idx = pos.floor() as isize;
            let frac = pos - idx as f64;
            let (a, b) = if idx < 0 {
                let a = if self.has_prev { self.prev } else { input[0] };
                (a, input[0])
            } else {
                let i = idx as usize;
                let a = input[i];
                let b = if i + 1 < input.len() { input[i + 1] } else { a };
                (a, b)
            };
            let sample = a as f64 + (b as f64 - a as f64) * frac;
            out.push(sample.round() as Sample);
            pos += step;
        }
        self.pos = pos - input.len() as f64;
        self.prev = input[input.len() - 1];
        self.has_prev = true;

        if out.len() % 2 == 1 {
            self.pending = out.pop();
        }
        out
    }

    /// Drop all carried state
    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.prev = 0;
        self.has_prev = false;
        self.pending = None;
    }
}
