//! # Audio HAL core
//!
//! `audio-hal` binds a fixed userspace audio API to a phone-class
//! SoC/codec combination. The crate owns the audio routing and stream
//! state machine: given the set of active output/input devices, the call
//! mode and accessory state it decides which physical codec paths to
//! enable, which sample rate and gain to program, whether hardware echo
//! cancellation / noise suppression (EC/NS) must run, and it keeps the
//! speaker, Bluetooth SCO and S/PDIF sinks fed in real time while
//! rate-converting and echo-cancelling between them.
//!
//! The physical device nodes are reached through the [`hw`] traits; a
//! linux devfs backend and a scriptable mock backend are provided.
//!
//! ## Quick start
//!
//! ```no_run
//! use audio_hal::prelude::*;
//! use std::sync::Arc;
//!
//! let hardware = Arc::new(audio_hal::hw::mock::MockHardware::new());
//! let engine = AudioEngine::new(HalConfig::default(), hardware);
//!
//! let mut params = StreamParams::default_output();
//! let output = engine.open_output_stream(DeviceMask(device::output::SPEAKER), &mut params)?;
//! output.write(&[0u8; 4096])?;
//! # Ok::<(), audio_hal::Error>(())
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod gain;
pub mod hw;
pub mod params;
pub mod processing;
pub mod routing;
pub mod streams;

pub use config::HalConfig;
pub use device::{CallMode, DeviceMask, InputPath, InputSource, OutputPath, Usecase};
pub use engine::AudioEngine;
pub use error::{Error, Result};
pub use streams::{InputStream, OutputStream};

/// Raw PCM sample type used throughout the HAL
pub type Sample = i16;

/// Bytes per [`Sample`]
pub const BYTES_PER_SAMPLE: usize = std::mem::size_of::<Sample>();

/// Sample format carried by the streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Signed 16-bit linear PCM, the only format the codec accepts
    #[default]
    Pcm16,
}

/// Requested stream configuration, corrected in place on rejection.
///
/// A zero field means "use the hardware default". When a requested value
/// cannot be honored the open call writes the supported value back here
/// and returns [`Error::BadValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    /// Sample format
    pub format: SampleFormat,
    /// Channel count (1 or 2), 0 for default
    pub channels: u8,
    /// Sample rate in Hz, 0 for default
    pub rate: u32,
}

impl StreamParams {
    /// Defaults for the playback path: stereo PCM16 at 44.1 kHz
    pub fn default_output() -> Self {
        Self {
            format: SampleFormat::Pcm16,
            channels: 2,
            rate: config::OUTPUT_RATE,
        }
    }

    /// Defaults for the capture path: mono PCM16 at the default input rate
    pub fn default_input() -> Self {
        Self {
            format: SampleFormat::Pcm16,
            channels: 1,
            rate: config::DEFAULT_INPUT_RATE,
        }
    }

    /// Bytes per frame (one sample per channel)
    pub fn frame_size(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }
}

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::config::HalConfig;
    pub use crate::device::{self, CallMode, DeviceMask, InputPath, InputSource, OutputPath, Usecase};
    pub use crate::engine::AudioEngine;
    pub use crate::error::{Error, Result};
    pub use crate::streams::{InputStream, OutputStream};
    pub use crate::{Sample, SampleFormat, StreamParams};
}
