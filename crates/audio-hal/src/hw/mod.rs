//! Physical hardware access
//!
//! The HAL's only contract with the kernel is a control-plane
//! descriptor (device/rate/volume selection) and per-path PCM data
//! descriptors with a parallel control channel for flush and error
//! counters. Both are expressed as traits so routing and the streams
//! never touch a file descriptor directly; [`devfs`] binds them to the
//! real device nodes on linux and [`mock`] scripts them for tests.
//!
//! Any port may be absent (open failure): the corresponding feature is
//! disabled rather than crashing, except for the control port whose
//! absence leaves the whole HAL uninitialized.

pub mod mock;

#[cfg(target_os = "linux")]
pub mod devfs;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{InputPath, OutputPath};
use crate::error::Result;

/// Identifies one of the three physical playback sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkId {
    /// Primary codec DAC path (speaker/headset/earpiece/dock)
    Codec,
    /// Bluetooth SCO link
    Bluetooth,
    /// S/PDIF digital output
    Spdif,
}

/// Control-plane endpoint for the codec: path enables, rates, volumes.
pub trait ControlPort: Send {
    /// Select and enable/disable the physical output path
    fn set_output_path(&mut self, path: OutputPath, enabled: bool) -> Result<()>;
    /// Select and enable/disable the physical input path
    fn set_input_path(&mut self, path: InputPath, enabled: bool) -> Result<()>;
    /// Program the playback-direction hardware rate
    fn set_output_rate(&mut self, rate: u32) -> Result<()>;
    /// Program the capture-direction hardware rate
    fn set_input_rate(&mut self, rate: u32) -> Result<()>;
    /// Playback volume register, 0..=15
    fn set_output_volume(&mut self, step: u16) -> Result<()>;
    /// Capture gain register, 0..=15
    fn set_input_gain(&mut self, step: u16) -> Result<()>;
}

/// Data-plane endpoint for one PCM path, together with its parallel
/// control channel (flush, error counter).
pub trait PcmPort: Send {
    /// Blocking PCM write; returns bytes accepted
    fn write(&mut self, data: &[u8]) -> Result<usize>;
    /// Blocking PCM read; returns bytes delivered
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Drop any buffered audio on this path
    fn flush(&mut self) -> Result<()>;
    /// Driver error counter since the last query
    fn error_count(&mut self) -> Result<u32>;
}

/// Factory for the process-wide hardware endpoints.
///
/// Ports are opened lazily when a stream comes online; an `Err` from an
/// `open_*` call disables the corresponding path for that session.
pub trait AudioHardware: Send + Sync {
    /// Open the codec control descriptor
    fn open_control(&self) -> Result<Box<dyn ControlPort>>;
    /// Open a playback data path
    fn open_output(&self, sink: SinkId) -> Result<Box<dyn PcmPort>>;
    /// Open the capture data path
    fn open_input(&self) -> Result<Box<dyn PcmPort>>;
}

/// The playback sink descriptors, shared between the output stream's
/// write path and the EC/NS engine's device write.
///
/// The surrounding mutex is the fd-group lock: flushes and writes to
/// these descriptors are serialized through it so a flush can never
/// tear a concurrent write.
#[derive(Default)]
pub struct SinkPorts {
    /// Primary codec path
    pub codec: Option<Box<dyn PcmPort>>,
    /// Bluetooth SCO path
    pub bluetooth: Option<Box<dyn PcmPort>>,
    /// S/PDIF path
    pub spdif: Option<Box<dyn PcmPort>>,
}

impl SinkPorts {
    /// The slot for `sink`
    pub fn port_mut(&mut self, sink: SinkId) -> &mut Option<Box<dyn PcmPort>> {
        match sink {
            SinkId::Codec => &mut self.codec,
            SinkId::Bluetooth => &mut self.bluetooth,
            SinkId::Spdif => &mut self.spdif,
        }
    }

    /// Flush every open sink; failures are logged by the caller
    pub fn flush_all(&mut self) -> Result<()> {
        for sink in [SinkId::Codec, SinkId::Bluetooth, SinkId::Spdif] {
            if let Some(port) = self.port_mut(sink) {
                port.flush()?;
            }
        }
        Ok(())
    }

    /// Drop every open sink descriptor
    pub fn close_all(&mut self) {
        self.codec = None;
        self.bluetooth = None;
        self.spdif = None;
    }
}

/// Shared handle to the sink descriptors under the fd-group lock
pub type SharedSinks = Arc<Mutex<SinkPorts>>;
