//! Scriptable mock hardware
//!
//! Used by the test suite and by host builds without the device nodes.
//! Every endpoint records the calls made against it and exposes the
//! recordings through shared handles that stay valid after the engine
//! has consumed the ports.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{AudioHardware, ControlPort, PcmPort, SinkId};
use crate::device::{InputPath, OutputPath};
use crate::error::{Error, Result};

/// Recorded control-plane state
#[derive(Debug, Default, Clone)]
pub struct ControlLog {
    /// Last output path selection
    pub output_path: Option<(OutputPath, bool)>,
    /// Last input path selection
    pub input_path: Option<(InputPath, bool)>,
    /// Every output rate programmed, in order
    pub output_rates: Vec<u32>,
    /// Every input rate programmed, in order
    pub input_rates: Vec<u32>,
    /// Last playback volume step
    pub output_volume: Option<u16>,
    /// Last capture gain step
    pub input_gain: Option<u16>,
    /// When set, every control call fails with an I/O error
    pub fail: bool,
}

/// Recorded data-plane state for one playback sink
#[derive(Debug, Default)]
pub struct SinkLog {
    /// All bytes written, concatenated
    pub data: Vec<u8>,
    /// Size of each individual write
    pub writes: Vec<usize>,
    /// Flush count
    pub flushes: u32,
    /// When set, writes fail with an I/O error
    pub fail_writes: bool,
    /// Value the next error-count query returns
    pub error_count: u32,
}

/// Scripted capture source
#[derive(Debug)]
pub struct InputScript {
    /// Pattern cycled into every read
    pub pattern: Vec<u8>,
    /// Size of each individual read
    pub reads: Vec<usize>,
    /// Flush count
    pub flushes: u32,
    /// When set, reads fail with an I/O error
    pub fail_reads: bool,
}

impl Default for InputScript {
    fn default() -> Self {
        Self {
            pattern: vec![0x11, 0x22, 0x33, 0x44],
            reads: Vec::new(),
            flushes: 0,
            fail_reads: false,
        }
    }
}

/// Mock implementation of [`AudioHardware`]
pub struct MockHardware {
    control: Arc<Mutex<ControlLog>>,
    codec: Arc<Mutex<SinkLog>>,
    bluetooth: Arc<Mutex<SinkLog>>,
    spdif: Arc<Mutex<SinkLog>>,
    input: Arc<Mutex<InputScript>>,
    missing_sinks: Mutex<HashSet<SinkId>>,
    control_unavailable: Mutex<bool>,
}

impl MockHardware {
    /// A mock with every endpoint available
    pub fn new() -> Self {
        Self {
            control: Arc::new(Mutex::new(ControlLog::default())),
            codec: Arc::new(Mutex::new(SinkLog::default())),
            bluetooth: Arc::new(Mutex::new(SinkLog::default())),
            spdif: Arc::new(Mutex::new(SinkLog::default())),
            input: Arc::new(Mutex::new(InputScript::default())),
            missing_sinks: Mutex::new(HashSet::new()),
            control_unavailable: Mutex::new(false),
        }
    }

    /// Make the control descriptor unopenable (the fatal-only case)
    pub fn without_control(self) -> Self {
        *self.control_unavailable.lock() = true;
        self
    }

    /// Make a sink's device node unopenable
    pub fn without_sink(self, sink: SinkId) -> Self {
        self.missing_sinks.lock().insert(sink);
        self
    }

    /// Handle on the control recording
    pub fn control_log(&self) -> Arc<Mutex<ControlLog>> {
        Arc::clone(&self.control)
    }

    /// Handle on a sink recording
    pub fn sink_log(&self, sink: SinkId) -> Arc<Mutex<SinkLog>> {
        match sink {
            SinkId::Codec => Arc::clone(&self.codec),
            SinkId::Bluetooth => Arc::clone(&self.bluetooth),
            SinkId::Spdif => Arc::clone(&self.spdif),
        }
    }

    /// Handle on the capture script
    pub fn input_script(&self) -> Arc<Mutex<InputScript>> {
        Arc::clone(&self.input)
    }
}

impl Default for MockHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHardware for MockHardware {
    fn open_control(&self) -> Result<Box<dyn ControlPort>> {
        if *self.control_unavailable.lock() {
            return Err(Error::IoError(io::Error::from(io::ErrorKind::NotFound)));
        }
        Ok(Box::new(MockControlPort {
            log: Arc::clone(&self.control),
        }))
    }

    fn open_output(&self, sink: SinkId) -> Result<Box<dyn PcmPort>> {
        if self.missing_sinks.lock().contains(&sink) {
            return Err(Error::IoError(io::Error::from(io::ErrorKind::NotFound)));
        }
        Ok(Box::new(MockSinkPort {
            log: self.sink_log(sink),
        }))
    }

    fn open_input(&self) -> Result<Box<dyn PcmPort>> {
        Ok(Box::new(MockInputPort {
            script: Arc::clone(&self.input),
            cursor: 0,
        }))
    }
}

struct MockControlPort {
    log: Arc<Mutex<ControlLog>>,
}

impl MockControlPort {
    fn check(&self) -> Result<()> {
        if self.log.lock().fail {
            Err(Error::IoError(io::Error::from(io::ErrorKind::Other)))
        } else {
            Ok(())
        }
    }
}

impl ControlPort for MockControlPort {
    fn set_output_path(&mut self, path: OutputPath, enabled: bool) -> Result<()> {
        self.check()?;
        self.log.lock().output_path = Some((path, enabled));
        Ok(())
    }

    fn set_input_path(&mut self, path: InputPath, enabled: bool) -> Result<()> {
        self.check()?;
        self.log.lock().input_path = Some((path, enabled));
        Ok(())
    }

    fn set_output_rate(&mut self, rate: u32) -> Result<()> {
        self.check()?;
        self.log.lock().output_rates.push(rate);
        Ok(())
    }

    fn set_input_rate(&mut self, rate: u32) -> Result<()> {
        self.check()?;
        self.log.lock().input_rates.push(rate);
        Ok(())
    }

    fn set_output_volume(&mut self, step: u16) -> Result<()> {
        self.check()?;
        self.log.lock().output_volume = Some(step);
        Ok(())
    }

    fn set_input_gain(&mut self, step: u16) -> Result<()> {
        self.check()?;
        self.log.lock().input_gain = Some(step);
        Ok(())
    }
}

struct MockSinkPort {
    log: Arc<Mutex<SinkLog>>,
}

impl PcmPort for MockSinkPort {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut log = self.log.lock();
        if log.fail_writes {
            return Err(Error::IoError(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        log.data.extend_from_slice(data);
        log.writes.push(data.len());
        Ok(data.len())
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported("read on a playback sink".into()))
    }

    fn flush(&mut self) -> Result<()> {
        self.log.lock().flushes += 1;
        Ok(())
    }

    fn error_count(&mut self) -> Result<u32> {
        let mut log = self.log.lock();
        let count = log.error_count;
        log.error_count = 0;
        Ok(count)
    }
}

struct MockInputPort {
    script: Arc<Mutex<InputScript>>,
    cursor: usize,
}

impl PcmPort for MockInputPort {
    fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Err(Error::Unsupported("write on a capture port".into()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut script = self.script.lock();
        if script.fail_reads {
            return Err(Error::IoError(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        let pattern = script.pattern.clone();
        for b in buf.iter_mut() {
            *b = pattern[self.cursor % pattern.len()];
            self.cursor += 1;
        }
        script.reads.push(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.script.lock().flushes += 1;
        Ok(())
    }

    fn error_count(&mut self) -> Result<u32> {
        Ok(0)
    }
}
