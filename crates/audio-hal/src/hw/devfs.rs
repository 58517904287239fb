//! Devfs backend (linux)
//!
//! Binds the [`ControlPort`]/[`PcmPort`] contracts to the real device
//! nodes: one control-plane descriptor for path/rate/volume selection
//! and a data + control node pair per PCM path. Register-level codec
//! programming lives in the kernel driver; this module only speaks the
//! ioctl ABI.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{AudioHardware, ControlPort, PcmPort, SinkId};
use crate::device::{InputPath, OutputPath};
use crate::error::Result;

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

#[repr(C)]
struct AudioPathArg {
    id: libc::c_int,
    on: libc::c_int,
}

// Control-plane requests (codec magic 'c')
const AUDIO_OUT_SET_OUTPUT: libc::c_ulong = ioc(IOC_WRITE, b'c', 0, std::mem::size_of::<AudioPathArg>());
const AUDIO_IN_SET_INPUT: libc::c_ulong = ioc(IOC_WRITE, b'c', 1, std::mem::size_of::<AudioPathArg>());
const AUDIO_OUT_SET_RATE: libc::c_ulong = ioc(IOC_WRITE, b'c', 2, std::mem::size_of::<libc::c_uint>());
const AUDIO_IN_SET_RATE: libc::c_ulong = ioc(IOC_WRITE, b'c', 3, std::mem::size_of::<libc::c_uint>());
const AUDIO_OUT_SET_VOLUME: libc::c_ulong = ioc(IOC_WRITE, b'c', 4, std::mem::size_of::<libc::c_uint>());
const AUDIO_IN_SET_VOLUME: libc::c_ulong = ioc(IOC_WRITE, b'c', 5, std::mem::size_of::<libc::c_uint>());

// Per-path control requests (SoC magic 't')
const AUDIO_PATH_FLUSH: libc::c_ulong = ioc(0, b't', 0, 0);
const AUDIO_PATH_GET_ERROR_COUNT: libc::c_ulong = ioc(IOC_READ, b't', 1, std::mem::size_of::<libc::c_uint>());

fn path_id(path: OutputPath) -> libc::c_int {
    match path {
        OutputPath::Speaker => 0,
        OutputPath::Headset => 1,
        OutputPath::HeadsetAndSpeaker => 2,
        OutputPath::AnalogDock => 3,
    }
}

fn mic_id(path: InputPath) -> libc::c_int {
    match path {
        InputPath::Mic1 => 0,
        InputPath::Mic2 => 1,
    }
}

fn ioctl_in<T>(file: &File, request: libc::c_ulong, arg: &T) -> Result<()> {
    // SAFETY: request codes above match the kernel contract for these
    // nodes and `arg` outlives the call.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg as *const T) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn ioctl_out<T>(file: &File, request: libc::c_ulong, arg: &mut T) -> Result<()> {
    // SAFETY: as above, with `arg` writable for the kernel.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg as *mut T) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Control descriptor over `/dev/audio_ctl`
pub struct DevfsControlPort {
    file: File,
}

impl ControlPort for DevfsControlPort {
    fn set_output_path(&mut self, path: OutputPath, enabled: bool) -> Result<()> {
        let arg = AudioPathArg {
            id: path_id(path),
            on: enabled as libc::c_int,
        };
        ioctl_in(&self.file, AUDIO_OUT_SET_OUTPUT, &arg)
    }

    fn set_input_path(&mut self, path: InputPath, enabled: bool) -> Result<()> {
        let arg = AudioPathArg {
            id: mic_id(path),
            on: enabled as libc::c_int,
        };
        ioctl_in(&self.file, AUDIO_IN_SET_INPUT, &arg)
    }

    fn set_output_rate(&mut self, rate: u32) -> Result<()> {
        ioctl_in(&self.file, AUDIO_OUT_SET_RATE, &(rate as libc::c_uint))
    }

    fn set_input_rate(&mut self, rate: u32) -> Result<()> {
        ioctl_in(&self.file, AUDIO_IN_SET_RATE, &(rate as libc::c_uint))
    }

    fn set_output_volume(&mut self, step: u16) -> Result<()> {
        ioctl_in(&self.file, AUDIO_OUT_SET_VOLUME, &(step as libc::c_uint))
    }

    fn set_input_gain(&mut self, step: u16) -> Result<()> {
        ioctl_in(&self.file, AUDIO_IN_SET_VOLUME, &(step as libc::c_uint))
    }
}

/// One PCM path: a data node plus its parallel control node
pub struct DevfsPcmPort {
    data: File,
    ctl: File,
}

impl PcmPort for DevfsPcmPort {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.data.write(data)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.data.read(buf)?)
    }

    fn flush(&mut self) -> Result<()> {
        ioctl_in(&self.ctl, AUDIO_PATH_FLUSH, &0u32)
    }

    fn error_count(&mut self) -> Result<u32> {
        let mut count: libc::c_uint = 0;
        ioctl_out(&self.ctl, AUDIO_PATH_GET_ERROR_COUNT, &mut count)?;
        Ok(count as u32)
    }
}

/// Hardware factory over the devfs node layout
pub struct DevfsHardware {
    dev_dir: PathBuf,
}

impl DevfsHardware {
    /// Standard `/dev` layout
    pub fn new() -> Self {
        Self::with_dev_dir("/dev")
    }

    /// Alternative device directory (chroots, test rigs)
    pub fn with_dev_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dev_dir: dir.into() }
    }

    fn open_node(&self, name: &str) -> Result<File> {
        let path = self.dev_dir.join(name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        debug!("opened {}", path.display());
        Ok(file)
    }

    fn open_pair(&self, data: &str, ctl: &str) -> Result<DevfsPcmPort> {
        Ok(DevfsPcmPort {
            data: self.open_node(data)?,
            ctl: self.open_node(ctl)?,
        })
    }
}

impl Default for DevfsHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHardware for DevfsHardware {
    fn open_control(&self) -> Result<Box<dyn ControlPort>> {
        Ok(Box::new(DevfsControlPort {
            file: self.open_node("audio_ctl")?,
        }))
    }

    fn open_output(&self, sink: SinkId) -> Result<Box<dyn PcmPort>> {
        let port = match sink {
            SinkId::Codec => self.open_pair("audio0_out", "audio0_out_ctl")?,
            SinkId::Bluetooth => self.open_pair("audio1_out", "audio1_out_ctl")?,
            SinkId::Spdif => self.open_pair("audio2_out", "audio2_out_ctl")?,
        };
        Ok(Box::new(port))
    }

    fn open_input(&self) -> Result<Box<dyn PcmPort>> {
        Ok(Box::new(self.open_pair("audio0_in", "audio0_in_ctl")?))
    }
}

/// Convenience: does this host expose the audio nodes at all?
pub fn nodes_present() -> bool {
    Path::new("/dev/audio_ctl").exists()
}
