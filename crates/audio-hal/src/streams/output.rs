//! Playback stream
//!
//! One instance system-wide. Every `write` fans the PCM buffer out to
//! the active sinks: the codec DAC and S/PDIF paths take the native
//! 44.1 kHz stereo stream unmodified, while one further destination
//! (Bluetooth preferred) receives the processed pipeline: downmix, rate
//! conversion and, in a call, the EC/NS downlink handoff.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::{BLUETOOTH_SCO_RATE, OUTPUT_BUFFER_SIZE};
use crate::device::DeviceMask;
use crate::engine::EngineInner;
use crate::error::{Error, Result};
use crate::hw::{AudioHardware, SharedSinks, SinkId};
use crate::params::{keys, Parameters};
use crate::processing::postproc::PostProcessor;
use crate::processing::{channels, Resampler};
use crate::streams::StreamState;
use crate::{Sample, StreamParams};

struct Pipeline {
    resampler: Option<Resampler>,
}

/// The playback stream
pub struct OutputStream {
    params: StreamParams,
    engine: Weak<EngineInner>,
    hardware: Arc<dyn AudioHardware>,
    sinks: SharedSinks,
    post: Arc<PostProcessor>,
    state: AtomicU8,
    // requested sink set, stored by routing and applied on the next write
    speaker_req: AtomicBool,
    bluetooth_req: AtomicBool,
    spdif_req: AtomicBool,
    // hardware rate currently programmed for the playback direction
    hw_rate: AtomicU32,
    frames_rendered: AtomicU64,
    pipeline: Mutex<Pipeline>,
}

impl OutputStream {
    pub(crate) fn new(
        params: StreamParams,
        engine: Weak<EngineInner>,
        hardware: Arc<dyn AudioHardware>,
        sinks: SharedSinks,
        post: Arc<PostProcessor>,
    ) -> Arc<OutputStream> {
        Arc::new(OutputStream {
            hw_rate: AtomicU32::new(params.rate),
            params,
            engine,
            hardware,
            sinks,
            post,
            state: AtomicU8::new(StreamState::Idle as u8),
            speaker_req: AtomicBool::new(false),
            bluetooth_req: AtomicBool::new(false),
            spdif_req: AtomicBool::new(false),
            frames_rendered: AtomicU64::new(0),
            pipeline: Mutex::new(Pipeline { resampler: None }),
        })
    }

    /// Accepted stream configuration
    pub fn params(&self) -> StreamParams {
        self.params
    }

    /// Device buffer size in bytes
    pub fn buffer_size(&self) -> usize {
        OUTPUT_BUFFER_SIZE
    }

    /// Worst-case playback latency in milliseconds, one device buffer
    pub fn latency_ms(&self) -> u32 {
        (OUTPUT_BUFFER_SIZE / self.params.frame_size()) as u32 * 1000 / self.params.rate
    }

    /// Frames accepted from the client since the stream was created
    pub fn render_position(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    /// Current lifecycle state
    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True while in standby; routing treats a standby output as absent
    /// for EC/NS eligibility.
    pub fn is_standby(&self) -> bool {
        self.state() == StreamState::Idle
    }

    /// Routing-side store of the requested sink set. A change while
    /// configured parks the stream back in `ConfigRequested` so the next
    /// write re-applies the new fan-out before emitting data.
    pub(crate) fn set_driver(&self, speaker: bool, bluetooth: bool, spdif: bool) {
        // every flag must be stored even when an earlier one changed
        let speaker_changed = self.speaker_req.swap(speaker, Ordering::AcqRel) != speaker;
        let bluetooth_changed = self.bluetooth_req.swap(bluetooth, Ordering::AcqRel) != bluetooth;
        let spdif_changed = self.spdif_req.swap(spdif, Ordering::AcqRel) != spdif;
        let changed = speaker_changed || bluetooth_changed || spdif_changed;
        if changed && self.state() == StreamState::Configured {
            debug!("output sink set changed, reconfiguring on next write");
            self.set_state(StreamState::ConfigRequested);
        }
    }

    /// Routing-side store of the programmed playback rate
    pub(crate) fn set_hw_rate(&self, rate: u32) {
        self.hw_rate.store(rate, Ordering::Release);
    }

    /// Write one PCM buffer, fanning it out to every requested sink.
    ///
    /// Returns the number of bytes accepted. On a hard device error the
    /// stream enters standby and, to preserve pacing for callers that
    /// ignore errors, sleeps for the buffer's playback duration before
    /// returning the error.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let len = data.len() - data.len() % self.params.frame_size();
        let data = &data[..len];
        if data.is_empty() {
            return Ok(0);
        }

        if self.state() == StreamState::Idle {
            // coming online changes EC/NS eligibility, recompute first
            self.set_state(StreamState::ConfigRequested);
            if let Some(engine) = self.engine.upgrade() {
                engine.update_routing();
            }
        }

        let mut pipeline = self.pipeline.lock();
        if self.state() == StreamState::ConfigRequested {
            self.open_requested_sinks();
            pipeline.resampler = None;
            self.set_state(StreamState::Configured);
        }

        let mut samples: Vec<Sample> = bytemuck::pod_collect_to_vec(data);
        self.post.process_media(&mut samples);

        let speaker = self.speaker_req.load(Ordering::Acquire);
        let bluetooth = self.bluetooth_req.load(Ordering::Acquire);
        let spdif = self.spdif_req.load(Ordering::Acquire);
        let ecns = self.post.is_enabled();

        // at most one destination gets the processed pipeline; the
        // others take the native-rate buffer as-is
        let processed = if bluetooth {
            Some(SinkId::Bluetooth)
        } else if ecns && speaker {
            Some(SinkId::Codec)
        } else if spdif && !speaker {
            Some(SinkId::Spdif)
        } else {
            None
        };

        let original: &[u8] = bytemuck::cast_slice(&samples);
        if speaker && processed != Some(SinkId::Codec) {
            if let Err(e) = self.write_sink(SinkId::Codec, original) {
                return self.fail_write(len, e);
            }
        }
        if spdif && processed != Some(SinkId::Spdif) {
            if let Err(e) = self.write_sink(SinkId::Spdif, original) {
                warn!("spdif write failed: {}", e);
            }
        }

        if let Some(dest) = processed {
            let dest_rate = match dest {
                SinkId::Bluetooth => BLUETOOTH_SCO_RATE,
                _ => self.hw_rate.load(Ordering::Acquire),
            };
            let convert = dest_rate != self.params.rate;

            // the canceller and the converter are mono
            let mut work = if ecns || convert {
                channels::stereo_to_mono(&samples)
            } else {
                samples.clone()
            };
            if convert {
                let stale = !matches!(
                    &pipeline.resampler,
                    Some(r) if r.source_rate() == self.params.rate && r.target_rate() == dest_rate
                );
                if stale {
                    pipeline.resampler = Some(Resampler::new(self.params.rate, dest_rate));
                }
                if let Some(resampler) = pipeline.resampler.as_mut() {
                    work = resampler.process(&work);
                }
            }

            let mut consumed = 0;
            if ecns {
                consumed =
                    self.post
                        .write_downlink(work.clone(), Arc::clone(&self.sinks), dest);
            }
            if consumed == 0 && !work.is_empty() {
                // no EC/NS session yet (or not enabled), write directly
                let direct = if dest == SinkId::Codec {
                    channels::mono_to_stereo(&work)
                } else {
                    work
                };
                let bytes: &[u8] = bytemuck::cast_slice(&direct);
                if let Err(e) = self.write_sink(dest, bytes) {
                    return self.fail_write(len, e);
                }
            }
        }

        self.frames_rendered
            .fetch_add((len / self.params.frame_size()) as u64, Ordering::AcqRel);
        Ok(len)
    }

    /// Flush all three sink paths.
    ///
    /// Called ahead of a sink disable or a hardware rate change so
    /// stale-rate audio never reaches new-rate hardware.
    pub fn flush(&self) {
        let mut ports = self.sinks.lock();
        if let Err(e) = ports.flush_all() {
            warn!("sink flush failed: {}", e);
        }
    }

    /// Enter standby. Idempotent: releases any EC/NS producer blocked on
    /// this stream, flushes and parks in `Idle`.
    pub fn standby(&self) {
        self.post.poison_downlink();
        self.flush();
        self.set_state(StreamState::Idle);
    }

    /// Apply `key=value` parameters; `routing=<mask>` moves the stream's
    /// device selection. Unknown keys report a bad value after the
    /// recognized ones have been applied.
    pub fn set_parameters(&self, kvpairs: &str) -> Result<()> {
        let mut params = Parameters::parse(kvpairs);
        if let Some(raw) = params.get_int(keys::ROUTING) {
            params.remove(keys::ROUTING);
            let engine = self.engine.upgrade().ok_or(Error::NotInitialized)?;
            engine.set_output_devices(DeviceMask(raw))?;
        }
        if params.is_empty() {
            Ok(())
        } else {
            Err(Error::BadValue(format!(
                "unrecognized output parameters: {}",
                params.to_string()
            )))
        }
    }

    /// Echo the requested parameter keys with their current values
    pub fn get_parameters(&self, request: &str) -> String {
        let mut reply = Parameters::default();
        for key in request.split(';').filter(|k| !k.is_empty()) {
            if key == keys::ROUTING {
                if let Some(engine) = self.engine.upgrade() {
                    reply.set(keys::ROUTING, engine.output_devices().0);
                }
            }
        }
        reply.to_string()
    }

    fn open_requested_sinks(&self) {
        let requested = [
            (self.speaker_req.load(Ordering::Acquire), SinkId::Codec),
            (self.bluetooth_req.load(Ordering::Acquire), SinkId::Bluetooth),
            (self.spdif_req.load(Ordering::Acquire), SinkId::Spdif),
        ];
        let mut ports = self.sinks.lock();
        for (wanted, sink) in requested {
            if wanted {
                if ports.port_mut(sink).is_none() {
                    match self.hardware.open_output(sink) {
                        Ok(port) => *ports.port_mut(sink) = Some(port),
                        // path stays disabled for this session
                        Err(e) => warn!("{:?} playback path unavailable: {}", sink, e),
                    }
                }
            } else if let Some(mut port) = ports.port_mut(sink).take() {
                // stale audio must not sit in a path that just left the route
                if let Err(e) = port.flush() {
                    warn!("{:?} flush on disable failed: {}", sink, e);
                }
            }
        }
    }

    fn write_sink(&self, sink: SinkId, data: &[u8]) -> Result<()> {
        let mut ports = self.sinks.lock();
        let Some(port) = ports.port_mut(sink) else {
            return Ok(());
        };
        port.write(data)?;
        match port.error_count() {
            Ok(0) => {}
            Ok(n) => warn!("{:?} driver reported {} errors", sink, n),
            Err(e) => debug!("error-count query on {:?} failed: {}", sink, e),
        }
        Ok(())
    }

    fn fail_write(&self, bytes: usize, err: Error) -> Result<usize> {
        let bytes_per_sec = self.params.rate as usize * self.params.frame_size();
        let pacing = Duration::from_secs_f64(bytes as f64 / bytes_per_sec as f64);
        error!("playback write failed ({}), standby", err);
        self.standby();
        thread::sleep(pacing);
        Err(err)
    }
}
