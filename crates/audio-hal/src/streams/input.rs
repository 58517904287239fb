//! Capture stream
//!
//! Reads raw PCM at whatever rate the hardware is programmed to,
//! upconverts to the client's requested rate, feeds the EC/NS uplink
//! path and keeps frame-loss accounting so the framework can report
//! dropped capture audio.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::INPUT_BUFFER_SIZE;
use crate::device::{DeviceMask, InputSource};
use crate::engine::EngineInner;
use crate::error::{Error, Result};
use crate::hw::{AudioHardware, PcmPort};
use crate::params::{keys, Parameters};
use crate::processing::postproc::PostProcessor;
use crate::processing::Resampler;
use crate::{Sample, StreamParams, BYTES_PER_SAMPLE};

/// Capture lifecycle state. Anything past `Closed` counts as active for
/// routing purposes; at most one input may be active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum InputState {
    /// Standby, no capture resources held
    Closed = 0,
    /// Selected for capture, hardware not yet online
    Opened = 1,
    /// Capture running
    Started = 2,
}

impl InputState {
    fn from_u8(raw: u8) -> InputState {
        match raw {
            2 => InputState::Started,
            1 => InputState::Opened,
            _ => InputState::Closed,
        }
    }
}

struct Pipeline {
    port: Option<Box<dyn PcmPort>>,
    resampler: Option<Resampler>,
}

/// Expected-vs-delivered frame accounting.
///
/// The clock is injected on every query so the arithmetic is testable
/// without waiting out real time.
pub struct FrameLossCounter {
    rate: u32,
    buffer_frames: u64,
    window: Mutex<LossWindow>,
}

struct LossWindow {
    start: Instant,
    delivered: u64,
}

impl FrameLossCounter {
    /// Start a window at `now`
    pub fn new(rate: u32, buffer_frames: u64, now: Instant) -> FrameLossCounter {
        FrameLossCounter {
            rate,
            buffer_frames: buffer_frames.max(1),
            window: Mutex::new(LossWindow {
                start: now,
                delivered: 0,
            }),
        }
    }

    /// Record `frames` delivered to the client
    pub fn record(&self, frames: u64) {
        self.window.lock().delivered += frames;
    }

    /// Frames lost since the last query, floored to whole buffer units.
    /// Resets the window, so each loss is reported exactly once.
    pub fn query(&self, now: Instant) -> u32 {
        let mut window = self.window.lock();
        let elapsed = now.saturating_duration_since(window.start);
        let expected = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        let lost = expected.saturating_sub(window.delivered);
        window.start = now;
        window.delivered = 0;
        (lost - lost % self.buffer_frames) as u32
    }
}

/// The capture stream
pub struct InputStream {
    params: StreamParams,
    engine: Weak<EngineInner>,
    hardware: Arc<dyn AudioHardware>,
    post: Arc<PostProcessor>,
    state: AtomicU8,
    source: AtomicU8,
    // programmed capture rate, stored by routing
    hw_rate: AtomicU32,
    muted: AtomicBool,
    // routing asks for a flush ahead of a rate change; honored before
    // the next device read
    flush_pending: AtomicBool,
    pipeline: Mutex<Pipeline>,
    loss: FrameLossCounter,
}

impl InputStream {
    pub(crate) fn new(
        params: StreamParams,
        source: InputSource,
        engine: Weak<EngineInner>,
        hardware: Arc<dyn AudioHardware>,
        post: Arc<PostProcessor>,
    ) -> Arc<InputStream> {
        let buffer_frames = (INPUT_BUFFER_SIZE / params.frame_size()) as u64;
        Arc::new(InputStream {
            hw_rate: AtomicU32::new(params.rate),
            loss: FrameLossCounter::new(params.rate, buffer_frames, Instant::now()),
            params,
            engine,
            hardware,
            post,
            state: AtomicU8::new(InputState::Closed as u8),
            source: AtomicU8::new(source as u8),
            muted: AtomicBool::new(false),
            flush_pending: AtomicBool::new(false),
            pipeline: Mutex::new(Pipeline {
                port: None,
                resampler: None,
            }),
        })
    }

    /// Accepted stream configuration
    pub fn params(&self) -> StreamParams {
        self.params
    }

    /// Negotiated client rate in Hz
    pub fn rate(&self) -> u32 {
        self.params.rate
    }

    /// Device buffer size in bytes
    pub fn buffer_size(&self) -> usize {
        INPUT_BUFFER_SIZE
    }

    /// Current lifecycle state
    pub fn state(&self) -> InputState {
        InputState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: InputState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True when this input takes part in routing decisions
    pub fn is_active(&self) -> bool {
        self.state() > InputState::Closed
    }

    /// Capture source the client declared
    pub fn source(&self) -> InputSource {
        InputSource::from_raw(self.source.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Routing-side store of the programmed capture rate
    pub(crate) fn set_hw_rate(&self, rate: u32) {
        self.hw_rate.store(rate, Ordering::Release);
    }

    /// Routing-side request to flush before the next read
    pub(crate) fn request_flush(&self) {
        self.flush_pending.store(true, Ordering::Release);
    }

    /// Routing-side mute store; applied after all processing so muted
    /// reads still pace the clock for loss accounting
    pub(crate) fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// Read one capture buffer at the client's rate.
    ///
    /// The first read after standby brings the path online and triggers
    /// a routing recomputation. Returns the bytes delivered.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let want = buf.len() - buf.len() % self.params.frame_size();
        if want == 0 {
            return Ok(0);
        }

        if self.state() == InputState::Closed {
            self.set_state(InputState::Opened);
        }
        if self.state() == InputState::Opened {
            if let Some(engine) = self.engine.upgrade() {
                engine.update_routing();
            }
            self.set_state(InputState::Started);
        }

        let mut pipeline = self.pipeline.lock();
        if pipeline.port.is_none() {
            match self.hardware.open_input() {
                Ok(port) => pipeline.port = Some(port),
                Err(e) => {
                    self.set_state(InputState::Closed);
                    return Err(e);
                }
            }
        }
        if self.flush_pending.swap(false, Ordering::AcqRel) {
            if let Some(port) = pipeline.port.as_mut() {
                if let Err(e) = port.flush() {
                    warn!("capture flush failed: {}", e);
                }
            }
            pipeline.resampler = None;
        }

        let hw_rate = self.hw_rate.load(Ordering::Acquire);
        let samples_wanted = want / BYTES_PER_SAMPLE;

        let mut out: Vec<Sample> = if hw_rate == self.params.rate {
            let mut raw = vec![0u8; want];
            let n = match self.device_read(&mut pipeline, &mut raw) {
                Ok(n) => n,
                Err(e) => return self.fail_read(&mut pipeline, e),
            };
            bytemuck::pod_collect_to_vec(&raw[..n - n % BYTES_PER_SAMPLE])
        } else {
            // read a rate-scaled slice at the hardware rate, then
            // convert up/down to the client rate
            let hw_samples = (samples_wanted as u64 * hw_rate as u64 / self.params.rate as u64)
                .max(2) as usize
                & !1;
            let mut raw = vec![0u8; hw_samples * BYTES_PER_SAMPLE];
            let n = match self.device_read(&mut pipeline, &mut raw) {
                Ok(n) => n,
                Err(e) => return self.fail_read(&mut pipeline, e),
            };
            let hw_buf: Vec<Sample> =
                bytemuck::pod_collect_to_vec(&raw[..n - n % BYTES_PER_SAMPLE]);

            let stale = !matches!(
                &pipeline.resampler,
                Some(r) if r.source_rate() == hw_rate && r.target_rate() == self.params.rate
            );
            if stale {
                pipeline.resampler = Some(Resampler::new(hw_rate, self.params.rate));
            }
            match pipeline.resampler.as_mut() {
                Some(r) => r.process(&hw_buf),
                None => hw_buf,
            }
        };
        drop(pipeline);

        out.truncate(samples_wanted);
        self.post.apply_uplink(&mut out);

        // mute last, the device read above still paces the clock
        if self.muted.load(Ordering::Acquire) {
            out.iter_mut().for_each(|s| *s = 0);
        }

        let bytes: &[u8] = bytemuck::cast_slice(&out);
        buf[..bytes.len()].copy_from_slice(bytes);
        self.loss.record(out.len() as u64 / self.params.channels.max(1) as u64);
        Ok(bytes.len())
    }

    /// Frames lost since the last query, in buffer-size units
    pub fn frames_lost(&self) -> u32 {
        self.frames_lost_at(Instant::now())
    }

    /// Loss query against an explicit clock
    pub fn frames_lost_at(&self, now: Instant) -> u32 {
        self.loss.query(now)
    }

    /// Enter standby, releasing the capture descriptor. Idempotent; the
    /// next read re-routes and reopens.
    pub fn standby(&self) {
        let was_active = self.is_active();
        {
            let mut pipeline = self.pipeline.lock();
            self.standby_locked(&mut pipeline);
        }
        if was_active {
            if let Some(engine) = self.engine.upgrade() {
                engine.update_routing();
            }
        }
    }

    fn standby_locked(&self, pipeline: &mut Pipeline) {
        if let Some(port) = pipeline.port.as_mut() {
            if let Err(e) = port.flush() {
                debug!("capture flush on standby failed: {}", e);
            }
        }
        pipeline.port = None;
        pipeline.resampler = None;
        self.set_state(InputState::Closed);
    }

    /// Apply `key=value` parameters: `routing=<mask>` moves the device
    /// selection, `input_source=<enum>` declares the capture source.
    pub fn set_parameters(&self, kvpairs: &str) -> Result<()> {
        let mut params = Parameters::parse(kvpairs);
        let mut routed = false;

        if let Some(raw) = params.remove(keys::INPUT_SOURCE) {
            let source = raw
                .parse::<u8>()
                .ok()
                .and_then(InputSource::from_raw)
                .ok_or_else(|| Error::BadValue(format!("input_source={}", raw)))?;
            self.source.store(source as u8, Ordering::Release);
            routed = true;
        }
        if let Some(raw) = params.get_int(keys::ROUTING) {
            params.remove(keys::ROUTING);
            let engine = self.engine.upgrade().ok_or(Error::NotInitialized)?;
            engine.set_input_devices(DeviceMask(raw))?;
            routed = false; // routing already recomputed
        }
        if routed {
            if let Some(engine) = self.engine.upgrade() {
                engine.update_routing();
            }
        }

        if params.is_empty() {
            Ok(())
        } else {
            Err(Error::BadValue(format!(
                "unrecognized input parameters: {}",
                params.to_string()
            )))
        }
    }

    /// Echo the requested parameter keys with their current values
    pub fn get_parameters(&self, request: &str) -> String {
        let mut reply = Parameters::default();
        for key in request.split(';').filter(|k| !k.is_empty()) {
            match key {
                keys::ROUTING => {
                    if let Some(engine) = self.engine.upgrade() {
                        reply.set(keys::ROUTING, engine.input_devices().0);
                    }
                }
                keys::INPUT_SOURCE => reply.set(keys::INPUT_SOURCE, self.source() as u8),
                _ => {}
            }
        }
        reply.to_string()
    }

    fn device_read(&self, pipeline: &mut Pipeline, buf: &mut [u8]) -> Result<usize> {
        let Some(port) = pipeline.port.as_mut() else {
            return Err(Error::InvalidOperation("capture port not open".into()));
        };
        let n = port.read(buf)?;
        match port.error_count() {
            Ok(0) => {}
            Ok(count) => warn!("capture driver reported {} errors", count),
            Err(e) => debug!("capture error-count query failed: {}", e),
        }
        Ok(n)
    }

    fn fail_read(&self, pipeline: &mut Pipeline, err: Error) -> Result<usize> {
        warn!("capture read failed ({}), standby", err);
        self.standby_locked(pipeline);
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockHardware;
    use crate::processing::postproc::PassthroughFactory;
    use crate::HalConfig;
    use std::time::Duration;

    fn stream(hardware: Arc<MockHardware>, rate: u32) -> Arc<InputStream> {
        let post = Arc::new(PostProcessor::new(
            HalConfig::default(),
            Box::new(PassthroughFactory),
        ));
        let params = StreamParams {
            rate,
            ..StreamParams::default_input()
        };
        InputStream::new(params, InputSource::Mic, Weak::new(), hardware, post)
    }

    #[test]
    fn read_at_hardware_rate_is_passthrough() {
        let hardware = Arc::new(MockHardware::new());
        let input = stream(hardware.clone(), 8000);
        let mut buf = [0u8; 64];
        assert_eq!(input.read(&mut buf).unwrap(), 64);
        // the scripted pattern arrives unmodified
        assert_eq!(&buf[..4], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(input.state(), InputState::Started);
        assert_eq!(hardware.input_script().lock().reads, vec![64]);
    }

    #[test]
    fn hardware_rate_mismatch_reads_scaled_and_converts() {
        let hardware = Arc::new(MockHardware::new());
        let input = stream(hardware.clone(), 16000);
        input.set_hw_rate(8000);

        let mut buf = [0u8; 320];
        let n = input.read(&mut buf).unwrap();
        assert!(n <= 320);
        // 160 samples wanted at 16 kHz means 80 raw samples at 8 kHz
        assert_eq!(hardware.input_script().lock().reads, vec![160]);
    }

    #[test]
    fn mute_zeroes_after_the_device_read() {
        let hardware = Arc::new(MockHardware::new());
        let input = stream(hardware.clone(), 8000);
        input.set_muted(true);

        let mut buf = [0xffu8; 32];
        let n = input.read(&mut buf).unwrap();
        assert_eq!(n, 32);
        assert!(buf.iter().all(|&b| b == 0));
        // the device was still read, pacing is preserved
        assert_eq!(hardware.input_script().lock().reads, vec![32]);
    }

    #[test]
    fn frame_loss_counts_expected_minus_delivered() {
        let now = Instant::now();
        let counter = FrameLossCounter::new(8000, 2048, now);
        // two seconds elapsed, nothing delivered: 16000 frames expected,
        // floored to 2048-frame buffer units
        let lost = counter.query(now + Duration::from_secs(2));
        assert_eq!(lost, 16000 - 16000 % 2048);
        // window reset: an immediate requery reports nothing
        assert_eq!(counter.query(now + Duration::from_secs(2)), 0);
    }

    #[test]
    fn frame_loss_subtracts_delivered_frames() {
        let now = Instant::now();
        let counter = FrameLossCounter::new(8000, 1, now);
        counter.record(4000);
        assert_eq!(counter.query(now + Duration::from_secs(1)), 4000);
    }

    #[test]
    fn standby_is_idempotent_and_reopens_on_read() {
        let hardware = Arc::new(MockHardware::new());
        let input = stream(hardware.clone(), 8000);
        let mut buf = [0u8; 32];
        input.read(&mut buf).unwrap();

        input.standby();
        assert_eq!(input.state(), InputState::Closed);
        input.standby();
        assert_eq!(input.state(), InputState::Closed);
        assert_eq!(hardware.input_script().lock().flushes, 1);

        input.read(&mut buf).unwrap();
        assert_eq!(input.state(), InputState::Started);
    }

    #[test]
    fn read_error_closes_the_stream() {
        let hardware = Arc::new(MockHardware::new());
        hardware.input_script().lock().fail_reads = true;
        let input = stream(hardware, 8000);
        let mut buf = [0u8; 32];
        assert!(input.read(&mut buf).is_err());
        assert_eq!(input.state(), InputState::Closed);
    }
}
