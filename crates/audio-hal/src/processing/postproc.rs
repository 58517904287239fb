//! Echo cancellation / noise suppression engine
//!
//! Owns the vendor EC/NS algorithm session and the downlink mailbox
//! that time-aligns playback against capture. The algorithm itself is
//! opaque behind [`EcnsAlgorithm`]; this module handles session
//! lifecycle, profile loading, frame pairing and the final device write
//! for the processed downlink.
//!
//! Multimedia post-effects (loudness, EQ) share the entry point: they
//! run on the playback path only while EC/NS is idle, since the two
//! would otherwise fight over the same samples.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;

use bytes::Buf;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::HalConfig;
use crate::error::{Error, Result};
use crate::hw::{SharedSinks, SinkId};
use crate::processing::channels;
use crate::processing::handoff::DownlinkMailbox;
use crate::Sample;

/// Profile resource magic, `b"ECN1"` on the wire
pub const ECNS_PROFILE_MAGIC: u32 = u32::from_le_bytes(*b"ECN1");

/// Profile resource version this build understands
pub const ECNS_PROFILE_VERSION: u16 = 1;

/// 16 kHz parameter blocks sit after the 8 kHz blocks for every mode
pub const MODE_16K_OFFSET: usize = 5;

/// Samples per EC/NS frame (20 ms)
pub fn frame_samples(rate: u32) -> usize {
    (rate / 50) as usize
}

/// Vendor EC/NS algorithm session.
///
/// One instance per (rate, profile) pair; the HAL never looks inside
/// the frames it hands over beyond pairing them up.
pub trait EcnsAlgorithm: Send {
    /// Process one downlink frame in place (speaker reference path)
    fn process_downlink(&mut self, frame: &mut [Sample]) -> Result<()>;
    /// Process one uplink frame in place, using the downlink reference
    /// most recently passed to [`process_downlink`](Self::process_downlink)
    fn process_uplink(&mut self, frame: &mut [Sample]) -> Result<()>;
}

/// Creates algorithm sessions from a parameter profile block.
pub trait EcnsFactory: Send + Sync {
    /// Instantiate a session at `rate` with the given parameter block
    fn create(&self, rate: u32, profile: &[u8]) -> Result<Box<dyn EcnsAlgorithm>>;
}

/// Identity algorithm, used when no vendor library is linked and by the
/// test suite.
pub struct PassthroughEcns;

impl EcnsAlgorithm for PassthroughEcns {
    fn process_downlink(&mut self, _frame: &mut [Sample]) -> Result<()> {
        Ok(())
    }

    fn process_uplink(&mut self, _frame: &mut [Sample]) -> Result<()> {
        Ok(())
    }
}

/// Factory for [`PassthroughEcns`]
pub struct PassthroughFactory;

impl EcnsFactory for PassthroughFactory {
    fn create(&self, _rate: u32, _profile: &[u8]) -> Result<Box<dyn EcnsAlgorithm>> {
        Ok(Box::new(PassthroughEcns))
    }
}

/// Post-effect chain for media playback (accessory-specific loudness or
/// EQ tuning). Runs in place on the stereo native-rate buffer.
pub trait MediaEffect: Send {
    /// Reconfigure for a new accessory/rate pair
    fn configure(&mut self, path_index: usize, rate: u32);
    /// Process a buffer in place
    fn process(&mut self, frame: &mut [Sample]);
}

/// Parsed EC/NS parameter resource: a header plus fixed-size parameter
/// blocks, one per (mode, rate) combination.
pub struct EcnsProfile {
    block_len: usize,
    blocks: Vec<u8>,
}

impl EcnsProfile {
    /// Load and validate the resource at `path`.
    pub fn load(path: &Path) -> Result<EcnsProfile> {
        let raw = fs::read(path)?;
        Self::parse(&raw)
    }

    fn parse(raw: &[u8]) -> Result<EcnsProfile> {
        let mut buf = raw;
        if buf.remaining() < 10 {
            return Err(Error::Format("ecns profile header truncated".into()));
        }
        let magic = buf.get_u32_le();
        if magic != ECNS_PROFILE_MAGIC {
            return Err(Error::Format(format!("bad ecns profile magic {:#x}", magic)));
        }
        let version = buf.get_u16_le();
        if version != ECNS_PROFILE_VERSION {
            return Err(Error::Format(format!(
                "ecns profile version {} (expected {})",
                version, ECNS_PROFILE_VERSION
            )));
        }
        let block_count = buf.get_u16_le() as usize;
        let block_len = buf.get_u16_le() as usize;
        if block_count < MODE_16K_OFFSET * 2 {
            return Err(Error::Format(format!(
                "ecns profile has {} blocks, need {}",
                block_count,
                MODE_16K_OFFSET * 2
            )));
        }
        let body = block_count * block_len;
        if buf.remaining() < body {
            return Err(Error::Format(format!(
                "ecns profile body short: {} of {} bytes",
                buf.remaining(),
                body
            )));
        }
        Ok(EcnsProfile {
            block_len,
            blocks: buf[..body].to_vec(),
        })
    }

    /// The parameter block for a mode index at the given rate.
    pub fn block(&self, mode: usize, rate: u32) -> Result<&[u8]> {
        if mode >= MODE_16K_OFFSET {
            return Err(Error::BadValue(format!("ecns mode {} out of range", mode)));
        }
        let index = match rate {
            8000 => mode,
            16000 => mode + MODE_16K_OFFSET,
            other => {
                return Err(Error::Unsupported(format!(
                    "ecns does not run at {} Hz",
                    other
                )))
            }
        };
        let start = index * self.block_len;
        Ok(&self.blocks[start..start + self.block_len])
    }
}

struct EcnsSession {
    rate: u32,
    mode: usize,
    algo: Box<dyn EcnsAlgorithm>,
    /// Sub-frame downlink fragment spilled by the mailbox, consumed
    /// ahead of the next published buffer
    carryover: Vec<Sample>,
}

/// The EC/NS engine plus the media post-effect chain.
///
/// `enabled` and the requested rate/mode are atomics so routing can
/// update them without taking the session lock; the session itself is
/// created lazily on the uplink path, which is the only place that
/// knows processing is actually happening.
pub struct PostProcessor {
    config: HalConfig,
    factory: Box<dyn EcnsFactory>,
    enabled: AtomicBool,
    requested_rate: AtomicU32,
    requested_mode: AtomicU32,
    session: Mutex<Option<EcnsSession>>,
    mailbox: DownlinkMailbox,
    effect: Mutex<Option<Box<dyn MediaEffect>>>,
}

impl PostProcessor {
    /// New engine with the given vendor factory
    pub fn new(config: HalConfig, factory: Box<dyn EcnsFactory>) -> Self {
        Self {
            config,
            factory,
            enabled: AtomicBool::new(false),
            requested_rate: AtomicU32::new(0),
            requested_mode: AtomicU32::new(0),
            session: Mutex::new(None),
            mailbox: DownlinkMailbox::new(),
            effect: Mutex::new(None),
        }
    }

    /// True when EC/NS is requested for the current routing
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Request EC/NS at `rate` (8000 or 16000) with the mode's profile
    /// block. A live session at a different rate or mode is torn down so
    /// the next uplink call reinitializes it.
    pub fn enable(&self, rate: u32, mode: usize) {
        self.requested_rate.store(rate, Ordering::Release);
        self.requested_mode.store(mode as u32, Ordering::Release);
        self.enabled.store(true, Ordering::Release);

        let mut session = self.session.lock();
        if let Some(s) = session.as_ref() {
            if s.rate != rate || s.mode != mode {
                info!("ecns session torn down for reinit ({} Hz -> {} Hz)", s.rate, rate);
                *session = None;
                self.mailbox.poison();
            }
        }
    }

    /// Drop the EC/NS request and any live session.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            debug!("ecns disabled");
        }
        let mut session = self.session.lock();
        if session.take().is_some() {
            self.mailbox.poison();
        }
    }

    /// Release a producer blocked on the mailbox; called when the
    /// playback path goes to standby.
    pub fn poison_downlink(&self) {
        self.mailbox.poison();
    }

    /// Playback-side entry: publish a mono downlink buffer and wait for
    /// the uplink consumer. Returns the number of samples consumed; 0
    /// when EC/NS is not running, in which case the caller writes the
    /// buffer itself.
    pub fn write_downlink(&self, samples: Vec<Sample>, sinks: SharedSinks, sink: SinkId) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        if self.session.lock().is_none() {
            // no consumer yet, don't block playback on a session that
            // has not been created
            return 0;
        }
        self.mailbox
            .publish(samples, sinks, sink, self.config.downlink_wait)
    }

    /// Capture-side entry: pair the uplink buffer with downlink audio,
    /// run the algorithm over both and write the processed downlink to
    /// its sink. The uplink buffer is processed in place.
    pub fn apply_uplink(&self, uplink: &mut [Sample]) {
        if !self.is_enabled() || uplink.is_empty() {
            return;
        }
        let mut guard = self.session.lock();
        if guard.is_none() {
            *guard = self.init_session();
        }
        let Some(session) = guard.as_mut() else {
            return;
        };
        let frame = frame_samples(session.rate);

        // gather a downlink buffer the same length as the uplink one,
        // carryover fragment first, then the mailbox, then silence
        let mut downlink: Vec<Sample> = Vec::with_capacity(uplink.len());
        let take = session.carryover.len().min(uplink.len());
        downlink.extend(session.carryover.drain(..take));

        let mut target = None;
        let mut retries = 0;
        while downlink.len() < uplink.len() {
            let pull = self.mailbox.pull(&mut downlink, uplink.len(), frame);
            if pull.target.is_some() {
                target = pull.target;
            }
            if !pull.spill.is_empty() {
                session.carryover.extend_from_slice(&pull.spill);
            }
            if downlink.len() >= uplink.len() {
                break;
            }
            if retries >= self.config.uplink_retries {
                debug!(
                    "downlink starved, padding {} samples with silence",
                    uplink.len() - downlink.len()
                );
                downlink.resize(uplink.len(), 0);
                break;
            }
            retries += 1;
            thread::sleep(self.config.uplink_retry);
        }

        for (dl, ul) in downlink.chunks_mut(frame).zip(uplink.chunks_mut(frame)) {
            if let Err(e) = session.algo.process_downlink(dl) {
                warn!("ecns downlink processing failed: {}", e);
            }
            if let Err(e) = session.algo.process_uplink(ul) {
                warn!("ecns uplink processing failed: {}", e);
            }
        }
        drop(guard);

        // the device write happens under the fd-group lock only, so a
        // routing change can still reach the session concurrently
        if let Some((sinks, sink)) = target {
            let data = match sink {
                SinkId::Codec => channels::mono_to_stereo(&downlink),
                _ => downlink,
            };
            let bytes: &[u8] = bytemuck::cast_slice(&data);
            let mut ports = sinks.lock();
            if let Some(port) = ports.port_mut(sink) {
                if let Err(e) = port.write(bytes) {
                    warn!("ecns downlink write to {:?} failed: {}", sink, e);
                }
            }
        }
    }

    fn init_session(&self) -> Option<EcnsSession> {
        let rate = self.requested_rate.load(Ordering::Acquire);
        let mode = self.requested_mode.load(Ordering::Acquire) as usize;
        let result = EcnsProfile::load(&self.config.ecns_profile_path)
            .and_then(|profile| profile.block(mode, rate).map(|b| b.to_vec()))
            .and_then(|block| self.factory.create(rate, &block));
        match result {
            Ok(algo) => {
                info!("ecns session up at {} Hz, mode {}", rate, mode);
                Some(EcnsSession {
                    rate,
                    mode,
                    algo,
                    carryover: Vec::new(),
                })
            }
            Err(e) => {
                warn!("ecns unavailable ({}), disabling for this session", e);
                self.enabled.store(false, Ordering::Release);
                None
            }
        }
    }

    /// Install (or clear) the media post-effect chain.
    pub fn set_effect(&self, effect: Option<Box<dyn MediaEffect>>) {
        *self.effect.lock() = effect;
    }

    /// Reconfigure the effect chain for a new accessory/rate pair.
    pub fn configure_effect(&self, path_index: usize, rate: u32) {
        if let Some(effect) = self.effect.lock().as_mut() {
            effect.configure(path_index, rate);
        }
    }

    /// Run media post-effects on a playback buffer. Skipped while EC/NS
    /// is active, the voice path owns the samples then.
    pub fn process_media(&self, frame: &mut [Sample]) {
        if self.is_enabled() {
            return;
        }
        if let Some(effect) = self.effect.lock().as_mut() {
            effect.process(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::SinkPorts;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    fn profile_fixture() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut raw = Vec::new();
        raw.extend_from_slice(&ECNS_PROFILE_MAGIC.to_le_bytes());
        raw.extend_from_slice(&ECNS_PROFILE_VERSION.to_le_bytes());
        raw.extend_from_slice(&10u16.to_le_bytes()); // block count
        raw.extend_from_slice(&16u16.to_le_bytes()); // block length
        for i in 0..10u8 {
            raw.extend_from_slice(&[i; 16]);
        }
        file.write_all(&raw).unwrap();
        file
    }

    fn engine_with_profile(file: &tempfile::NamedTempFile) -> PostProcessor {
        let config = HalConfig {
            ecns_profile_path: file.path().to_path_buf(),
            uplink_retry: Duration::from_millis(1),
            ..HalConfig::default()
        };
        PostProcessor::new(config, Box::new(PassthroughFactory))
    }

    fn sinks() -> SharedSinks {
        Arc::new(parking_lot::Mutex::new(SinkPorts::default()))
    }

    #[test]
    fn profile_blocks_are_keyed_by_mode_and_rate() {
        let file = profile_fixture();
        let profile = EcnsProfile::load(file.path()).unwrap();
        assert_eq!(profile.block(0, 8000).unwrap(), &[0u8; 16]);
        assert_eq!(profile.block(2, 8000).unwrap(), &[2u8; 16]);
        assert_eq!(profile.block(0, 16000).unwrap(), &[5u8; 16]);
        assert_eq!(profile.block(4, 16000).unwrap(), &[9u8; 16]);
        assert!(profile.block(0, 11025).is_err());
        assert!(profile.block(5, 8000).is_err());
    }

    #[test]
    fn profile_rejects_wrong_magic() {
        assert!(matches!(
            EcnsProfile::parse(b"XXXX\x01\x00\x0a\x00\x10\x00"),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn downlink_write_is_zero_when_disabled() {
        let file = profile_fixture();
        let pp = engine_with_profile(&file);
        assert_eq!(pp.write_downlink(vec![1; 160], sinks(), SinkId::Codec), 0);
    }

    #[test]
    fn uplink_pads_with_silence_when_starved() {
        let file = profile_fixture();
        let pp = engine_with_profile(&file);
        pp.enable(8000, 0);
        let mut uplink = vec![42; 160];
        // no producer: the downlink side is silence-padded and the
        // passthrough algorithm leaves uplink untouched
        pp.apply_uplink(&mut uplink);
        assert_eq!(uplink, vec![42; 160]);
        assert!(pp.is_enabled());
    }

    #[test]
    fn missing_profile_disables_for_session() {
        let config = HalConfig {
            ecns_profile_path: "/nonexistent/profile.bin".into(),
            ..HalConfig::default()
        };
        let pp = PostProcessor::new(config, Box::new(PassthroughFactory));
        pp.enable(8000, 0);
        let mut uplink = vec![0; 160];
        pp.apply_uplink(&mut uplink);
        assert!(!pp.is_enabled());
    }

    #[test]
    fn rate_change_tears_down_session() {
        let file = profile_fixture();
        let pp = engine_with_profile(&file);
        pp.enable(8000, 0);
        let mut uplink = vec![0; 160];
        pp.apply_uplink(&mut uplink);
        assert_eq!(pp.session.lock().as_ref().unwrap().rate, 8000);

        pp.enable(16000, 0);
        assert!(pp.session.lock().is_none());
        let mut uplink = vec![0; 320];
        pp.apply_uplink(&mut uplink);
        assert_eq!(pp.session.lock().as_ref().unwrap().rate, 16000);
    }

    #[test]
    fn effects_skipped_while_ecns_active() {
        struct Doubler;
        impl MediaEffect for Doubler {
            fn configure(&mut self, _path_index: usize, _rate: u32) {}
            fn process(&mut self, frame: &mut [Sample]) {
                for s in frame.iter_mut() {
                    *s = s.saturating_mul(2);
                }
            }
        }

        let file = profile_fixture();
        let pp = engine_with_profile(&file);
        pp.set_effect(Some(Box::new(Doubler)));

        let mut buf = vec![10; 4];
        pp.process_media(&mut buf);
        assert_eq!(buf, vec![20; 4]);

        pp.enable(8000, 0);
        pp.process_media(&mut buf);
        assert_eq!(buf, vec![20; 4]);
    }
}
