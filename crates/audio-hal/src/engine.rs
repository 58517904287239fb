//! The audio engine (hardware routing manager)
//!
//! Owns the codec control descriptor, the process-wide routing state
//! and the stream registry. Whenever the active device set, call mode
//! or stream activity changes, [`AudioEngine`] recomputes the full
//! routing table under one global lock and pushes the results to the
//! control port synchronously and to the streams as asynchronous flag
//! stores, so routing never blocks on another thread's device I/O.
//!
//! Lock order: routing state, stream registries, control port, fd
//! group. Stream pipeline locks are never taken while routing state is
//! held; the streams pick their flags up on the next read/write.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{self, HalConfig};
use crate::device::{CallMode, DeviceMask, InputPath, InputSource, OutputPath};
use crate::error::{Error, Result};
use crate::gain::GainTable;
use crate::hw::{AudioHardware, ControlPort, SharedSinks, SinkPorts};
use crate::params::{keys, Parameters};
use crate::processing::postproc::{EcnsFactory, PassthroughFactory, PostProcessor};
use crate::routing;
use crate::streams::{InputStream, OutputStream};
use crate::{SampleFormat, StreamParams};

/// Process-wide routing state, mutated only under the global lock
struct RoutingState {
    output_devices: DeviceMask,
    input_devices: DeviceMask,
    /// Cached last-pushed paths; `None` forces a re-push
    output_path: Option<OutputPath>,
    input_path: Option<InputPath>,
    hw_output_rate: u32,
    hw_input_rate: u32,
    mode: CallMode,
    master_volume: f32,
    voice_volume: f32,
    mic_mute: bool,
    bt_nrec: bool,
    bt_name: Option<String>,
    gain: GainTable,
}

pub(crate) struct EngineInner {
    hardware: Arc<dyn AudioHardware>,
    /// `None` when the control descriptor failed to open at
    /// construction; the whole HAL then reports not-initialized
    control: Mutex<Option<Box<dyn ControlPort>>>,
    state: Mutex<RoutingState>,
    post: Arc<PostProcessor>,
    sinks: SharedSinks,
    output: Mutex<Option<Arc<OutputStream>>>,
    inputs: Mutex<Vec<Arc<InputStream>>>,
}

/// The HAL context object. One per process; streams hold a weak
/// reference back to it for routing updates.
pub struct AudioEngine {
    inner: Arc<EngineInner>,
}

impl AudioEngine {
    /// Construct the engine against a hardware backend, with the
    /// built-in passthrough EC/NS algorithm.
    pub fn new(config: HalConfig, hardware: Arc<dyn AudioHardware>) -> AudioEngine {
        Self::with_ecns_factory(config, hardware, Box::new(PassthroughFactory))
    }

    /// Construct with a vendor EC/NS algorithm factory.
    ///
    /// A control-port open failure is not fatal here; it leaves the
    /// engine uninitialized and every subsequent call reports
    /// [`Error::NotInitialized`].
    pub fn with_ecns_factory(
        config: HalConfig,
        hardware: Arc<dyn AudioHardware>,
        factory: Box<dyn EcnsFactory>,
    ) -> AudioEngine {
        let control = match hardware.open_control() {
            Ok(port) => Some(port),
            Err(e) => {
                warn!("audio control descriptor unavailable: {}", e);
                None
            }
        };
        let gain = GainTable::load_or_default(&config.gain_table_path);
        let post = Arc::new(PostProcessor::new(config, factory));
        info!("audio engine up, initialized: {}", control.is_some());
        AudioEngine {
            inner: Arc::new(EngineInner {
                hardware,
                control: Mutex::new(control),
                state: Mutex::new(RoutingState {
                    output_devices: DeviceMask::NONE,
                    input_devices: DeviceMask::NONE,
                    output_path: None,
                    input_path: None,
                    hw_output_rate: 0,
                    hw_input_rate: 0,
                    mode: CallMode::Normal,
                    master_volume: 1.0,
                    voice_volume: 1.0,
                    mic_mute: false,
                    bt_nrec: false,
                    bt_name: None,
                    gain,
                }),
                post,
                sinks: Arc::new(Mutex::new(SinkPorts::default())),
                output: Mutex::new(None),
                inputs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// True when the control descriptor opened at construction
    pub fn is_initialized(&self) -> bool {
        self.inner.control.lock().is_some()
    }

    /// Open the playback stream. At most one exists system-wide; a
    /// second open is rejected. An unsupported configuration is
    /// corrected in place and rejected with a bad-value result.
    pub fn open_output_stream(
        &self,
        devices: DeviceMask,
        params: &mut StreamParams,
    ) -> Result<Arc<OutputStream>> {
        self.inner.check_initialized()?;
        validate_output_params(params)?;

        let stream = {
            let mut slot = self.inner.output.lock();
            if slot.is_some() {
                return Err(Error::InvalidOperation("output stream already open".into()));
            }
            let stream = OutputStream::new(
                *params,
                Arc::downgrade(&self.inner),
                Arc::clone(&self.inner.hardware),
                Arc::clone(&self.inner.sinks),
                Arc::clone(&self.inner.post),
            );
            *slot = Some(Arc::clone(&stream));
            stream
        };

        let mut state = self.inner.state.lock();
        state.output_devices = devices;
        if let Err(e) = self.inner.compute_routing_locked(&mut state) {
            warn!("routing after output open failed: {}", e);
        }
        Ok(stream)
    }

    /// Close the playback stream; an unrecognized handle is rejected.
    pub fn close_output_stream(&self, stream: &Arc<OutputStream>) -> Result<()> {
        {
            let mut slot = self.inner.output.lock();
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, stream) => *slot = None,
                _ => return Err(Error::InvalidOperation("unknown output stream".into())),
            }
        }
        stream.standby();
        self.inner.post.disable();
        self.inner.sinks.lock().close_all();
        self.inner.update_routing();
        debug!("output stream closed");
        Ok(())
    }

    /// Open a capture stream. Several may be open, but only one is
    /// active at a time; the requested rate snaps to the closest the
    /// ADC supports, reported as a bad value when it had to move.
    pub fn open_input_stream(
        &self,
        devices: DeviceMask,
        source: InputSource,
        params: &mut StreamParams,
    ) -> Result<Arc<InputStream>> {
        self.inner.check_initialized()?;
        if devices.has_multiple_bits() {
            return Err(Error::InvalidOperation(format!(
                "multiple input devices ({:#x}) are not supported",
                devices
            )));
        }
        validate_input_params(params)?;

        let stream = InputStream::new(
            *params,
            source,
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.hardware),
            Arc::clone(&self.inner.post),
        );
        self.inner.inputs.lock().push(Arc::clone(&stream));

        let mut state = self.inner.state.lock();
        state.input_devices = devices;
        if let Err(e) = self.inner.compute_routing_locked(&mut state) {
            warn!("routing after input open failed: {}", e);
        }
        Ok(stream)
    }

    /// Close a capture stream; an unrecognized handle is rejected.
    pub fn close_input_stream(&self, stream: &Arc<InputStream>) -> Result<()> {
        {
            let mut inputs = self.inner.inputs.lock();
            let index = inputs
                .iter()
                .position(|s| Arc::ptr_eq(s, stream))
                .ok_or_else(|| Error::InvalidOperation("unknown input stream".into()))?;
            inputs.remove(index);
        }
        stream.standby();
        self.inner.update_routing();
        debug!("input stream closed");
        Ok(())
    }

    /// Record the telephony mode. The cached physical paths are dropped
    /// so the next routing pass re-pushes them even when unchanged.
    pub fn set_mode(&self, mode: CallMode) -> Result<()> {
        self.inner.check_initialized()?;
        let mut state = self.inner.state.lock();
        if state.mode != mode {
            info!("call mode {:?} -> {:?}", state.mode, mode);
            state.mode = mode;
            state.output_path = None;
            state.input_path = None;
            self.inner.compute_routing_locked(&mut state)?;
        }
        Ok(())
    }

    /// Master volume in [0, 1], mapped onto the gain table steps
    pub fn set_master_volume(&self, volume: f32) -> Result<()> {
        self.inner.check_initialized()?;
        let mut state = self.inner.state.lock();
        state.master_volume = volume.clamp(0.0, 1.0);
        self.inner.compute_routing_locked(&mut state)
    }

    /// In-call volume in [0, 1]
    pub fn set_voice_volume(&self, volume: f32) -> Result<()> {
        self.inner.check_initialized()?;
        let mut state = self.inner.state.lock();
        state.voice_volume = volume.clamp(0.0, 1.0);
        self.inner.compute_routing_locked(&mut state)
    }

    /// Microphone mute, applied by the input stream after processing
    pub fn set_mic_mute(&self, muted: bool) -> Result<()> {
        self.inner.check_initialized()?;
        self.inner.state.lock().mic_mute = muted;
        for input in self.inner.inputs.lock().iter() {
            input.set_muted(muted);
        }
        Ok(())
    }

    /// Current microphone mute state
    pub fn mic_mute(&self) -> Result<bool> {
        self.inner.check_initialized()?;
        Ok(self.inner.state.lock().mic_mute)
    }

    /// Apply global `key=value` parameters (Bluetooth accessory state).
    /// Recognized keys are applied even when unknown keys make the call
    /// report a bad value.
    pub fn set_parameters(&self, kvpairs: &str) -> Result<()> {
        self.inner.check_initialized()?;
        let mut params = Parameters::parse(kvpairs);
        let mut touched = false;

        if let Some(value) = params.remove(keys::BT_NREC) {
            let nrec = match value.as_str() {
                "on" => true,
                "off" => false,
                other => return Err(Error::BadValue(format!("bt_headset_nrec={}", other))),
            };
            self.inner.state.lock().bt_nrec = nrec;
            touched = true;
        }
        if let Some(name) = params.remove(keys::BT_NAME) {
            debug!("bluetooth accessory {:?}", name);
            self.inner.state.lock().bt_name = Some(name);
            touched = true;
        }
        if touched {
            self.inner.update_routing();
        }

        if params.is_empty() {
            Ok(())
        } else {
            Err(Error::BadValue(format!(
                "unrecognized parameters: {}",
                params.to_string()
            )))
        }
    }

    /// Echo the requested parameter keys with their current values
    pub fn get_parameters(&self, request: &str) -> String {
        let state = self.inner.state.lock();
        let mut reply = Parameters::default();
        for key in request.split(';').filter(|k| !k.is_empty()) {
            match key {
                keys::BT_NREC => reply.set(keys::BT_NREC, if state.bt_nrec { "on" } else { "off" }),
                keys::BT_NAME => {
                    if let Some(name) = &state.bt_name {
                        reply.set(keys::BT_NAME, name);
                    }
                }
                keys::ROUTING => reply.set(keys::ROUTING, state.output_devices.0),
                _ => {}
            }
        }
        reply.to_string()
    }

    /// Human-readable state report for bug reports and debugging.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        let mut s = String::new();
        let _ = writeln!(s, "initialized: {}", self.is_initialized());
        {
            let state = self.inner.state.lock();
            let _ = writeln!(s, "mode: {:?}", state.mode);
            let _ = writeln!(
                s,
                "output devices: {:#x}, path: {:?} @ {} Hz",
                state.output_devices, state.output_path, state.hw_output_rate
            );
            let _ = writeln!(
                s,
                "input devices: {:#x}, path: {:?} @ {} Hz",
                state.input_devices, state.input_path, state.hw_input_rate
            );
            let _ = writeln!(
                s,
                "master volume: {:.2}, voice volume: {:.2}, mic mute: {}",
                state.master_volume, state.voice_volume, state.mic_mute
            );
            let _ = writeln!(s, "bt nrec: {}, accessory: {:?}", state.bt_nrec, state.bt_name);
        }
        match self.inner.output.lock().as_ref() {
            Some(out) => {
                let _ = writeln!(
                    s,
                    "output stream: {:?}, {} frames rendered",
                    out.state(),
                    out.render_position()
                );
            }
            None => {
                let _ = writeln!(s, "output stream: none");
            }
        }
        for (i, input) in self.inner.inputs.lock().iter().enumerate() {
            let _ = writeln!(
                s,
                "input stream {}: {:?}, {:?} @ {} Hz",
                i,
                input.state(),
                input.source(),
                input.rate()
            );
        }
        s
    }

    /// Capture buffer size for a configuration; unsupported
    /// configurations get 0 with a warning.
    pub fn input_buffer_size(&self, params: &StreamParams) -> usize {
        if params.format != SampleFormat::Pcm16 || !(1..=2).contains(&params.channels) {
            warn!(
                "unsupported capture configuration {:?}/{} channels",
                params.format, params.channels
            );
            return 0;
        }
        2048 * params.channels as usize
    }
}

impl EngineInner {
    fn check_initialized(&self) -> Result<()> {
        if self.control.lock().is_some() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Recompute routing, logging failures. The streams call this on
    /// their online transitions.
    pub(crate) fn update_routing(&self) {
        let mut state = self.state.lock();
        if let Err(e) = self.compute_routing_locked(&mut state) {
            warn!("routing update failed: {}", e);
        }
    }

    /// Move the playback device selection and re-route
    pub(crate) fn set_output_devices(&self, devices: DeviceMask) -> Result<()> {
        let mut state = self.state.lock();
        state.output_devices = devices;
        self.compute_routing_locked(&mut state)
    }

    /// Move the capture device selection and re-route. Masks with more
    /// than one bit are rejected before any state changes.
    pub(crate) fn set_input_devices(&self, devices: DeviceMask) -> Result<()> {
        if devices.has_multiple_bits() {
            return Err(Error::InvalidOperation(format!(
                "multiple input devices ({:#x}) are not supported",
                devices
            )));
        }
        let mut state = self.state.lock();
        state.input_devices = devices;
        self.compute_routing_locked(&mut state)
    }

    pub(crate) fn output_devices(&self) -> DeviceMask {
        self.state.lock().output_devices
    }

    pub(crate) fn input_devices(&self) -> DeviceMask {
        self.state.lock().input_devices
    }

    /// The routing pass. Resolves physical paths, rates, gain and the
    /// EC/NS request from the union of device masks, call mode and
    /// stream activity, then pushes everything outward. Control-port
    /// failures are logged and skipped; the only hard failure is a
    /// multi-bit input mask, which leaves prior state untouched.
    fn compute_routing_locked(&self, state: &mut RoutingState) -> Result<()> {
        // resolve everything fallible before mutating
        let input_path = routing::resolve_input_path(state.input_devices)?;
        let sink_set = routing::partition_output(state.output_devices);
        let output_path = routing::resolve_output_path(sink_set.speaker_class);

        let output = self.output.lock().clone();
        let active_input = self.inputs.lock().iter().find(|i| i.is_active()).cloned();

        let mut control_guard = self.control.lock();
        let control = control_guard.as_mut().ok_or(Error::NotInitialized)?;

        if state.output_path != Some(output_path) {
            if let Err(e) = control.set_output_path(output_path, true) {
                warn!("output path selection failed: {}", e);
            }
            state.output_path = Some(output_path);
        }
        if state.input_path != Some(input_path) {
            if let Err(e) = control.set_input_path(input_path, true) {
                warn!("input path selection failed: {}", e);
            }
            state.input_path = Some(input_path);
        }

        // EC/NS eligibility and the hardware rates both directions run at
        let output_standby = output.as_ref().map(|o| o.is_standby()).unwrap_or(true);
        let input_info = active_input.as_ref().map(|i| (i.source(), i.rate()));
        let ecns = routing::ecns_rate(state.mode, output_standby, input_info);
        // the SCO link runs at 8 kHz, so the session must too
        let ecns = if sink_set.bluetooth {
            ecns.map(|_| config::BLUETOOTH_SCO_RATE)
        } else {
            ecns
        };
        let input_rate = input_info
            .map(|(_, rate)| rate)
            .unwrap_or(config::DEFAULT_INPUT_RATE);
        let (out_rate, in_rate) = routing::target_rates(ecns, sink_set.bluetooth, input_rate);

        if state.hw_output_rate != out_rate {
            // stale-rate audio must never hit new-rate hardware
            if let Err(e) = self.sinks.lock().flush_all() {
                warn!("sink flush before rate change failed: {}", e);
            }
            if let Err(e) = control.set_output_rate(out_rate) {
                warn!("output rate programming failed: {}", e);
            }
            debug!("playback hardware rate -> {} Hz", out_rate);
            state.hw_output_rate = out_rate;
        }
        if state.hw_input_rate != in_rate {
            if let Some(input) = active_input.as_ref() {
                input.request_flush();
            }
            if let Err(e) = control.set_input_rate(in_rate) {
                warn!("input rate programming failed: {}", e);
            }
            debug!("capture hardware rate -> {} Hz", in_rate);
            state.hw_input_rate = in_rate;
        }

        // gain for the active usecase, scaled by the relevant volume
        let usecase = routing::select_usecase(state.mode, input_info.map(|(s, _)| s));
        let volume = if state.mode.in_call() {
            state.voice_volume
        } else {
            state.master_volume
        };
        if let Err(e) =
            control.set_output_volume(state.gain.output_step(usecase, output_path, volume))
        {
            warn!("output gain programming failed: {}", e);
        }
        if let Err(e) = control.set_input_gain(state.gain.input_step(usecase, input_path, volume)) {
            warn!("input gain programming failed: {}", e);
        }
        drop(control_guard);

        match ecns {
            Some(rate) => self.post.enable(rate, output_path.ecns_mode()),
            None => self.post.disable(),
        }

        // asynchronous stores; the streams apply them on their next
        // read/write
        if let Some(output) = output.as_ref() {
            output.set_hw_rate(out_rate);
            output.set_driver(sink_set.speaker(), sink_set.bluetooth, sink_set.spdif);
        }
        if let Some(input) = active_input.as_ref() {
            input.set_hw_rate(in_rate);
            input.set_muted(state.mic_mute);
        }
        Ok(())
    }
}

fn validate_output_params(params: &mut StreamParams) -> Result<()> {
    let mut rejected = false;
    if params.format != SampleFormat::Pcm16 {
        params.format = SampleFormat::Pcm16;
        rejected = true;
    }
    match params.channels {
        0 => params.channels = 2,
        2 => {}
        _ => {
            params.channels = 2;
            rejected = true;
        }
    }
    match params.rate {
        0 => params.rate = config::OUTPUT_RATE,
        config::OUTPUT_RATE => {}
        _ => {
            params.rate = config::OUTPUT_RATE;
            rejected = true;
        }
    }
    if rejected {
        Err(Error::BadValue("unsupported output configuration".into()))
    } else {
        Ok(())
    }
}

fn validate_input_params(params: &mut StreamParams) -> Result<()> {
    let mut rejected = false;
    if params.format != SampleFormat::Pcm16 {
        params.format = SampleFormat::Pcm16;
        rejected = true;
    }
    match params.channels {
        0 => params.channels = 1,
        1 => {}
        _ => {
            params.channels = 1;
            rejected = true;
        }
    }
    if params.rate == 0 {
        params.rate = config::DEFAULT_INPUT_RATE;
    } else {
        let snapped = config::nearest_input_rate(params.rate);
        if snapped != params.rate {
            params.rate = snapped;
            rejected = true;
        }
    }
    if rejected {
        Err(Error::BadValue("unsupported capture configuration".into()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{input, output};
    use crate::hw::mock::MockHardware;
    use crate::processing::postproc::{
        EcnsAlgorithm, PassthroughEcns, ECNS_PROFILE_MAGIC, ECNS_PROFILE_VERSION,
    };
    use std::io::Write as _;
    use std::time::Duration;

    fn engine() -> (AudioEngine, Arc<MockHardware>) {
        let hardware = Arc::new(MockHardware::new());
        let engine = AudioEngine::new(HalConfig::default(), hardware.clone());
        (engine, hardware)
    }

    fn profile_fixture() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut raw = Vec::new();
        raw.extend_from_slice(&ECNS_PROFILE_MAGIC.to_le_bytes());
        raw.extend_from_slice(&ECNS_PROFILE_VERSION.to_le_bytes());
        raw.extend_from_slice(&10u16.to_le_bytes());
        raw.extend_from_slice(&16u16.to_le_bytes());
        for i in 0..10u8 {
            raw.extend_from_slice(&[i; 16]);
        }
        file.write_all(&raw).unwrap();
        file
    }

    /// Records every session the factory is asked to create: the rate
    /// and the first byte of the profile block it was handed.
    struct RecordingFactory {
        calls: Arc<Mutex<Vec<(u32, u8)>>>,
    }

    impl EcnsFactory for RecordingFactory {
        fn create(&self, rate: u32, profile: &[u8]) -> Result<Box<dyn EcnsAlgorithm>> {
            self.calls.lock().push((rate, profile[0]));
            Ok(Box::new(PassthroughEcns))
        }
    }

    fn call_engine(
        profile: &tempfile::NamedTempFile,
    ) -> (AudioEngine, Arc<MockHardware>, Arc<Mutex<Vec<(u32, u8)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let hardware = Arc::new(MockHardware::new());
        let config = HalConfig {
            ecns_profile_path: profile.path().to_path_buf(),
            uplink_retry: Duration::from_millis(1),
            ..HalConfig::default()
        };
        let engine = AudioEngine::with_ecns_factory(
            config,
            hardware.clone(),
            Box::new(RecordingFactory {
                calls: Arc::clone(&calls),
            }),
        );
        (engine, hardware, calls)
    }

    #[test]
    fn missing_control_descriptor_is_the_fatal_case() {
        let hardware = Arc::new(MockHardware::new().without_control());
        let engine = AudioEngine::new(HalConfig::default(), hardware);
        assert!(!engine.is_initialized());

        let mut params = StreamParams::default_output();
        let err = engine.open_output_stream(DeviceMask(output::SPEAKER), &mut params);
        assert!(matches!(err, Err(Error::NotInitialized)));
        assert!(matches!(engine.set_mode(CallMode::InCall), Err(Error::NotInitialized)));
    }

    #[test]
    fn second_output_stream_is_rejected() {
        let (engine, _) = engine();
        let mut params = StreamParams::default_output();
        let first = engine
            .open_output_stream(DeviceMask(output::SPEAKER), &mut params)
            .unwrap();
        let err = engine.open_output_stream(DeviceMask(output::SPEAKER), &mut params);
        assert!(matches!(err, Err(Error::InvalidOperation(_))));

        engine.close_output_stream(&first).unwrap();
        let again = engine.open_output_stream(DeviceMask(output::SPEAKER), &mut params);
        assert!(again.is_ok());
    }

    #[test]
    fn closing_an_unknown_stream_is_rejected() {
        let (engine, _) = engine();
        let (other_engine, _) = self::engine();
        let mut params = StreamParams::default_output();
        let foreign = other_engine
            .open_output_stream(DeviceMask(output::SPEAKER), &mut params)
            .unwrap();
        assert!(matches!(
            engine.close_output_stream(&foreign),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn rejected_output_config_is_corrected_in_place() {
        let (engine, _) = engine();
        let mut params = StreamParams {
            format: SampleFormat::Pcm16,
            channels: 1,
            rate: 22050,
        };
        let err = engine.open_output_stream(DeviceMask(output::SPEAKER), &mut params);
        assert!(matches!(err, Err(Error::BadValue(_))));
        assert_eq!(params.channels, 2);
        assert_eq!(params.rate, config::OUTPUT_RATE);
    }

    #[test]
    fn input_rate_snaps_to_supported_grid() {
        let (engine, _) = engine();
        let mut params = StreamParams {
            format: SampleFormat::Pcm16,
            channels: 1,
            rate: 12000,
        };
        let err = engine.open_input_stream(
            DeviceMask(input::BUILTIN_MIC),
            InputSource::Mic,
            &mut params,
        );
        assert!(matches!(err, Err(Error::BadValue(_))));
        assert_eq!(params.rate, 11025);

        // the corrected rate is accepted on retry
        let stream = engine
            .open_input_stream(DeviceMask(input::BUILTIN_MIC), InputSource::Mic, &mut params)
            .unwrap();
        assert_eq!(stream.rate(), 11025);
    }

    #[test]
    fn multi_bit_input_mask_is_rejected_and_state_preserved() {
        let (engine, hardware) = engine();
        let mut params = StreamParams::default_input();
        let stream = engine
            .open_input_stream(DeviceMask(input::BUILTIN_MIC), InputSource::Mic, &mut params)
            .unwrap();
        let mut buf = [0u8; 32];
        stream.read(&mut buf).unwrap();
        let before = hardware.control_log().lock().input_path;

        let err = stream.set_parameters("routing=0x5");
        assert!(matches!(err, Err(Error::InvalidOperation(_))));
        assert_eq!(engine.inner.input_devices(), DeviceMask(input::BUILTIN_MIC));
        assert_eq!(hardware.control_log().lock().input_path, before);
    }

    #[test]
    fn routing_pushes_paths_and_rates() {
        let (engine, hardware) = engine();
        let mut params = StreamParams::default_output();
        let out = engine
            .open_output_stream(DeviceMask(output::SPEAKER), &mut params)
            .unwrap();
        out.write(&[0u8; 64]).unwrap();

        let log = hardware.control_log().lock().clone();
        assert_eq!(log.output_path, Some((OutputPath::Speaker, true)));
        assert_eq!(log.output_rates, vec![config::OUTPUT_RATE]);
        assert!(log.output_volume.is_some());
    }

    #[test]
    fn bluetooth_routing_forces_8k() {
        let (engine, hardware) = engine();
        let mut params = StreamParams::default_output();
        let out = engine
            .open_output_stream(
                DeviceMask(output::SPEAKER | output::BLUETOOTH_SCO),
                &mut params,
            )
            .unwrap();
        out.write(&[0u8; 64]).unwrap();

        let log = hardware.control_log().lock().clone();
        assert_eq!(log.output_rates.last(), Some(&config::BLUETOOTH_SCO_RATE));
    }

    #[test]
    fn bluetooth_call_pins_the_ecns_session_to_the_link_rate() {
        let profile = profile_fixture();
        let (engine, hardware, calls) = call_engine(&profile);
        engine.set_mode(CallMode::InCall).unwrap();

        let mut out_params = StreamParams::default_output();
        let out = engine
            .open_output_stream(
                DeviceMask(output::SPEAKER | output::BLUETOOTH_SCO),
                &mut out_params,
            )
            .unwrap();
        out.write(&[0u8; 64]).unwrap();

        let mut in_params = StreamParams {
            rate: 16000,
            ..StreamParams::default_input()
        };
        let mic = engine
            .open_input_stream(
                DeviceMask(input::BUILTIN_MIC),
                InputSource::VoiceCommunication,
                &mut in_params,
            )
            .unwrap();
        let mut buf = [0u8; 640];
        mic.read(&mut buf).unwrap();

        // both hardware directions and the canceller run at the SCO rate
        let log = hardware.control_log().lock().clone();
        assert_eq!(log.output_rates.last(), Some(&config::BLUETOOTH_SCO_RATE));
        assert_eq!(log.input_rates.last(), Some(&config::BLUETOOTH_SCO_RATE));
        assert_eq!(calls.lock().as_slice(), &[(8000, 0)]);
    }

    #[test]
    fn accessory_change_reloads_the_ecns_profile_block() {
        let profile = profile_fixture();
        let (engine, _hardware, calls) = call_engine(&profile);
        engine.set_mode(CallMode::InCall).unwrap();

        let mut out_params = StreamParams::default_output();
        let out = engine
            .open_output_stream(DeviceMask(output::SPEAKER), &mut out_params)
            .unwrap();
        out.write(&[0u8; 64]).unwrap();

        let mut in_params = StreamParams {
            rate: 8000,
            ..StreamParams::default_input()
        };
        let mic = engine
            .open_input_stream(
                DeviceMask(input::BUILTIN_MIC),
                InputSource::VoiceCommunication,
                &mut in_params,
            )
            .unwrap();
        let mut buf = [0u8; 320];
        mic.read(&mut buf).unwrap();

        // mid-call the user plugs a headset in; the session comes back
        // with the headset tuning block
        out.set_parameters(&format!("routing={}", output::WIRED_HEADSET))
            .unwrap();
        mic.read(&mut buf).unwrap();

        assert_eq!(calls.lock().as_slice(), &[(8000, 0), (8000, 1)]);
    }

    #[test]
    fn dump_reports_the_routing_state() {
        let (engine, _) = engine();
        engine.set_mode(CallMode::InCall).unwrap();
        let mut params = StreamParams::default_output();
        let out = engine
            .open_output_stream(DeviceMask(output::SPEAKER), &mut params)
            .unwrap();
        out.write(&[0u8; 64]).unwrap();

        let report = engine.dump();
        assert!(report.contains("initialized: true"));
        assert!(report.contains("mode: InCall"));
        assert!(report.contains("Speaker"));
        assert!(report.contains("16 frames rendered"));
    }

    #[test]
    fn unknown_parameter_keys_report_bad_value_after_applying_known() {
        let (engine, _) = engine();
        let err = engine.set_parameters("bt_headset_name=carkit;mystery=1");
        assert!(matches!(err, Err(Error::BadValue(_))));
        assert_eq!(
            engine.get_parameters("bt_headset_name"),
            "bt_headset_name=carkit"
        );
    }

    #[test]
    fn nrec_toggle_round_trips() {
        let (engine, _) = engine();
        engine.set_parameters("bt_headset_nrec=on").unwrap();
        assert_eq!(engine.get_parameters("bt_headset_nrec"), "bt_headset_nrec=on");
        engine.set_parameters("bt_headset_nrec=off").unwrap();
        assert_eq!(engine.get_parameters("bt_headset_nrec"), "bt_headset_nrec=off");
    }

    #[test]
    fn buffer_size_rejects_unsupported_configs() {
        let (engine, _) = engine();
        assert_eq!(engine.input_buffer_size(&StreamParams::default_input()), 2048);
        let bad = StreamParams {
            format: SampleFormat::Pcm16,
            channels: 4,
            rate: 8000,
        };
        assert_eq!(engine.input_buffer_size(&bad), 0);
    }

    #[test]
    fn mic_mute_round_trips() {
        let (engine, _) = engine();
        engine.set_mic_mute(true).unwrap();
        assert!(engine.mic_mute().unwrap());
        engine.set_mic_mute(false).unwrap();
        assert!(!engine.mic_mute().unwrap());
    }
}
