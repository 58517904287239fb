//! In-call EC/NS rendezvous between real playback and capture threads

use std::io::Write as _;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use audio_hal::device::{input, output, CallMode, DeviceMask, InputSource};
use audio_hal::hw::mock::MockHardware;
use audio_hal::hw::SinkId;
use audio_hal::processing::postproc::{ECNS_PROFILE_MAGIC, ECNS_PROFILE_VERSION};
use audio_hal::{AudioEngine, HalConfig, StreamParams};
use serial_test::serial;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn ecns_profile() -> tempfile::NamedTempFile {
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

fn call_setup() -> (
    AudioEngine,
    Arc<MockHardware>,
    tempfile::NamedTempFile,
) {
    init_tracing();
    let profile = ecns_profile();
    let hardware = Arc::new(MockHardware::new());
    let config = HalConfig {
        ecns_profile_path: profile.path().to_path_buf(),
        downlink_wait: Duration::from_millis(200),
        uplink_retry: Duration::from_millis(2),
        ..HalConfig::default()
    };
    let engine = AudioEngine::new(config, hardware.clone());
    (engine, hardware, profile)
}

#[test]
#[serial]
fn duplex_call_feeds_the_codec_through_the_canceller() {
    let (engine, hardware, _profile) = call_setup();
    engine.set_mode(CallMode::InCommunication).unwrap();

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
    // first read brings EC/NS up
    let mut buf = [0u8; 320];
    mic.read(&mut buf).unwrap();

    // 882 stereo frames at 44.1 kHz convert to one 160-sample frame at
    // 8 kHz, matching each 320-byte capture read
    let writer = thread::spawn(move || {
        let chunk = vec![0x10u8; 882 * 4];
        for _ in 0..6 {
            if out.write(&chunk).is_err() {
                break;
            }
        }
        out
    });
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 320];
        for _ in 0..8 {
            if mic.read(&mut buf).is_err() {
                break;
            }
        }
        mic
    });
    let out = writer.join().unwrap();
    let mic = reader.join().unwrap();

    // the processed downlink reached the codec as stereo 8 kHz frames
    // (640 bytes per 160-sample frame), either through the rendezvous
    // or through the starved-producer direct fallback
    let writes = hardware.sink_log(SinkId::Codec).lock().writes.clone();
    assert!(
        writes.iter().any(|&w| w == 640),
        "no processed downlink write, writes: {:?}",
        writes
    );

    engine.close_input_stream(&mic).unwrap();
    engine.close_output_stream(&out).unwrap();
}

#[test]
#[serial]
fn standby_releases_a_blocked_downlink_producer() {
    let (engine, _hardware, _profile) = call_setup();
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

    // with no consumer running, the producer must come back within its
    // bounded wait instead of hanging playback
    let start = std::time::Instant::now();
    out.write(&vec![0u8; 882 * 4]).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));

    // idempotent standby from both sides
    out.standby();
    out.standby();
    mic.standby();
    mic.standby();
}

#[test]
#[serial]
fn muted_capture_is_silent_but_still_paced() {
    let (engine, hardware, _profile) = call_setup();
    engine.set_mic_mute(true).unwrap();

    let mut in_params = StreamParams {
        rate: 8000,
        ..StreamParams::default_input()
    };
    let mic = engine
        .open_input_stream(
            DeviceMask(input::BUILTIN_MIC),
            InputSource::Mic,
            &mut in_params,
        )
        .unwrap();

    let mut buf = [0xaau8; 320];
    let n = mic.read(&mut buf).unwrap();
    assert_eq!(n, 320);
    assert!(buf.iter().all(|&b| b == 0));
    // the device was still read so loss accounting keeps its clock
    assert_eq!(hardware.input_script().lock().reads, vec![320]);
}
