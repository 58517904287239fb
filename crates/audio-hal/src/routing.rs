//! Routing decision tables
//!
//! Pure functions mapping logical device masks onto physical codec
//! paths, per-sink fan-out and target sample rates. The
//! [`AudioEngine`](crate::engine::AudioEngine) calls these under the
//! global routing lock; keeping them side-effect free makes the
//! priority tables testable in isolation.

use tracing::warn;

use crate::config::{BLUETOOTH_SCO_RATE, OUTPUT_RATE};
use crate::device::{input, output, CallMode, DeviceMask, InputPath, InputSource, OutputPath, Usecase};
use crate::error::{Error, Result};

/// The three independent playback paths a device mask fans out to.
///
/// Each subset may be simultaneously active; the PCM stream is
/// duplicated across them by the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkSet {
    /// Everything that is not Bluetooth or S/PDIF, routed via the codec
    pub speaker_class: DeviceMask,
    /// Any Bluetooth SCO bit
    pub bluetooth: bool,
    /// The S/PDIF bit
    pub spdif: bool,
}

impl SinkSet {
    /// True when the primary codec path carries audio
    pub fn speaker(&self) -> bool {
        !self.speaker_class.is_empty()
    }
}

/// Partition an output device mask into its disjoint sink subsets.
pub fn partition_output(devices: DeviceMask) -> SinkSet {
    SinkSet {
        speaker_class: DeviceMask(devices.0 & !(output::ALL_SCO | output::SPDIF)),
        bluetooth: devices.intersects(output::ALL_SCO),
        spdif: devices.intersects(output::SPDIF),
    }
}

/// Resolve the physical codec path for the speaker-class subset of an
/// output mask.
///
/// Fixed priority; an unsupported combination falls back to the speaker
/// with a warning rather than failing routing.
pub fn resolve_output_path(speaker_class: DeviceMask) -> OutputPath {
    let m = speaker_class.0;
    if m & output::WIRED_HEADSET != 0 && m & output::SPEAKER != 0 {
        OutputPath::HeadsetAndSpeaker
    } else if m & output::WIRED_HEADPHONE != 0 && m & output::SPEAKER != 0 {
        OutputPath::Speaker
    } else if m & (output::WIRED_HEADSET | output::WIRED_HEADPHONE) != 0 {
        OutputPath::Headset
    } else if m & output::ANLG_DOCK != 0 {
        OutputPath::AnalogDock
    } else if m & (output::SPEAKER | output::EARPIECE) != 0 || m == 0 {
        OutputPath::Speaker
    } else {
        warn!("unsupported output combination {:#x}, routing to speaker", speaker_class);
        OutputPath::Speaker
    }
}

/// Resolve the physical microphone path for an input mask.
///
/// Rejects masks with more than one bit set; anything unrecognized
/// falls back to the built-in microphone.
pub fn resolve_input_path(devices: DeviceMask) -> Result<InputPath> {
    if devices.has_multiple_bits() {
        return Err(Error::InvalidOperation(format!(
            "multiple input devices ({:#x}) are not supported",
            devices
        )));
    }
    let path = match devices.0 {
        input::WIRED_HEADSET => InputPath::Mic2,
        0 | input::BUILTIN_MIC | input::BLUETOOTH_SCO_HEADSET => InputPath::Mic1,
        other => {
            warn!("unsupported input device {:#x}, routing to mic1", other);
            InputPath::Mic1
        }
    };
    Ok(path)
}

/// EC/NS eligibility and rate selection.
///
/// EC/NS requires a voice call mode, a live output stream and an active
/// capture path whose source is voice communication; the hardware
/// canceller only runs at 8 or 16 kHz, so any other negotiated input
/// rate disables it.
pub fn ecns_rate(
    mode: CallMode,
    output_standby: bool,
    active_input: Option<(InputSource, u32)>,
) -> Option<u32> {
    if !mode.in_call() || output_standby {
        return None;
    }
    match active_input {
        Some((InputSource::VoiceCommunication, rate)) if rate == 8000 || rate == 16000 => Some(rate),
        _ => None,
    }
}

/// Target hardware rates for both directions.
///
/// A Bluetooth SCO path overrides everything: the link is fixed at
/// 8 kHz. Otherwise an eligible EC/NS session pins both directions to
/// its rate, and the default is the 44.1 kHz native rate.
pub fn target_rates(ecns: Option<u32>, bluetooth_active: bool, input_rate: u32) -> (u32, u32) {
    if bluetooth_active {
        return (BLUETOOTH_SCO_RATE, BLUETOOTH_SCO_RATE);
    }
    match ecns {
        Some(rate) => (rate, rate),
        None => (OUTPUT_RATE, input_rate),
    }
}

/// Gain usecase for the current call/input state.
pub fn select_usecase(mode: CallMode, active_source: Option<InputSource>) -> Usecase {
    if mode.in_call() {
        Usecase::Voice
    } else if active_source == Some(InputSource::VoiceRecognition) {
        Usecase::VoiceRecognition
    } else {
        Usecase::Media
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_resolution_is_total() {
        // every combination of the speaker-class bits resolves somewhere
        let bits = [
            output::EARPIECE,
            output::SPEAKER,
            output::WIRED_HEADSET,
            output::WIRED_HEADPHONE,
            output::ANLG_DOCK,
        ];
        for mask in 0u32..(1 << bits.len()) {
            let mut devices = 0;
            for (i, b) in bits.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    devices |= b;
                }
            }
            // no panic, always a concrete path
            let _ = resolve_output_path(DeviceMask(devices));
        }
    }

    #[test]
    fn output_priority_table() {
        assert_eq!(resolve_output_path(DeviceMask(output::SPEAKER)), OutputPath::Speaker);
        assert_eq!(resolve_output_path(DeviceMask(output::EARPIECE)), OutputPath::Speaker);
        assert_eq!(
            resolve_output_path(DeviceMask(output::WIRED_HEADSET)),
            OutputPath::Headset
        );
        assert_eq!(
            resolve_output_path(DeviceMask(output::WIRED_HEADSET | output::SPEAKER)),
            OutputPath::HeadsetAndSpeaker
        );
        assert_eq!(
            resolve_output_path(DeviceMask(output::WIRED_HEADPHONE | output::SPEAKER)),
            OutputPath::Speaker
        );
        assert_eq!(resolve_output_path(DeviceMask(output::ANLG_DOCK)), OutputPath::AnalogDock);
        assert_eq!(resolve_output_path(DeviceMask::NONE), OutputPath::Speaker);
    }

    #[test]
    fn input_resolution() {
        assert_eq!(
            resolve_input_path(DeviceMask(input::BUILTIN_MIC)).unwrap(),
            InputPath::Mic1
        );
        assert_eq!(
            resolve_input_path(DeviceMask(input::WIRED_HEADSET)).unwrap(),
            InputPath::Mic2
        );
        assert_eq!(resolve_input_path(DeviceMask::NONE).unwrap(), InputPath::Mic1);
    }

    #[test]
    fn multiple_input_bits_rejected() {
        let err = resolve_input_path(DeviceMask(input::BUILTIN_MIC | input::WIRED_HEADSET));
        assert!(matches!(err, Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn partition_splits_disjoint_subsets() {
        let set = partition_output(DeviceMask(
            output::SPEAKER | output::BLUETOOTH_SCO | output::SPDIF,
        ));
        assert!(set.speaker());
        assert!(set.bluetooth);
        assert!(set.spdif);
        assert_eq!(set.speaker_class, DeviceMask(output::SPEAKER));
    }

    #[test]
    fn ecns_requires_mode_source_and_rate() {
        let comm = Some((InputSource::VoiceCommunication, 8000));
        assert_eq!(ecns_rate(CallMode::InCall, false, comm), Some(8000));
        assert_eq!(ecns_rate(CallMode::InCommunication, false, comm), Some(8000));
        assert_eq!(ecns_rate(CallMode::Normal, false, comm), None);
        assert_eq!(ecns_rate(CallMode::InCall, true, comm), None);
        assert_eq!(
            ecns_rate(CallMode::InCall, false, Some((InputSource::Mic, 8000))),
            None
        );
        // 44.1 kHz capture can never feed the canceller
        assert_eq!(
            ecns_rate(CallMode::InCall, false, Some((InputSource::VoiceCommunication, 44100))),
            None
        );
    }

    #[test]
    fn bluetooth_forces_8k_over_ecns_choice() {
        assert_eq!(target_rates(Some(16000), true, 16000), (8000, 8000));
        assert_eq!(target_rates(Some(16000), false, 16000), (16000, 16000));
        assert_eq!(target_rates(None, false, 11025), (44100, 11025));
    }
}
