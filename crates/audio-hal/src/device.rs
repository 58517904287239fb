//! Logical devices, physical paths and call state
//!
//! Logical devices are the bit-sets the audio framework routes with;
//! physical paths are what the codec control port actually understands.
//! The mapping between them lives in [`crate::routing`].

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Output device bits
pub mod output {
    /// Handset earpiece
    pub const EARPIECE: u32 = 0x0001;
    /// Loudspeaker
    pub const SPEAKER: u32 = 0x0002;
    /// Wired headset with microphone
    pub const WIRED_HEADSET: u32 = 0x0004;
    /// Wired headphone, no microphone
    pub const WIRED_HEADPHONE: u32 = 0x0008;
    /// Bluetooth SCO, generic
    pub const BLUETOOTH_SCO: u32 = 0x0010;
    /// Bluetooth SCO headset
    pub const BLUETOOTH_SCO_HEADSET: u32 = 0x0020;
    /// Bluetooth SCO carkit
    pub const BLUETOOTH_SCO_CARKIT: u32 = 0x0040;
    /// S/PDIF digital output
    pub const SPDIF: u32 = 0x0400;
    /// Analog dock
    pub const ANLG_DOCK: u32 = 0x0800;

    /// All Bluetooth SCO bits
    pub const ALL_SCO: u32 = BLUETOOTH_SCO | BLUETOOTH_SCO_HEADSET | BLUETOOTH_SCO_CARKIT;
}

/// Input device bits
pub mod input {
    /// Built-in microphone
    pub const BUILTIN_MIC: u32 = 0x0001;
    /// Bluetooth SCO headset microphone
    pub const BLUETOOTH_SCO_HEADSET: u32 = 0x0002;
    /// Wired headset microphone
    pub const WIRED_HEADSET: u32 = 0x0004;
}

/// A bit-set of logical devices.
///
/// Output masks may carry several bits at once (dual routing); input
/// masks must never have more than one bit set, which routing enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceMask(pub u32);

impl DeviceMask {
    /// The empty mask
    pub const NONE: DeviceMask = DeviceMask(0);

    /// True when no bit is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True when any of `bits` is set
    pub fn intersects(&self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    /// The sub-mask of `bits` that is set
    pub fn masked(&self, bits: u32) -> DeviceMask {
        DeviceMask(self.0 & bits)
    }

    /// True when more than one bit is set
    pub fn has_multiple_bits(&self) -> bool {
        self.0 & self.0.wrapping_sub(1) != 0
    }
}

impl BitOr for DeviceMask {
    type Output = DeviceMask;
    fn bitor(self, rhs: DeviceMask) -> DeviceMask {
        DeviceMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for DeviceMask {
    fn bitor_assign(&mut self, rhs: DeviceMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::LowerHex for DeviceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Resolved physical output path on the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPath {
    /// Loudspeaker / earpiece amplifier
    Speaker,
    /// Wired headset amplifier
    Headset,
    /// Headset and speaker driven together
    HeadsetAndSpeaker,
    /// Analog dock line-out
    AnalogDock,
}

impl OutputPath {
    /// Index into the gain table's path axis
    pub fn gain_index(&self) -> usize {
        match self {
            OutputPath::Speaker => 0,
            OutputPath::Headset => 1,
            OutputPath::HeadsetAndSpeaker => 2,
            OutputPath::AnalogDock => 3,
        }
    }

    /// Acoustic tuning block this path selects in the EC/NS profile
    /// resource. The canceller is tuned per accessory, so an in-call
    /// accessory change reloads the session profile.
    pub fn ecns_mode(&self) -> usize {
        match self {
            OutputPath::Speaker => 0,
            OutputPath::Headset => 1,
            OutputPath::HeadsetAndSpeaker => 2,
            OutputPath::AnalogDock => 3,
        }
    }
}

/// Resolved physical input path on the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPath {
    /// Built-in microphone
    Mic1,
    /// Headset microphone
    Mic2,
}

impl InputPath {
    /// Index into the gain table's path axis
    pub fn gain_index(&self) -> usize {
        match self {
            InputPath::Mic1 => 0,
            InputPath::Mic2 => 1,
        }
    }
}

/// Telephony state of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallMode {
    /// No call activity
    #[default]
    Normal,
    /// Incoming call ringing
    Ringtone,
    /// Circuit-switched call up
    InCall,
    /// VoIP call up
    InCommunication,
}

impl CallMode {
    /// True for the modes in which a voice path is established
    pub fn in_call(&self) -> bool {
        matches!(self, CallMode::InCall | CallMode::InCommunication)
    }
}

/// Capture source requested by the client, used for EC/NS eligibility
/// and gain usecase selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum InputSource {
    /// Unspecified source
    #[default]
    Default = 0,
    /// Plain microphone capture
    Mic = 1,
    /// Two-way voice (VoIP); enables EC/NS when the mode allows it
    VoiceCommunication = 2,
    /// Speech recognition capture
    VoiceRecognition = 3,
}

impl InputSource {
    /// Decode the wire value from the `input_source` parameter
    pub fn from_raw(raw: u8) -> Option<InputSource> {
        match raw {
            0 => Some(InputSource::Default),
            1 => Some(InputSource::Mic),
            2 => Some(InputSource::VoiceCommunication),
            3 => Some(InputSource::VoiceRecognition),
            _ => None,
        }
    }
}

/// Gain/profile selector, independent of the physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usecase {
    /// Media playback
    Media,
    /// Voice call
    Voice,
    /// Voice recognition capture
    VoiceRecognition,
}

impl Usecase {
    /// Index into the gain table's usecase axis
    pub fn gain_index(&self) -> usize {
        match self {
            Usecase::Media => 0,
            Usecase::Voice => 1,
            Usecase::VoiceRecognition => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_bit_detection() {
        assert!(!DeviceMask(0).has_multiple_bits());
        assert!(!DeviceMask(output::SPEAKER).has_multiple_bits());
        assert!(DeviceMask(output::SPEAKER | output::WIRED_HEADSET).has_multiple_bits());
    }

    #[test]
    fn input_source_round_trip() {
        assert_eq!(InputSource::from_raw(2), Some(InputSource::VoiceCommunication));
        assert_eq!(InputSource::from_raw(9), None);
    }
}
