//! HAL configuration
//!
//! Resource paths, buffer sizing and the bounded-wait tuning for the
//! EC/NS rendezvous. Everything has a sensible default for the target
//! device; tests override the resource paths with fixtures.

use std::path::PathBuf;
use std::time::Duration;

/// Playback hardware rate in Hz; the codec DAC path always runs here
/// unless a call scenario forces it down to the EC/NS rate.
pub const OUTPUT_RATE: u32 = 44100;

/// Bluetooth SCO links are fixed at 8 kHz.
pub const BLUETOOTH_SCO_RATE: u32 = 8000;

/// Default capture rate in Hz when the client does not ask for one.
pub const DEFAULT_INPUT_RATE: u32 = 11025;

/// Capture rates the ADC path supports; requests snap to the closest.
pub const INPUT_RATES: [u32; 5] = [8000, 11025, 16000, 22050, 44100];

/// Playback device buffer size in bytes (driver wants 32-bit alignment).
pub const OUTPUT_BUFFER_SIZE: usize = 4096;

/// Capture device buffer size in bytes.
pub const INPUT_BUFFER_SIZE: usize = 4096;

/// HAL-wide configuration
#[derive(Debug, Clone)]
pub struct HalConfig {
    /// Versioned binary gain table, loaded once at engine construction
    pub gain_table_path: PathBuf,

    /// Versioned EC/NS coefficient resource, loaded lazily per session
    pub ecns_profile_path: PathBuf,

    /// Bound on the downlink producer's wait for the uplink consumer;
    /// on expiry the producer logs and proceeds so playback never
    /// deadlocks on a stalled capture path
    pub downlink_wait: Duration,

    /// Sleep-and-retry interval for the uplink consumer waiting on
    /// downlink data before padding with silence
    pub uplink_retry: Duration,

    /// Retries before the uplink consumer pads with silence
    pub uplink_retries: u32,
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            gain_table_path: PathBuf::from("/system/etc/audio_gain_table.bin"),
            ecns_profile_path: PathBuf::from("/system/etc/voip_gain_profiles.bin"),
            downlink_wait: Duration::from_secs(1),
            uplink_retry: Duration::from_millis(10),
            uplink_retries: 2,
        }
    }
}

/// Snap a requested capture rate to the closest rate the ADC supports.
pub fn nearest_input_rate(requested: u32) -> u32 {
    let mut best = INPUT_RATES[0];
    let mut best_delta = u32::MAX;
    for &rate in &INPUT_RATES {
        let delta = rate.abs_diff(requested);
        if delta < best_delta {
            best = rate;
            best_delta = delta;
        }
    }
    best
}
