//! Key-value parameter codec
//!
//! The framework configures the HAL through `key=value;key=value`
//! strings. Recognized keys are consumed as they are applied; anything
//! left over makes the call report a bad-value condition without
//! undoing the keys that were applied.

use tracing::warn;

/// Well-known parameter keys
pub mod keys {
    /// Output/input device mask, decimal or hex integer
    pub const ROUTING: &str = "routing";
    /// Capture source enum, see [`crate::device::InputSource`]
    pub const INPUT_SOURCE: &str = "input_source";
    /// Bluetooth headset noise-reduction/echo-cancellation toggle
    pub const BT_NREC: &str = "bt_headset_nrec";
    /// Bluetooth accessory name for acoustic-profile lookup
    pub const BT_NAME: &str = "bt_headset_name";
}

/// A parsed parameter list
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    pairs: Vec<(String, String)>,
}

impl Parameters {
    /// Parse a `key=value;key=value` string; pairs without `=` are dropped
    /// with a warning.
    pub fn parse(s: &str) -> Parameters {
        let mut pairs = Vec::new();
        for piece in s.split(';') {
            if piece.is_empty() {
                continue;
            }
            match piece.split_once('=') {
                Some((k, v)) => pairs.push((k.to_string(), v.to_string())),
                None => warn!("dropping malformed parameter {:?}", piece),
            }
        }
        Parameters { pairs }
    }

    /// Look up a key without consuming it
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up a key as an integer (decimal, or hex with `0x` prefix)
    pub fn get_int(&self, key: &str) -> Option<u32> {
        let v = self.get(key)?;
        if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).ok()
        } else {
            v.parse().ok()
        }
    }

    /// Consume a key, returning its value
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.pairs.iter().position(|(k, _)| k == key)?;
        Some(self.pairs.remove(idx).1)
    }

    /// Add or replace a pair
    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.remove(key);
        self.pairs.push((key.to_string(), value.to_string()));
    }

    /// Number of unconsumed pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when every pair has been consumed
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Serialize back to the wire form
    pub fn to_string(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";")
    }
}
