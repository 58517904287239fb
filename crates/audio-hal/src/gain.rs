//! Per-path, per-usecase gain table
//!
//! A versioned binary resource loaded once at engine construction:
//! a magic/version header followed by a fixed-size 3-D table of
//! little-endian gain steps indexed by direction, usecase and physical
//! path. A missing, short or wrong-version resource falls back to the
//! built-in defaults; gain is a feature, not a hard dependency.

use std::fs;
use std::path::Path;

use bytes::Buf;
use tracing::{debug, info, warn};

use crate::device::{InputPath, OutputPath, Usecase};
use crate::error::{Error, Result};

/// Resource magic, `b"AGT1"` on the wire
pub const GAIN_TABLE_MAGIC: u32 = u32::from_le_bytes(*b"AGT1");

/// Resource version this build understands
pub const GAIN_TABLE_VERSION: u16 = 1;

/// Directions on the first table axis
pub const DIRECTIONS: usize = 2;
/// Usecases on the second table axis
pub const USECASES: usize = 3;
/// Physical paths on the third table axis
pub const PATHS: usize = 8;

/// Hardware gain register ceiling (0..=15)
pub const MAX_GAIN_STEP: u16 = 15;

/// Audio direction, the first axis of the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Playback (downlink)
    Output = 0,
    /// Capture (uplink)
    Input = 1,
}

/// The 3-D gain table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GainTable {
    steps: [[[u16; PATHS]; USECASES]; DIRECTIONS],
}

impl Default for GainTable {
    /// Built-in defaults: full-scale media playback, slightly padded
    /// voice paths, hot mic for recognition.
    fn default() -> Self {
        let mut steps = [[[0u16; PATHS]; USECASES]; DIRECTIONS];
        steps[Direction::Output as usize] = [
            [15, 13, 14, 13, 0, 0, 0, 0], // media
            [12, 10, 11, 10, 0, 0, 0, 0], // voice
            [12, 10, 11, 10, 0, 0, 0, 0], // voice recognition
        ];
        steps[Direction::Input as usize] = [
            [10, 10, 0, 0, 0, 0, 0, 0], // media
            [11, 9, 0, 0, 0, 0, 0, 0],  // voice
            [14, 12, 0, 0, 0, 0, 0, 0], // voice recognition
        ];
        GainTable { steps }
    }
}

impl GainTable {
    /// Load the table from `path`, falling back to [`GainTable::default`]
    /// on any failure. The fallback is logged, never propagated.
    pub fn load_or_default(path: &Path) -> GainTable {
        match Self::load(path) {
            Ok(table) => {
                info!("loaded gain table from {}", path.display());
                table
            }
            Err(e) => {
                warn!("gain table {} unusable ({}), using defaults", path.display(), e);
                GainTable::default()
            }
        }
    }

    /// Parse the versioned resource at `path`.
    pub fn load(path: &Path) -> Result<GainTable> {
        let raw = fs::read(path)?;
        Self::parse(&raw)
    }

    fn parse(raw: &[u8]) -> Result<GainTable> {
        const BODY: usize = DIRECTIONS * USECASES * PATHS * 2;
        let mut buf = raw;
        if buf.remaining() < 6 {
            return Err(Error::Format("gain table header truncated".into()));
        }
        let magic = buf.get_u32_le();
        if magic != GAIN_TABLE_MAGIC {
            return Err(Error::Format(format!("bad gain table magic {:#x}", magic)));
        }
        let version = buf.get_u16_le();
        if version != GAIN_TABLE_VERSION {
            return Err(Error::Format(format!(
                "gain table version {} (expected {})",
                version, GAIN_TABLE_VERSION
            )));
        }
        if buf.remaining() < BODY {
            return Err(Error::Format(format!(
                "gain table body short: {} of {} bytes",
                buf.remaining(),
                BODY
            )));
        }
        let mut steps = [[[0u16; PATHS]; USECASES]; DIRECTIONS];
        for dir in steps.iter_mut() {
            for usecase in dir.iter_mut() {
                for step in usecase.iter_mut() {
                    *step = buf.get_u16_le();
                }
            }
        }
        debug!("gain table parsed, version {}", version);
        Ok(GainTable { steps })
    }

    fn get(&self, direction: Direction, usecase: Usecase, path_index: usize) -> u16 {
        self.steps[direction as usize][usecase.gain_index()][path_index.min(PATHS - 1)]
            .min(MAX_GAIN_STEP)
    }

    /// Playback gain step for a usecase/path, scaled by master volume.
    pub fn output_step(&self, usecase: Usecase, path: OutputPath, master: f32) -> u16 {
        scale(self.get(Direction::Output, usecase, path.gain_index()), master)
    }

    /// Capture gain step for a usecase/path, scaled by master volume.
    pub fn input_step(&self, usecase: Usecase, path: InputPath, master: f32) -> u16 {
        scale(self.get(Direction::Input, usecase, path.gain_index()), master)
    }
}

fn scale(step: u16, master: f32) -> u16 {
    let clamped = master.clamp(0.0, 1.0);
    (step as f32 * clamped).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_resource(version: u16) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&GAIN_TABLE_MAGIC.to_le_bytes());
        raw.extend_from_slice(&version.to_le_bytes());
        for i in 0..(DIRECTIONS * USECASES * PATHS) {
            raw.extend_from_slice(&((i % 16) as u16).to_le_bytes());
        }
        raw
    }

    #[test]
    fn parses_well_formed_resource() {
        let table = GainTable::parse(&build_resource(GAIN_TABLE_VERSION)).unwrap();
        assert_eq!(table.get(Direction::Output, Usecase::Media, 0), 0);
        assert_eq!(table.get(Direction::Output, Usecase::Media, 3), 3);
    }

    #[test]
    fn rejects_wrong_version() {
        assert!(matches!(
            GainTable::parse(&build_resource(99)),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn rejects_short_read() {
        let mut raw = build_resource(GAIN_TABLE_VERSION);
        raw.truncate(20);
        assert!(matches!(GainTable::parse(&raw), Err(Error::Format(_))));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let table = GainTable::load_or_default(Path::new("/nonexistent/gains.bin"));
        assert_eq!(table, GainTable::default());
    }

    #[test]
    fn master_volume_scales_steps() {
        let table = GainTable::default();
        let full = table.output_step(Usecase::Media, OutputPath::Speaker, 1.0);
        let half = table.output_step(Usecase::Media, OutputPath::Speaker, 0.5);
        let muted = table.output_step(Usecase::Media, OutputPath::Speaker, 0.0);
        assert_eq!(full, 15);
        assert_eq!(half, 8);
        assert_eq!(muted, 0);
        // out-of-range master volume clamps instead of overflowing
        assert_eq!(table.output_step(Usecase::Media, OutputPath::Speaker, 7.0), full);
    }
}
