//! Playback and capture stream objects
//!
//! The streams own the data-plane pipelines: per-write sink fan-out,
//! rate conversion and the EC/NS hooks. Routing decisions are made by
//! the [`AudioEngine`](crate::engine::AudioEngine); the streams receive
//! them as asynchronous flag stores and apply them on their next
//! read/write so routing never blocks on another thread's device I/O.

pub mod input;
pub mod output;

pub use input::{FrameLossCounter, InputState, InputStream};
pub use output::OutputStream;

/// Playback lifecycle state.
///
/// Routing changes park a configured stream back in `ConfigRequested`;
/// the next write reopens the sink set before emitting data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum StreamState {
    /// Standby, nothing open
    Idle = 0,
    /// Online requested, sink set not yet applied
    ConfigRequested = 1,
    /// Sinks open and routed
    Configured = 2,
}

impl StreamState {
    pub(crate) fn from_u8(raw: u8) -> StreamState {
        match raw {
            2 => StreamState::Configured,
            1 => StreamState::ConfigRequested,
            _ => StreamState::Idle,
        }
    }
}
