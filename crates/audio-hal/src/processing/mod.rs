//! Signal processing for the stream paths
//!
//! Rate conversion, channel conversion and the echo-cancellation /
//! noise-suppression engine that cross-synchronizes the playback and
//! capture paths.

pub mod channels;
pub mod handoff;
pub mod postproc;
pub mod resampler;

pub use handoff::DownlinkMailbox;
pub use postproc::{
    EcnsAlgorithm, EcnsFactory, EcnsProfile, MediaEffect, PassthroughEcns, PassthroughFactory,
    PostProcessor,
};
pub use resampler::Resampler;
