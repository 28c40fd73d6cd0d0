//! Receive side: per-participant jitter buffers and the playback tick

pub mod registry;
pub mod scheduler;

pub use registry::{PlaybackStreamRegistry, RegistryStats, StreamRequest};
pub use scheduler::{PlaybackScheduler, TickReport};
