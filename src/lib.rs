//! stream-core - media pipeline building blocks
//!
//! Frame queues and surface broadcasting, RTP packetization and
//! depacketization, an RTSP playback session with decode loops, and an
//! MJPEG push server.

pub mod config;
pub mod decoder;
pub mod error;
pub mod events;
pub mod rtp;
pub mod rtsp;
pub mod stream;
pub mod utils;
pub mod video;

pub use error::{PipelineError, Result};
