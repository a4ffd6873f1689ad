//! MJPEG push streaming
//!
//! `MjpegHub` tracks connected clients and owns the lazily created JPEG
//! encoder; `MjpegPushServer` exposes it over HTTP as
//! `multipart/x-mixed-replace`.

pub mod directory;
pub mod mjpeg;
pub mod mjpeg_server;

pub use directory::DirectoryEncoder;
pub use mjpeg::{create_mjpeg_part, ClientGuard, JpegEncoder, JpegSink, MjpegCallback, MjpegHub};
pub use mjpeg_server::MjpegPushServer;
