//! RTSP playback: wire client, SDP model and the session that owns decode loops

pub mod client;
pub mod sdp;
pub mod session;

pub use client::{RtspConnection, RtspResponse, RtspUrl};
pub use sdp::{parse_sdp, MediaDescription, MediaKind, SessionDescription};
pub use session::{ConsumerFactory, RtspSession, SessionErrorCallback, SessionState};
