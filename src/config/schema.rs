use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::video::Rotation;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamCoreConfig {
    pub broadcaster: BroadcasterConfig,
    pub packetizer: PacketizerConfig,
    pub rtsp: RtspConfig,
    pub mjpeg: MjpegConfig,
}

/// Surface broadcaster settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Render context width
    pub width: u32,
    /// Render context height
    pub height: u32,
    /// Rotation applied to every sink
    pub rotation: Rotation,
    /// Wait bound for a new source image in milliseconds (0 = no timeout)
    pub timeout_ms: u64,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            rotation: Rotation::Deg0,
            timeout_ms: 10_000,
        }
    }
}

/// RTP packetizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketizerConfig {
    /// Largest datagram handed to the transport, RTP header included
    pub max_packet_size: usize,
    /// Dynamic RTP payload type
    pub payload_type: u8,
    /// Fixed SSRC; random when unset
    pub ssrc: Option<u32>,
    /// Encoder output queue depth (frames)
    pub queue_capacity: usize,
    /// SO_SNDBUF override for the UDP socket
    pub send_buffer: Option<usize>,
    /// Samples kept by the inter-arrival average (muxed sources)
    pub stats_window: usize,
    /// Fastest picture rate of a muxed source that reads faster than real
    /// time; 0 paces by read time alone
    pub frame_rate: u32,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1300,
            payload_type: 96,
            ssrc: None,
            queue_capacity: 30,
            send_buffer: None,
            stats_window: 50,
            frame_rate: 30,
        }
    }
}

/// RTSP client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    /// Reconnect attempts after a 5xx response
    pub max_retries: u32,
    /// Base reconnect delay; attempt N waits N times this
    pub retry_backoff_ms: u64,
    /// TCP connect and per-request response timeout
    pub connect_timeout_ms: u64,
    /// Per-track decoder input queue depth (access units)
    pub queue_capacity: usize,
    pub user_agent: String,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 500,
            connect_timeout_ms: 10_000,
            queue_capacity: 64,
            user_agent: format!("stream-core/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// MJPEG push server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MjpegConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Stream path, without the leading slash
    pub path: String,
    /// Multipart boundary token
    pub boundary: String,
    /// Value of the `Server` response header
    pub server_name: String,
    /// Frames buffered per client before it is dropped
    pub client_queue_depth: usize,
    /// Frame rate of the directory encoder used by the CLI
    pub fps: u32,
}

impl Default for MjpegConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 20000,
            path: "mjpeg".to_string(),
            boundary: "frame".to_string(),
            server_name: "MJPEG".to_string(),
            client_queue_depth: 8,
            fps: 15,
        }
    }
}
