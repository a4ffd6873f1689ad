//! Pipeline event types

use serde::{Deserialize, Serialize};

/// Pipeline event, serialized as `{"event": "...", "data": {...}}`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PipelineEvent {
    // ============================================================================
    // RTSP session
    // ============================================================================
    /// Session moved to a new state
    #[serde(rename = "session.state_changed")]
    SessionStateChanged {
        url: String,
        /// "disconnected", "connecting", "negotiated", "streaming", "failed"
        state: String,
    },

    /// Reconnect scheduled after a server error
    #[serde(rename = "session.reconnecting")]
    SessionReconnecting {
        url: String,
        attempt: u32,
        delay_ms: u64,
    },

    /// A track was set up and has a decode loop
    #[serde(rename = "session.track_negotiated")]
    TrackNegotiated {
        /// "video" or "audio"
        media: String,
        encoding: String,
        /// Interleaved RTP channel
        channel: u8,
    },

    // ============================================================================
    // Decode / packetize
    // ============================================================================
    #[serde(rename = "decoder.size_changed")]
    DecoderSizeChanged {
        encoding: String,
        width: u32,
        height: u32,
    },

    /// Packetizer thread exited
    #[serde(rename = "packetizer.stopped")]
    PacketizerStopped {
        packets_sent: u64,
        /// None for a clean end of stream or stop request
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ============================================================================
    // MJPEG server
    // ============================================================================
    #[serde(rename = "mjpeg.client_connected")]
    MjpegClientConnected { peer: String, clients: usize },

    #[serde(rename = "mjpeg.client_disconnected")]
    MjpegClientDisconnected { peer: String, clients: usize },

    /// Client removed because it fell behind
    #[serde(rename = "mjpeg.client_dropped")]
    MjpegClientDropped { peer: String },

    #[serde(rename = "mjpeg.encoder_created")]
    EncoderCreated,

    #[serde(rename = "mjpeg.encoder_released")]
    EncoderReleased,

    // ============================================================================
    // Errors
    // ============================================================================
    /// Fatal error in a pipeline component
    #[serde(rename = "component.error")]
    ComponentError { component: String, message: String },
}

impl PipelineEvent {
    /// Event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SessionStateChanged { .. } => "session.state_changed",
            Self::SessionReconnecting { .. } => "session.reconnecting",
            Self::TrackNegotiated { .. } => "session.track_negotiated",
            Self::DecoderSizeChanged { .. } => "decoder.size_changed",
            Self::PacketizerStopped { .. } => "packetizer.stopped",
            Self::MjpegClientConnected { .. } => "mjpeg.client_connected",
            Self::MjpegClientDisconnected { .. } => "mjpeg.client_disconnected",
            Self::MjpegClientDropped { .. } => "mjpeg.client_dropped",
            Self::EncoderCreated => "mjpeg.encoder_created",
            Self::EncoderReleased => "mjpeg.encoder_released",
            Self::ComponentError { .. } => "component.error",
        }
    }

    pub fn component_error(component: &str, message: impl Into<String>) -> Self {
        Self::ComponentError {
            component: component.to_string(),
            message: message.into(),
        }
    }
}
