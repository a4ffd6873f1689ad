//! Decoder capability traits and the factory registry
//!
//! A `Decoder` is a codec with input and output buffer queues, modelled on
//! hardware codec APIs: compressed frames go in, decoded buffers come out and
//! must be handed back with `release_output`. `DecodeLoop` drives one decoder
//! on its own thread.

pub mod decode_loop;
pub mod passthrough;

pub use decode_loop::{DecodeLoop, DecodeLoopOptions, DecodeState, ErrorCallback};
pub use passthrough::{
    AacPassthroughDecoder, AacPassthroughFactory, H264PassthroughDecoder, H264PassthroughFactory,
};

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::rtp::Depacketizer;
use crate::rtsp::sdp::{MediaDescription, MediaKind};
use crate::video::Frame;

/// Handle to a decoder-owned output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(pub u64);

/// A decoded buffer, valid until released
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub id: OutputId,
    pub data: Bytes,
    pub pts_us: i64,
}

/// Result of polling a decoder's output queue
#[derive(Debug)]
pub enum DecoderOutput {
    Frame(DecodedFrame),
    FormatChanged { width: u32, height: u32 },
    TryAgainLater,
}

/// Codec backend
pub trait Decoder: Send {
    fn name(&self) -> &str;

    /// Apply codec configuration (SPS/PPS, AudioSpecificConfig)
    fn configure(&mut self, config: &Frame) -> Result<()>;

    fn queue_input(&mut self, frame: Frame) -> Result<()>;

    /// Poll for the next output event without blocking
    fn dequeue_output(&mut self) -> Result<DecoderOutput>;

    /// Hand a buffer from `DecoderOutput::Frame` back to the codec
    fn release_output(&mut self, id: OutputId);
}

/// Receives decoded output on the decode thread
pub trait FrameConsumer: Send {
    fn on_size_changed(&mut self, _width: u32, _height: u32) {}

    /// An error ends the decode loop
    fn on_frame(&mut self, frame: &DecodedFrame) -> Result<()>;
}

/// Everything needed to decode one negotiated track
pub struct TrackDecoder {
    pub decoder: Box<dyn Decoder>,
    pub depacketizer: Box<dyn Depacketizer>,
    /// Configuration from the SDP, queued before any payload
    pub initial_config: Option<Frame>,
}

/// Creates decoders for one encoding name
pub trait DecoderFactory: Send + Sync {
    /// Encoding name, matched case-insensitively against `a=rtpmap`
    fn encoding(&self) -> &str;

    fn media_kind(&self) -> MediaKind;

    fn create(&self, media: &MediaDescription) -> Result<TrackDecoder>;
}

/// Decoder factories keyed by lowercase encoding name
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    factories: HashMap<String, Arc<dyn DecoderFactory>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the passthrough H.264 and AAC backends
    pub fn with_passthrough() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(H264PassthroughFactory));
        registry.register(Arc::new(AacPassthroughFactory));
        registry
    }

    /// Register a factory, replacing any previous one for the same encoding
    pub fn register(&mut self, factory: Arc<dyn DecoderFactory>) {
        let key = factory.encoding().to_ascii_lowercase();
        debug!("Registered decoder factory for '{}'", key);
        self.factories.insert(key, factory);
    }

    /// Factory for a track, if its encoding and media kind are supported
    pub fn find(&self, media: &MediaDescription) -> Option<Arc<dyn DecoderFactory>> {
        self.factories
            .get(&media.encoding_key())
            .filter(|factory| factory.media_kind() == media.kind)
            .cloned()
    }

    pub fn encodings(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
