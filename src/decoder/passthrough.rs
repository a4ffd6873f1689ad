//! Passthrough decoder backends
//!
//! These do not decode pixels or samples. They re-emit the compressed stream
//! in a self-contained framing (Annex B for H.264, ADTS for AAC) so a track can
//! be recorded or piped to an external player, and they exercise the same
//! buffer ownership rules a hardware codec would.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

use super::{
    DecodedFrame, Decoder, DecoderFactory, DecoderOutput, OutputId, TrackDecoder,
};
use crate::error::{PipelineError, Result};
use crate::rtp::aac::parse_audio_specific_config;
use crate::rtp::nal::{decode_sprop_parameter_sets, parse_sps, split_annexb_nal_units, to_annexb};
use crate::rtp::{AacDepacketizer, AuHeaderFormat, H264Depacketizer};
use crate::rtsp::sdp::{MediaDescription, MediaKind};
use crate::video::Frame;

/// Output buffer bookkeeping shared by both backends
#[derive(Default)]
struct OutputQueue {
    pending: VecDeque<DecoderOutput>,
    outstanding: HashSet<OutputId>,
    next_id: u64,
}

impl OutputQueue {
    fn push_frame(&mut self, data: Bytes, pts_us: i64) {
        self.next_id += 1;
        self.pending.push_back(DecoderOutput::Frame(DecodedFrame {
            id: OutputId(self.next_id),
            data,
            pts_us,
        }));
    }

    fn dequeue(&mut self) -> DecoderOutput {
        match self.pending.pop_front() {
            Some(DecoderOutput::Frame(frame)) => {
                self.outstanding.insert(frame.id);
                DecoderOutput::Frame(frame)
            }
            Some(other) => other,
            None => DecoderOutput::TryAgainLater,
        }
    }

    fn release(&mut self, id: OutputId) {
        if !self.outstanding.remove(&id) {
            warn!("Release of unknown output buffer {:?}", id);
        }
    }
}

/// H.264 passthrough: Annex B access units in, Annex B out
#[derive(Default)]
pub struct H264PassthroughDecoder {
    output: OutputQueue,
    size: Option<(u32, u32)>,
}

impl H264PassthroughDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers handed out and not yet released
    pub fn outstanding(&self) -> usize {
        self.output.outstanding.len()
    }
}

impl Decoder for H264PassthroughDecoder {
    fn name(&self) -> &str {
        "h264-passthrough"
    }

    fn configure(&mut self, config: &Frame) -> Result<()> {
        let nals = split_annexb_nal_units(config.data());
        if nals.is_empty() {
            return Err(PipelineError::Decoder(
                "H.264 config frame holds no NAL units".to_string(),
            ));
        }

        if let Some(info) = nals.iter().find_map(|nal| parse_sps(nal)) {
            if self.size != Some((info.width, info.height)) {
                debug!(
                    "SPS profile {} level {}: {}x{}",
                    info.profile_idc, info.level_idc, info.width, info.height
                );
                self.size = Some((info.width, info.height));
                self.output.pending.push_back(DecoderOutput::FormatChanged {
                    width: info.width,
                    height: info.height,
                });
            }
        }

        // Parameter sets stay in the output so the stream remains decodable
        self.output.push_frame(config.data_bytes(), config.pts_us);
        Ok(())
    }

    fn queue_input(&mut self, frame: Frame) -> Result<()> {
        let pts_us = frame.pts_us;
        self.output.push_frame(frame.into_data(), pts_us);
        Ok(())
    }

    fn dequeue_output(&mut self) -> Result<DecoderOutput> {
        Ok(self.output.dequeue())
    }

    fn release_output(&mut self, id: OutputId) {
        self.output.release(id);
    }
}

/// Fields of a two-byte AudioSpecificConfig needed for ADTS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
    pub object_type: u8,
    pub frequency_index: u8,
    pub channels: u8,
}

impl AacConfig {
    pub fn parse(asc: &[u8]) -> Option<Self> {
        if asc.len() < 2 {
            return None;
        }
        let object_type = asc[0] >> 3;
        let frequency_index = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
        let channels = (asc[1] >> 3) & 0x0f;
        // ADTS has 2 profile bits and no escape for explicit frequencies
        if !(1..=4).contains(&object_type) || frequency_index > 12 {
            return None;
        }
        Some(Self {
            object_type,
            frequency_index,
            channels,
        })
    }

    /// 7-byte ADTS header (no CRC) for an access unit of `payload_len` bytes
    pub fn adts_header(&self, payload_len: usize) -> [u8; 7] {
        let frame_len = payload_len + 7;
        let profile = self.object_type - 1;
        [
            0xff,
            0xf1,
            (profile << 6) | (self.frequency_index << 2) | (self.channels >> 2),
            ((self.channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03),
            (frame_len >> 3) as u8,
            (((frame_len & 0x07) as u8) << 5) | 0x1f,
            0xfc,
        ]
    }
}

/// AAC passthrough: raw access units in, ADTS frames out
#[derive(Default)]
pub struct AacPassthroughDecoder {
    output: OutputQueue,
    config: Option<AacConfig>,
}

impl AacPassthroughDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding(&self) -> usize {
        self.output.outstanding.len()
    }
}

/// ADTS frame length is a 13-bit field
const ADTS_MAX_FRAME: usize = 0x1fff;

impl Decoder for AacPassthroughDecoder {
    fn name(&self) -> &str {
        "aac-passthrough"
    }

    fn configure(&mut self, config: &Frame) -> Result<()> {
        let parsed = AacConfig::parse(config.data()).ok_or_else(|| {
            PipelineError::Decoder(format!(
                "unsupported AudioSpecificConfig {:02x?}",
                config.data()
            ))
        })?;
        debug!("AAC config: {:?}", parsed);
        self.config = Some(parsed);
        Ok(())
    }

    fn queue_input(&mut self, frame: Frame) -> Result<()> {
        let config = self
            .config
            .ok_or_else(|| PipelineError::Decoder("AAC decoder not configured".to_string()))?;
        if frame.len() + 7 > ADTS_MAX_FRAME {
            return Err(PipelineError::Decoder(format!(
                "AAC access unit too large for ADTS ({} bytes)",
                frame.len()
            )));
        }

        let mut out = BytesMut::with_capacity(frame.len() + 7);
        out.put_slice(&config.adts_header(frame.len()));
        out.put_slice(frame.data());
        self.output.push_frame(out.freeze(), frame.pts_us);
        Ok(())
    }

    fn dequeue_output(&mut self) -> Result<DecoderOutput> {
        Ok(self.output.dequeue())
    }

    fn release_output(&mut self, id: OutputId) {
        self.output.release(id);
    }
}

/// H.264 tracks; seeds configuration from `sprop-parameter-sets`
pub struct H264PassthroughFactory;

impl DecoderFactory for H264PassthroughFactory {
    fn encoding(&self) -> &str {
        "H264"
    }

    fn media_kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn create(&self, media: &MediaDescription) -> Result<TrackDecoder> {
        let initial_config = media
            .fmtp_param("sprop-parameter-sets")
            .map(decode_sprop_parameter_sets)
            .filter(|sets| !sets.is_empty())
            .map(|sets| {
                let mut annexb = BytesMut::new();
                for nal in sets {
                    annexb.put_slice(&to_annexb(&nal));
                }
                Frame::config(annexb.freeze())
            });

        Ok(TrackDecoder {
            decoder: Box::new(H264PassthroughDecoder::new()),
            depacketizer: Box::new(H264Depacketizer::new()),
            initial_config,
        })
    }
}

/// AAC-hbr tracks; seeds configuration from the `config` fmtp parameter
pub struct AacPassthroughFactory;

impl DecoderFactory for AacPassthroughFactory {
    fn encoding(&self) -> &str {
        "mpeg4-generic"
    }

    fn media_kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn create(&self, media: &MediaDescription) -> Result<TrackDecoder> {
        let initial_config = media
            .fmtp_param("config")
            .and_then(parse_audio_specific_config)
            .map(Frame::config);

        Ok(TrackDecoder {
            decoder: Box::new(AacPassthroughDecoder::new()),
            depacketizer: Box::new(AacDepacketizer::new(
                AuHeaderFormat::from_fmtp(&media.fmtp),
                media.clock_rate,
            )),
            initial_config,
        })
    }
}
