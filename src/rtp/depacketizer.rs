//! H.264 RTP depacketizer
//!
//! Turns RTP payloads back into Annex B framed NAL units. Packets are
//! processed in arrival order; there is no jitter buffer, so a sequence gap
//! inside a FU-A run throws away the partial unit.

use bytes::{BufMut, Bytes, BytesMut};
use rtp::packet::Packet;
use tracing::{debug, trace};
use webrtc::util::Unmarshal;

use super::nal::{to_annexb, NAL_FU_A, NAL_IDR, NAL_STAP_A};
use crate::error::{PipelineError, Result};
use crate::video::Frame;

/// 90 kHz RTP clock to microseconds
pub fn rtp_timestamp_to_us(timestamp: u32, clock_rate: u32) -> i64 {
    timestamp as i64 * 1_000_000 / clock_rate.max(1) as i64
}

/// Payload format decoder feeding a decode loop
pub trait Depacketizer: Send {
    /// Consume one packet, returning every access unit it completes
    fn depacketize(&mut self, packet: &Packet) -> Vec<Frame>;
}

/// Parse a raw RTP datagram
pub fn parse_packet(datagram: &[u8]) -> Result<Packet> {
    let mut buf = Bytes::copy_from_slice(datagram);
    Packet::unmarshal(&mut buf).map_err(|e| PipelineError::Rtsp(format!("bad RTP packet: {}", e)))
}

struct FuState {
    nal: BytesMut,
    timestamp: u32,
    next_seq: u16,
}

/// RFC 3984 depacketizer: single NAL, STAP-A and FU-A
#[derive(Default)]
pub struct H264Depacketizer {
    fu: Option<FuState>,
    discarded: u64,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partial FU-A units thrown away so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn emit(nal: &[u8], timestamp: u32, out: &mut Vec<Frame>) {
        let Some(&header) = nal.first() else {
            return;
        };
        let nal_type = header & 0x1f;
        out.push(
            Frame::new(to_annexb(nal), rtp_timestamp_to_us(timestamp, 90_000))
                .with_config(matches!(nal_type, 7 | 8))
                .with_key_frame(nal_type == NAL_IDR),
        );
    }

    fn discard_fu(&mut self, reason: &str) {
        if self.fu.take().is_some() {
            self.discarded += 1;
            debug!("Discarding partial FU-A unit: {}", reason);
        }
    }

    fn stap_a(payload: &[u8], timestamp: u32, out: &mut Vec<Frame>) {
        let mut rest = &payload[1..];
        while rest.len() >= 2 {
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            rest = &rest[2..];
            if len == 0 || len > rest.len() {
                debug!("Truncated STAP-A aggregate ({} > {})", len, rest.len());
                return;
            }
            Self::emit(&rest[..len], timestamp, out);
            rest = &rest[len..];
        }
    }

    fn fu_a(&mut self, payload: &[u8], seq: u16, timestamp: u32, out: &mut Vec<Frame>) {
        if payload.len() < 2 {
            return;
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;

        if start {
            self.discard_fu("new start fragment");
            let mut nal = BytesMut::with_capacity(payload.len() * 4);
            nal.put_u8((indicator & 0xe0) | (fu_header & 0x1f));
            nal.put_slice(&payload[2..]);
            self.fu = Some(FuState {
                nal,
                timestamp,
                next_seq: seq.wrapping_add(1),
            });
        } else {
            match self.fu.as_mut() {
                Some(state) if state.next_seq == seq && state.timestamp == timestamp => {
                    state.nal.put_slice(&payload[2..]);
                    state.next_seq = seq.wrapping_add(1);
                }
                Some(state) => {
                    let expected = state.next_seq;
                    self.discard_fu(&format!("expected seq {}, got {}", expected, seq));
                    return;
                }
                None => {
                    trace!("FU-A continuation without start, seq {}", seq);
                    return;
                }
            }
        }

        if end {
            if let Some(state) = self.fu.take() {
                Self::emit(&state.nal, state.timestamp, out);
            }
        }
    }
}

impl Depacketizer for H264Depacketizer {
    fn depacketize(&mut self, packet: &Packet) -> Vec<Frame> {
        let payload = &packet.payload[..];
        let mut out = Vec::new();
        let Some(&header) = payload.first() else {
            return out;
        };
        let seq = packet.header.sequence_number;
        let timestamp = packet.header.timestamp;

        match header & 0x1f {
            1..=23 => {
                self.discard_fu("single NAL interrupts fragment run");
                Self::emit(payload, timestamp, &mut out);
            }
            NAL_STAP_A => {
                self.discard_fu("STAP-A interrupts fragment run");
                Self::stap_a(payload, timestamp, &mut out);
            }
            NAL_FU_A => self.fu_a(payload, seq, timestamp, &mut out),
            other => trace!("Ignoring unsupported NAL type {}", other),
        }
        out
    }
}
