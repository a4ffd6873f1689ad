//! mpeg4-generic (RFC 3640, AAC-hbr) depacketizer

use bytes::Bytes;
use rtp::packet::Packet;
use tracing::debug;

use super::depacketizer::{rtp_timestamp_to_us, Depacketizer};
use crate::video::Frame;

/// AU header layout from the SDP fmtp line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuHeaderFormat {
    pub size_length: u32,
    pub index_length: u32,
    pub index_delta_length: u32,
}

impl Default for AuHeaderFormat {
    /// AAC-hbr
    fn default() -> Self {
        Self {
            size_length: 13,
            index_length: 3,
            index_delta_length: 3,
        }
    }
}

impl AuHeaderFormat {
    /// Read `sizelength`/`indexlength`/`indexdeltalength` from fmtp parameters
    pub fn from_fmtp(params: &[(String, String)]) -> Self {
        let mut format = Self::default();
        for (key, value) in params {
            let Ok(value) = value.parse::<u32>() else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "sizelength" => format.size_length = value,
                "indexlength" => format.index_length = value,
                "indexdeltalength" => format.index_delta_length = value,
                _ => {}
            }
        }
        format
    }
}

/// Decode the hex `config=` fmtp value (AudioSpecificConfig)
pub fn parse_audio_specific_config(hex: &str) -> Option<Bytes> {
    let hex = hex.trim();
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()
        .map(Bytes::from)
}

/// Splits RFC 3640 payloads into raw AAC access units
pub struct AacDepacketizer {
    format: AuHeaderFormat,
    clock_rate: u32,
}

impl AacDepacketizer {
    pub fn new(format: AuHeaderFormat, clock_rate: u32) -> Self {
        Self { format, clock_rate }
    }
}

fn read_bits(data: &[u8], bit_pos: usize, count: u32) -> Option<u32> {
    let mut value = 0u32;
    for i in 0..count as usize {
        let pos = bit_pos + i;
        let byte = *data.get(pos / 8)?;
        value = (value << 1) | ((byte >> (7 - pos % 8)) & 1) as u32;
    }
    Some(value)
}

impl Depacketizer for AacDepacketizer {
    fn depacketize(&mut self, packet: &Packet) -> Vec<Frame> {
        let payload = &packet.payload[..];
        let mut out = Vec::new();
        if payload.len() < 2 || self.format.size_length == 0 {
            return out;
        }

        let headers_bits = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let headers_bytes = headers_bits.div_ceil(8);
        let headers = &payload[2..];
        if headers.len() < headers_bytes {
            debug!("AU headers exceed payload ({} bits)", headers_bits);
            return out;
        }

        let mut sizes = Vec::new();
        let mut bit = 0usize;
        let mut first = true;
        while bit < headers_bits {
            let index_bits = if first {
                self.format.index_length
            } else {
                self.format.index_delta_length
            };
            let Some(size) = read_bits(headers, bit, self.format.size_length) else {
                break;
            };
            bit += (self.format.size_length + index_bits) as usize;
            sizes.push(size as usize);
            first = false;
        }

        let mut data = &headers[headers_bytes..];
        let base_pts = rtp_timestamp_to_us(packet.header.timestamp, self.clock_rate);
        // 1024 samples per AAC frame
        let frame_us = 1024 * 1_000_000 / self.clock_rate.max(1) as i64;
        for (i, size) in sizes.into_iter().enumerate() {
            if size > data.len() {
                debug!("AU truncated ({} > {} bytes)", size, data.len());
                break;
            }
            out.push(Frame::new(
                Bytes::copy_from_slice(&data[..size]),
                base_pts + i as i64 * frame_us,
            ));
            data = &data[size..];
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp::header::Header;

    fn au_header(size: u16) -> [u8; 2] {
        (size << 3).to_be_bytes()
    }

    #[test]
    fn splits_access_units() {
        let mut payload = vec![0x00, 0x20];
        payload.extend(au_header(3));
        payload.extend(au_header(2));
        payload.extend([1, 2, 3, 4, 5]);

        let packet = Packet {
            header: Header {
                timestamp: 44_100,
                ..Default::default()
            },
            payload: Bytes::from(payload),
        };
        let mut d = AacDepacketizer::new(AuHeaderFormat::default(), 44_100);
        let frames = d.depacketize(&packet);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data(), &[1, 2, 3]);
        assert_eq!(frames[1].data(), &[4, 5]);
        assert_eq!(frames[0].pts_us, 1_000_000);
        assert!(frames[1].pts_us > frames[0].pts_us);
    }

    #[test]
    fn fmtp_overrides_and_config() {
        let params = vec![
            ("sizelength".to_string(), "6".to_string()),
            ("IndexLength".to_string(), "2".to_string()),
        ];
        let format = AuHeaderFormat::from_fmtp(&params);
        assert_eq!(format.size_length, 6);
        assert_eq!(format.index_length, 2);
        assert_eq!(format.index_delta_length, 3);

        assert_eq!(
            parse_audio_specific_config("1210").unwrap().as_ref(),
            &[0x12, 0x10]
        );
        assert!(parse_audio_specific_config("121").is_none());
    }
}
