//! H.264 NAL unit helpers
//!
//! Annex B splitting, NAL header inspection and just enough SPS parsing to
//! learn the coded picture size and the SDP `profile-level-id`.

use base64::Engine;
use bytes::Bytes;

/// 4-byte Annex B start code
pub const ANNEXB_START_CODE: [u8; 4] = [0, 0, 0, 1];

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;
/// Single-time aggregation packet (RFC 3984 5.7.1)
pub const NAL_STAP_A: u8 = 24;
/// Fragmentation unit A (RFC 3984 5.8)
pub const NAL_FU_A: u8 = 28;

/// NAL unit type (low 5 bits of the header byte)
pub fn h264_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|value| value & 0x1f)
}

/// Header byte that cannot start a valid NAL unit: forbidden bit set, or type 0
pub fn is_malformed_header(header: u8) -> bool {
    header & 0x80 != 0 || header & 0x1f == 0
}

/// Parameter sets are configuration, not picture data
pub fn is_parameter_set(nal_type: u8) -> bool {
    nal_type == NAL_SPS || nal_type == NAL_PPS
}

/// Find the next 3- or 4-byte start code at or after `from`.
/// Returns `(offset, start_code_len)`.
pub fn find_annexb_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if from >= data.len() {
        return None;
    }

    let mut i = from;
    while i + 3 <= data.len() {
        if i + 4 <= data.len() && data[i..i + 4] == ANNEXB_START_CODE {
            return Some((i, 4));
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            return Some((i, 3));
        }
        i += 1;
    }

    None
}

/// Split Annex B data into NAL units (start codes and trailing zeros removed)
pub fn split_annexb_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nal_units = Vec::new();
    let mut cursor = 0usize;

    while let Some((start, start_code_len)) = find_annexb_start_code(data, cursor) {
        let nal_start = start + start_code_len;
        if nal_start >= data.len() {
            break;
        }

        let next_start = find_annexb_start_code(data, nal_start)
            .map(|(idx, _)| idx)
            .unwrap_or(data.len());

        let mut nal_end = next_start;
        while nal_end > nal_start && data[nal_end - 1] == 0 {
            nal_end -= 1;
        }

        if nal_end > nal_start {
            nal_units.push(&data[nal_start..nal_end]);
        }

        cursor = next_start;
    }

    nal_units
}

/// Prefix a NAL unit with the 4-byte start code
pub fn to_annexb(nal: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(ANNEXB_START_CODE.len() + nal.len());
    out.extend_from_slice(&ANNEXB_START_CODE);
    out.extend_from_slice(nal);
    Bytes::from(out)
}

/// "PPCCLL" profile-level-id from an SPS NAL unit
pub fn parse_profile_level_id_from_sps(sps: &[u8]) -> Option<String> {
    if sps.len() < 4 {
        return None;
    }
    Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
}

/// Decode the `sprop-parameter-sets` fmtp value into raw NAL units
pub fn decode_sprop_parameter_sets(value: &str) -> Vec<Bytes> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
        .filter(|nal| !nal.is_empty())
        .map(Bytes::from)
        .collect()
}

/// Fields of interest from a sequence parameter set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

struct BitReader {
    data: Vec<u8>,
    pos: usize,
}

impl BitReader {
    /// Strips emulation prevention bytes (00 00 03)
    fn new(rbsp: &[u8]) -> Self {
        let mut data = Vec::with_capacity(rbsp.len());
        let mut zeros = 0;
        for &b in rbsp {
            if zeros >= 2 && b == 3 {
                zeros = 0;
                continue;
            }
            zeros = if b == 0 { zeros + 1 } else { 0 };
            data.push(b);
        }
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn bits(&mut self, n: u32) -> Option<u32> {
        let mut value = 0;
        for _ in 0..n {
            value = (value << 1) | self.bit()?;
        }
        Some(value)
    }

    fn ue(&mut self) -> Option<u32> {
        let mut leading = 0;
        while self.bit()? == 0 {
            leading += 1;
            if leading > 31 {
                return None;
            }
        }
        Some((1u32 << leading) - 1 + self.bits(leading)?)
    }

    fn se(&mut self) -> Option<i32> {
        let k = self.ue()?;
        let magnitude = k.div_ceil(2) as i32;
        Some(if k % 2 == 1 { magnitude } else { -magnitude })
    }
}

const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Parse an SPS NAL unit (header byte included)
pub fn parse_sps(sps: &[u8]) -> Option<SpsInfo> {
    if h264_nal_type(sps)? != NAL_SPS || sps.len() < 4 {
        return None;
    }
    let mut r = BitReader::new(&sps[1..]);

    let profile_idc = r.bits(8)? as u8;
    r.bits(8)?;
    let level_idc = r.bits(8)? as u8;
    r.ue()?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if HIGH_PROFILES.contains(&profile_idc) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.bit()? == 1;
        }
        r.ue()?;
        r.ue()?;
        r.bit()?;
        if r.bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.ue()?;
    match r.ue()? {
        0 => {
            r.ue()?;
        }
        1 => {
            r.bit()?;
            r.se()?;
            r.se()?;
            for _ in 0..r.ue()? {
                r.se()?;
            }
        }
        _ => {}
    }

    r.ue()?;
    r.bit()?;
    let width_mbs = r.ue()? + 1;
    let height_map_units = r.ue()? + 1;
    let frame_mbs_only = r.bit()?;
    if frame_mbs_only == 0 {
        r.bit()?;
    }
    r.bit()?;

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.bit()? == 1 {
        crop_left = r.ue()?;
        crop_right = r.ue()?;
        crop_top = r.ue()?;
        crop_bottom = r.ue()?;
    }

    let (crop_unit_x, crop_unit_y) = if chroma_format_idc == 0 || separate_colour_plane {
        (1, 2 - frame_mbs_only)
    } else {
        let sub_width = if chroma_format_idc == 3 { 1 } else { 2 };
        let sub_height = if chroma_format_idc == 1 { 2 } else { 1 };
        (sub_width, sub_height * (2 - frame_mbs_only))
    };

    let width = (width_mbs * 16).checked_sub((crop_left + crop_right) * crop_unit_x)?;
    let height = ((2 - frame_mbs_only) * height_map_units * 16)
        .checked_sub((crop_top + crop_bottom) * crop_unit_y)?;

    Some(SpsInfo {
        profile_idc,
        level_idc,
        width,
        height,
    })
}

fn skip_scaling_list(r: &mut BitReader, size: usize) -> Option<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            next = (last + r.se()? + 256) % 256;
        }
        last = if next == 0 { last } else { next };
    }
    Some(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Exp-Golomb writer used to build SPS fixtures
    #[derive(Default)]
    pub(crate) struct BitWriter {
        bits: Vec<u8>,
    }

    impl BitWriter {
        pub(crate) fn bits(&mut self, value: u32, n: u32) -> &mut Self {
            for i in (0..n).rev() {
                self.bits.push(((value >> i) & 1) as u8);
            }
            self
        }

        pub(crate) fn ue(&mut self, value: u32) -> &mut Self {
            let v = value + 1;
            let len = 32 - v.leading_zeros();
            self.bits(0, len - 1).bits(v, len)
        }

        pub(crate) fn finish(&mut self) -> Vec<u8> {
            self.bits.push(1);
            while self.bits.len() % 8 != 0 {
                self.bits.push(0);
            }
            self.bits
                .chunks(8)
                .map(|c| c.iter().fold(0u8, |acc, b| (acc << 1) | b))
                .collect()
        }
    }

    /// Baseline SPS for `width_mbs x height_mbs` with optional bottom crop
    pub(crate) fn baseline_sps(width_mbs: u32, height_mbs: u32, crop_bottom: u32) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.bits(66, 8).bits(0xc0, 8).bits(31, 8).ue(0);
        w.ue(0).ue(2);
        w.ue(1).bits(0, 1);
        w.ue(width_mbs - 1).ue(height_mbs - 1);
        w.bits(1, 1).bits(1, 1);
        if crop_bottom > 0 {
            w.bits(1, 1).ue(0).ue(0).ue(0).ue(crop_bottom);
        } else {
            w.bits(0, 1);
        }
        w.bits(0, 1);
        let mut nal = vec![0x67];
        nal.extend(w.finish());
        nal
    }

    #[test]
    fn splits_mixed_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88];
        let nals = split_annexb_nal_units(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0], &[0x67, 0x42]);
        assert_eq!(nals[1], &[0x68, 0xce]);
        assert_eq!(h264_nal_type(nals[2]), Some(NAL_IDR));
    }

    #[test]
    fn no_start_code_yields_nothing() {
        assert!(split_annexb_nal_units(&[0x65, 0x88, 0x84]).is_empty());
        assert_eq!(find_annexb_start_code(&[0x65, 0, 0], 0), None);
    }

    #[test]
    fn malformed_headers() {
        assert!(is_malformed_header(0x80 | 0x05));
        assert!(is_malformed_header(0x60));
        assert!(!is_malformed_header(0x65));
        assert!(!is_malformed_header(0x41));
    }

    #[test]
    fn parses_720p_sps() {
        let sps = baseline_sps(80, 45, 0);
        let info = parse_sps(&sps).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert_eq!(info.profile_idc, 66);
        assert_eq!(parse_profile_level_id_from_sps(&sps).unwrap(), "42c01f");
    }

    #[test]
    fn parses_cropped_1080p_sps() {
        let info = parse_sps(&baseline_sps(120, 68, 4)).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn emulation_prevention_is_removed() {
        let mut r = BitReader::new(&[0x00, 0x00, 0x03, 0x01]);
        assert_eq!(r.bits(24), Some(1));
    }

    #[test]
    fn sprop_parameter_sets_decode() {
        let nals = decode_sprop_parameter_sets("Z0LAHw==,aM4G4g==");
        assert_eq!(nals.len(), 2);
        assert_eq!(h264_nal_type(&nals[0]), Some(NAL_SPS));
        assert_eq!(&nals[1][..], &[0x68, 0xce, 0x06, 0xe2]);
    }
}
