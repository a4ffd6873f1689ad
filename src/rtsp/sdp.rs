//! SDP to media descriptions
//!
//! Parsing is done by `sdp-types`; this module only pulls out what track
//! setup needs: payload type, encoding, clock, control URL and fmtp.

use sdp_types as sdp;
use serde::Serialize;
use std::fmt;

use crate::error::{PipelineError, Result};

/// Kind of elementary stream a track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// One `m=` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub kind: MediaKind,
    pub payload_type: u8,
    /// Encoding name as announced in `a=rtpmap` (e.g. "H264")
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u32>,
    /// `a=control` value
    pub control: Option<String>,
    /// `a=fmtp` parameters in announcement order
    pub fmtp: Vec<(String, String)>,
}

impl MediaDescription {
    /// Lowercase encoding name, the decoder registry key
    pub fn encoding_key(&self) -> String {
        self.encoding.to_ascii_lowercase()
    }

    /// Case-insensitive fmtp lookup
    pub fn fmtp_param(&self, name: &str) -> Option<&str> {
        self.fmtp
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// URL to address this track's SETUP to
    pub fn control_url(&self, base: &str) -> String {
        resolve_control(base, self.control.as_deref())
    }
}

/// Parsed session description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDescription {
    /// Session-level `a=control`
    pub control: Option<String>,
    /// Audio and video sections; other media types are dropped
    pub medias: Vec<MediaDescription>,
}

fn attribute<'a>(attributes: &'a [sdp::Attribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|attr| attr.attribute.eq_ignore_ascii_case(name))
        .and_then(|attr| attr.value.as_deref())
}

/// Parse `a=rtpmap:<pt> <encoding>/<clock>[/<channels>]`
fn parse_rtpmap(value: &str) -> Option<(u8, String, u32, Option<u32>)> {
    let (pt, rest) = value.trim().split_once(' ')?;
    let mut parts = rest.trim().split('/');
    let encoding = parts.next()?.to_string();
    let clock_rate = parts.next()?.parse().ok()?;
    let channels = parts.next().and_then(|c| c.parse().ok());
    Some((pt.parse().ok()?, encoding, clock_rate, channels))
}

/// Parse `a=fmtp:<pt> key=value;key=value`
fn parse_fmtp(value: &str) -> Vec<(String, String)> {
    let params = value
        .trim()
        .split_once(' ')
        .map(|(_, params)| params)
        .unwrap_or("");
    params
        .split(';')
        .filter_map(|param| {
            let (key, value) = param.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Static payload types that carry no rtpmap
fn static_payload(pt: u8) -> Option<(&'static str, u32, Option<u32>)> {
    match pt {
        0 => Some(("PCMU", 8000, Some(1))),
        8 => Some(("PCMA", 8000, Some(1))),
        26 => Some(("JPEG", 90000, None)),
        33 => Some(("MP2T", 90000, None)),
        _ => None,
    }
}

fn media_description(media: &sdp::Media) -> Option<MediaDescription> {
    let kind = match media.media.as_str() {
        "video" => MediaKind::Video,
        "audio" => MediaKind::Audio,
        _ => return None,
    };
    // First format only; multi-format sections are rare from RTSP servers
    let payload_type: u8 = media.fmt.split_whitespace().next()?.parse().ok()?;

    let rtpmap = media
        .attributes
        .iter()
        .filter(|attr| attr.attribute.eq_ignore_ascii_case("rtpmap"))
        .filter_map(|attr| attr.value.as_deref().and_then(parse_rtpmap))
        .find(|(pt, ..)| *pt == payload_type);

    let (encoding, clock_rate, channels) = match rtpmap {
        Some((_, encoding, clock_rate, channels)) => (encoding, clock_rate, channels),
        None => {
            let (encoding, clock_rate, channels) = static_payload(payload_type)?;
            (encoding.to_string(), clock_rate, channels)
        }
    };

    let fmtp = media
        .attributes
        .iter()
        .filter(|attr| attr.attribute.eq_ignore_ascii_case("fmtp"))
        .filter_map(|attr| attr.value.as_deref())
        .find(|value| {
            value
                .split_whitespace()
                .next()
                .and_then(|pt| pt.parse::<u8>().ok())
                == Some(payload_type)
        })
        .map(parse_fmtp)
        .unwrap_or_default();

    Some(MediaDescription {
        kind,
        payload_type,
        encoding,
        clock_rate,
        channels,
        control: attribute(&media.attributes, "control").map(str::to_string),
        fmtp,
    })
}

/// Parse an SDP body
pub fn parse_sdp(body: &[u8]) -> Result<SessionDescription> {
    let session =
        sdp::Session::parse(body).map_err(|e| PipelineError::Sdp(format!("{:?}", e)))?;

    Ok(SessionDescription {
        control: attribute(&session.attributes, "control").map(str::to_string),
        medias: session.medias.iter().filter_map(media_description).collect(),
    })
}

/// Resolve an `a=control` value against the presentation base URL
pub fn resolve_control(base: &str, control: Option<&str>) -> String {
    match control {
        None | Some("*") | Some("") => base.to_string(),
        Some(control) if control.to_ascii_lowercase().starts_with("rtsp://") => {
            control.to_string()
        }
        Some(control) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            control.trim_start_matches('/')
        ),
    }
}
