//! RTP payload handling for H.264 and AAC
//!
//! Send side: `H264Packetizer` over an `RtpSocket`. Receive side:
//! `Depacketizer` implementations feeding decode loops.

pub mod aac;
pub mod depacketizer;
pub mod h264_packetizer;
pub mod nal;
pub mod socket;
pub mod statistics;

pub use aac::{AacDepacketizer, AuHeaderFormat};
pub use depacketizer::{parse_packet, Depacketizer, H264Depacketizer};
pub use h264_packetizer::{H264Packetizer, H264Source, PacketizerStats, StreamMode};
pub use socket::{MemoryTransport, RtpSocket, RtpTransport, UdpTransport};
pub use statistics::Statistics;
