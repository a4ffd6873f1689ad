//! RTP packet emission
//!
//! `RtpSocket` owns the RTP header state (SSRC, sequence, payload type) and
//! hands marshaled datagrams to an `RtpTransport`.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use rtp::header::Header;
use rtp::packet::Packet;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use webrtc::util::Marshal;

use crate::error::{PipelineError, Result};
use crate::utils::bind_rtp_socket;

/// RTP fixed header length without CSRCs or extensions
pub const RTP_HEADER_LEN: usize = 12;

/// Default dynamic payload type for H.264
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// Where marshaled RTP datagrams go
pub trait RtpTransport: Send {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()>;
}

/// Unicast UDP transport
pub struct UdpTransport {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl UdpTransport {
    /// Bind an ephemeral local port of the destination's address family
    pub fn connect(dest: SocketAddr, send_buffer: Option<usize>) -> io::Result<Self> {
        let local: SocketAddr = if dest.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = bind_rtp_socket(local, send_buffer)?;
        debug!(
            "RTP UDP transport {} -> {}",
            socket.local_addr()?,
            dest
        );
        Ok(Self { socket, dest })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl RtpTransport for UdpTransport {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.dest)?;
        Ok(())
    }
}

/// Collects datagrams in memory; clones share the same buffer
#[derive(Clone, Default)]
pub struct MemoryTransport {
    datagrams: Arc<Mutex<Vec<Bytes>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn datagrams(&self) -> Vec<Bytes> {
        self.datagrams.lock().clone()
    }

    /// Unmarshal every collected datagram
    pub fn packets(&self) -> Vec<Packet> {
        use webrtc::util::Unmarshal;
        self.datagrams
            .lock()
            .iter()
            .filter_map(|d| Packet::unmarshal(&mut d.clone()).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.datagrams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.lock().is_empty()
    }
}

impl RtpTransport for MemoryTransport {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.datagrams.lock().push(Bytes::copy_from_slice(datagram));
        Ok(())
    }
}

/// Sent packet/byte counters
#[derive(Debug, Default)]
pub struct RtpCounters {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
}

/// RTP header state plus a transport
pub struct RtpSocket {
    transport: Box<dyn RtpTransport>,
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    counters: Arc<RtpCounters>,
}

impl RtpSocket {
    /// Random SSRC unless one is given; the initial sequence number is
    /// always random.
    pub fn new(
        transport: Box<dyn RtpTransport>,
        payload_type: u8,
        ssrc: Option<u32>,
    ) -> Result<Self> {
        if payload_type > 127 {
            return Err(PipelineError::Config(format!(
                "RTP payload type out of range: {}",
                payload_type
            )));
        }
        let mut rng = rand::rng();
        Ok(Self {
            transport,
            payload_type,
            ssrc: ssrc.unwrap_or_else(|| rng.random()),
            sequence_number: rng.random(),
            counters: Arc::new(RtpCounters::default()),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Sequence number of the next packet
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn counters(&self) -> Arc<RtpCounters> {
        self.counters.clone()
    }

    /// Send one RTP packet carrying `payload`
    pub fn send(&mut self, payload: Bytes, timestamp: u32, marker: bool) -> Result<()> {
        let packet = Packet {
            header: Header {
                version: 2,
                padding: false,
                extension: false,
                marker,
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload,
        };

        let marshaled = packet
            .marshal()
            .map_err(|e| PipelineError::Rtsp(format!("RTP marshal failed: {}", e)))?;
        self.transport.send(&marshaled)?;

        trace!(
            seq = self.sequence_number,
            ts = timestamp,
            marker,
            len = marshaled.len(),
            "RTP packet sent"
        );
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.counters.packets.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(marshaled.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_and_wrapping_sequence() {
        let transport = MemoryTransport::new();
        let mut socket = RtpSocket::new(Box::new(transport.clone()), 96, Some(0xdead_beef)).unwrap();
        socket.sequence_number = u16::MAX;

        socket
            .send(Bytes::from_static(&[0x65, 1, 2]), 9000, true)
            .unwrap();
        socket.send(Bytes::from_static(&[0x41]), 9000, false).unwrap();

        let packets = transport.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].header.version, 2);
        assert_eq!(packets[0].header.ssrc, 0xdead_beef);
        assert_eq!(packets[0].header.payload_type, 96);
        assert!(packets[0].header.marker);
        assert_eq!(packets[0].header.sequence_number, u16::MAX);
        assert_eq!(packets[1].header.sequence_number, 0);
        assert_eq!(&packets[0].payload[..], &[0x65, 1, 2]);

        let counters = socket.counters();
        assert_eq!(counters.packets.load(Ordering::Relaxed), 2);
        assert_eq!(
            counters.bytes.load(Ordering::Relaxed),
            (2 * RTP_HEADER_LEN + 4) as u64
        );
    }

    #[test]
    fn rejects_out_of_range_payload_type() {
        assert!(RtpSocket::new(Box::new(MemoryTransport::new()), 128, None).is_err());
    }

    #[test]
    fn udp_transport_delivers() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut transport = UdpTransport::connect(receiver.local_addr().unwrap(), None).unwrap();
        transport.send(&[1, 2, 3]).unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }
}
