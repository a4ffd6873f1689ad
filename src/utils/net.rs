//! Socket helpers for RTP output.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use nix::sys::socket::{
    self, sockopt, AddressFamily, SockFlag, SockProtocol, SockType, SockaddrIn, SockaddrIn6,
};

fn socket_addr_family(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

/// Bind a blocking UDP socket for RTP transmission.
///
/// `send_buffer` sizes `SO_SNDBUF`; the packetizer derives it from the
/// average frame interval so a burst of FU-A fragments fits in the kernel
/// queue.
pub fn bind_rtp_socket(local: SocketAddr, send_buffer: Option<usize>) -> io::Result<UdpSocket> {
    let domain = socket_addr_family(&local);
    let fd = socket::socket(
        domain,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Udp,
    )
    .map_err(io::Error::from)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;

    if let Some(size) = send_buffer {
        socket::setsockopt(&fd, sockopt::SndBuf, &size).map_err(io::Error::from)?;
    }

    if matches!(local, SocketAddr::V6(_)) {
        socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(io::Error::from)?;
    }

    match local {
        SocketAddr::V4(v4) => {
            let sockaddr = SockaddrIn::from(v4);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)?;
        }
        SocketAddr::V6(v6) => {
            let sockaddr = SockaddrIn6::from(v6);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)?;
        }
    }

    Ok(unsafe { UdpSocket::from_raw_fd(fd.into_raw_fd()) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port_with_send_buffer() {
        let socket = bind_rtp_socket("127.0.0.1:0".parse().unwrap(), Some(64 * 1024)).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
