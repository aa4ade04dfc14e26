//! Request/reply channel.

use crate::error::*;
use std::io;
use std::net::{ Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket };

/// Receives requests and sends a reply to whoever sent the last one.
pub trait Transport {
    /// Block until a request arrives, returning its length.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send `buf` back to the sender of the most recent request.
    fn reply(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// A blocking UDP socket.
pub struct UdpTransport {
    sock: UdpSocket,
    peer: Option<SocketAddr>,
}

impl UdpTransport {
    /// Bind to `port` on all interfaces.
    pub fn bind(port: u16) -> TargetResult<Self> {
        Self::bind_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
    }

    pub fn bind_addr(addr: SocketAddr) -> TargetResult<Self> {
        let sock = UdpSocket::bind(addr)
            .map_err(|source| TargetError::SocketBind { addr, source })?;
        Ok(Self { sock, peer: None })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn peer(&self) -> Option<SocketAddr> { self.peer }
}

impl Transport for UdpTransport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (len, peer) = self.sock.recv_from(buf)?;
        self.peer = Some(peer);
        Ok(len)
    }

    fn reply(&mut self, buf: &[u8]) -> io::Result<()> {
        let peer = self.peer.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no request received yet")
        })?;
        let sent = self.sock.send_to(buf, peer)?;
        if sent != buf.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero,
                format!("short send ({} of {} bytes)", sent, buf.len())));
        }
        Ok(())
    }
}
