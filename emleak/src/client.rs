//! Operator side of the wire protocol.

use crate::request::WireRequest;
use std::io;
use std::net::{ SocketAddr, ToSocketAddrs, UdpSocket };
use std::time::Duration;

/// Sends requests to a target and waits for the echo.
pub struct TargetClient {
    sock: UdpSocket,
    target: SocketAddr,
}

impl TargetClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn connect(target: impl ToSocketAddrs, timeout: Duration) -> io::Result<Self> {
        let target = target.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no address for target")
        })?;
        let local = if target.is_ipv4() {
            SocketAddr::from(([0u8; 4], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let sock = UdpSocket::bind(local)?;
        sock.set_read_timeout(Some(timeout))?;
        sock.connect(target)?;
        Ok(Self { sock, target })
    }

    pub fn target(&self) -> SocketAddr { self.target }

    /// Send raw bytes and return the reply.
    pub fn send_raw(&self, buf: &[u8]) -> io::Result<Vec<u8>> {
        self.sock.send(buf)?;
        let mut rbuf = [0u8; 256];
        let len = self.sock.recv(&mut rbuf)?;
        Ok(rbuf[..len].to_vec())
    }

    /// Send a request and check that the reply is an exact echo.
    pub fn send<R: WireRequest>(&self, req: &R) -> io::Result<()> {
        let buf = req.encode();
        let reply = self.send_raw(&buf)?;
        if reply != buf {
            return Err(io::Error::new(io::ErrorKind::InvalidData,
                format!("reply {:02x?} doesn't match request {:02x?}", reply, buf)));
        }
        Ok(())
    }
}
