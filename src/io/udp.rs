//! UDP socket transport.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use super::Transport;
use crate::messages::MAX_MESSAGE_SIZE;

/// How long a receive call blocks before giving the caller a chance to stop.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug)]
/// [Transport] over a std [UdpSocket].
pub struct UdpTransport {
    socket: UdpSocket,
    local_address: SocketAddr,
}

impl UdpTransport {
    pub fn bind(address: SocketAddr) -> std::io::Result<UdpTransport> {
        let socket = UdpSocket::bind(address)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let local_address = socket.local_addr()?;

        Ok(UdpTransport {
            socket,
            local_address,
        })
    }

    /// Receives one datagram, `Ok(None)` if nothing arrived within [READ_TIMEOUT].
    pub fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// A buffer large enough for any message.
    pub fn buffer() -> Vec<u8> {
        vec![0; MAX_MESSAGE_SIZE]
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, to: SocketAddr, bytes: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(bytes, to).map(|_| ())
    }

    fn local_address(&self) -> SocketAddr {
        self.local_address
    }
}
