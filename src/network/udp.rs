//! UDP socket construction
//!
//! All sockets in this crate are built here so the tuning lives in one
//! place: SO_REUSEADDR for quick restarts, enlarged kernel buffers on the
//! audio paths, and bounded read timeouts so blocking receive loops can
//! observe shutdown.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::NetworkError;

/// Send buffer for the fan-out socket (one datagram per listener per frame)
pub const STREAM_SEND_BUFFER: usize = 1 << 20;

/// Receive buffer for the receiver's ingest socket
pub const STREAM_RECV_BUFFER: usize = 512 * 1024;

/// Receive buffer for control sockets
pub const CONTROL_RECV_BUFFER: usize = 256 * 1024;

/// Read timeout that doubles as the shutdown poll interval
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Socket tuning knobs
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    pub recv_buffer: Option<usize>,
    pub send_buffer: Option<usize>,
    pub read_timeout: Option<Duration>,
    pub reuse_address: bool,
    pub broadcast: bool,
}

/// Create and bind a UDP socket with the given options.
pub fn create_socket(addr: SocketAddr, options: &SocketOptions) -> Result<UdpSocket, NetworkError> {
    let inner = || -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if options.reuse_address {
            socket.set_reuse_address(true)?;
        }
        if let Some(size) = options.recv_buffer {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = options.send_buffer {
            socket.set_send_buffer_size(size)?;
        }
        if options.broadcast {
            socket.set_broadcast(true)?;
        }
        socket.bind(&addr.into())?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(options.read_timeout)?;
        Ok(socket)
    };
    inner().map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))
}

/// Unbound-port socket for the sender's fan-out path.
pub fn stream_sender_socket() -> Result<UdpSocket, NetworkError> {
    create_socket(
        (Ipv4Addr::UNSPECIFIED, 0).into(),
        &SocketOptions {
            send_buffer: Some(STREAM_SEND_BUFFER),
            ..Default::default()
        },
    )
}

/// Ingest socket on the stream port.
pub fn stream_receiver_socket(port: u16) -> Result<UdpSocket, NetworkError> {
    create_socket(
        (Ipv4Addr::UNSPECIFIED, port).into(),
        &SocketOptions {
            recv_buffer: Some(STREAM_RECV_BUFFER),
            read_timeout: Some(READ_TIMEOUT),
            reuse_address: true,
            ..Default::default()
        },
    )
}

/// Control socket on the given port with the given poll interval.
pub fn control_socket(port: u16, read_timeout: Duration) -> Result<UdpSocket, NetworkError> {
    control_socket_on(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), port, read_timeout)
}

/// Control socket bound to one specific address.
pub fn control_socket_on(
    ip: std::net::IpAddr,
    port: u16,
    read_timeout: Duration,
) -> Result<UdpSocket, NetworkError> {
    create_socket(
        (ip, port).into(),
        &SocketOptions {
            recv_buffer: Some(CONTROL_RECV_BUFFER),
            read_timeout: Some(read_timeout),
            reuse_address: true,
            ..Default::default()
        },
    )
}

/// Short-lived socket for one-shot control sends.
pub fn ephemeral_socket() -> Result<UdpSocket, NetworkError> {
    create_socket(
        (Ipv4Addr::UNSPECIFIED, 0).into(),
        &SocketOptions::default(),
    )
}

/// Broadcast-capable socket for discovery probes and replies.
pub fn broadcast_socket(port: u16, read_timeout: Duration) -> Result<UdpSocket, NetworkError> {
    create_socket(
        (Ipv4Addr::UNSPECIFIED, port).into(),
        &SocketOptions {
            read_timeout: Some(read_timeout),
            reuse_address: true,
            broadcast: true,
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_socket_binds() {
        let socket = ephemeral_socket().unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_receiver_socket_has_read_timeout() {
        let socket = stream_receiver_socket(0).unwrap();
        assert_eq!(socket.read_timeout().unwrap(), Some(READ_TIMEOUT));
    }

    #[test]
    fn test_broadcast_socket_flag() {
        let socket = broadcast_socket(0, Duration::from_millis(100)).unwrap();
        assert!(socket.broadcast().unwrap());
    }
}
