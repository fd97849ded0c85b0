//! Receiver-side control plane
//!
//! Receivers announce themselves with Hello, leave with Goodbye, and keep
//! their registry entry fresh by answering the sender's Pings. The
//! [`KeepAlive`] responder also re-sends Hello periodically so a restarted
//! sender re-learns its listeners without user action.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{NetworkError, Result};
use crate::network::udp;
use crate::protocol::ControlPacket;

/// Poll interval of the keep-alive receive loop
const KEEPALIVE_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Announce this receiver to a sender. One ephemeral-socket datagram.
pub fn send_hello(sender_ip: IpAddr, base_port: u16, name: &str) -> Result<()> {
    let socket = udp::ephemeral_socket()?;
    let packet = ControlPacket::Hello {
        name: name.to_string(),
    }
    .encode();
    socket
        .send_to(&packet, (sender_ip, base_port + 1))
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Tell a sender this receiver is leaving. One ephemeral-socket datagram.
pub fn send_goodbye(sender_ip: IpAddr, base_port: u16) -> Result<()> {
    let socket = udp::ephemeral_socket()?;
    socket
        .send_to(&ControlPacket::Goodbye.encode(), (sender_ip, base_port + 1))
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Answers Pings with Pongs and refreshes the Hello announcement.
pub struct KeepAlive {
    sender_ip: IpAddr,
    base_port: u16,
    name: String,
    hello_interval: Duration,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn new(sender_ip: IpAddr, base_port: u16, name: &str, hello_interval: Duration) -> Self {
        Self {
            sender_ip,
            base_port,
            name: name.to_string(),
            hello_interval,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Bind the control port and start answering. No-op when running.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let control_port = self.base_port + 1;
        let socket = udp::control_socket(control_port, KEEPALIVE_READ_TIMEOUT)?;

        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        let sender_ip = self.sender_ip;
        let base_port = self.base_port;
        let name = self.name.clone();
        let hello_interval = self.hello_interval;

        let handle = thread::Builder::new()
            .name("keep-alive".into())
            .spawn(move || {
                let mut buf = [0u8; 256];
                let mut last_hello = Instant::now();
                while running.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, src)) => {
                            if let Some((reply, dest)) =
                                handle_datagram(&buf[..len], src, control_port)
                            {
                                if let Err(e) = socket.send_to(&reply, dest) {
                                    tracing::debug!(dest = %dest, "pong send failed: {}", e);
                                }
                            }
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            tracing::warn!("keep-alive receive failed: {}", e);
                        }
                    }

                    if last_hello.elapsed() >= hello_interval {
                        if let Err(e) = send_hello(sender_ip, base_port, &name) {
                            tracing::debug!("periodic hello failed: {}", e);
                        }
                        last_hello = Instant::now();
                    }
                }
            })
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        self.thread_handle = Some(handle);
        tracing::info!(port = control_port, "keep-alive responder started");
        Ok(())
    }

    /// Stop answering. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decide the reply for one control datagram arriving at a receiver.
///
/// Pings are answered with a Pong echoing the timestamp verbatim, sent to
/// the pinger's ip at the control port (the sender listens there, whatever
/// source port its ping left from). Everything else is ignored.
fn handle_datagram(
    buf: &[u8],
    src: SocketAddr,
    control_port: u16,
) -> Option<(Bytes, SocketAddr)> {
    match ControlPacket::decode(buf) {
        Ok(ControlPacket::Ping { echo_millis }) => {
            let reply = ControlPacket::Pong { echo_millis }.encode();
            Some((reply, SocketAddr::new(src.ip(), control_port)))
        }
        Ok(_) => None,
        Err(e) => {
            tracing::trace!(src = %src, "ignoring control datagram: {}", e);
            None
        }
    }
}
