//! Service discovery
//!
//! Receivers find the sender without typing an address. The sender
//! advertises its service name and stream port; a receiver resolves the
//! first advertiser whose name matches a prefix.
//!
//! The beacon protocol is two datagram shapes on the discovery port
//! (base + 2), tagged with magic 0xAB:
//!
//! ```text
//! probe:    [0xAB][0x01]
//! announce: [0xAB][0x02][2B stream port BE][2B name len BE][name utf8]
//! ```
//!
//! Probes go to the limited broadcast address and to loopback, so
//! same-host setups resolve too.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{NetworkError, Result};
use crate::network::udp;

/// First byte of every discovery datagram
pub const DISCOVERY_MAGIC: u8 = 0xAB;

const KIND_PROBE: u8 = 0x01;
const KIND_ANNOUNCE: u8 = 0x02;

/// Poll interval of the advertiser loop
const ADVERTISE_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Finds peers by service name.
pub trait Discovery: Send {
    /// Start answering probes, advertising the given stream port.
    fn advertise(&mut self, stream_port: u16) -> Result<()>;

    /// Stop answering probes. Idempotent.
    fn unadvertise(&mut self);

    /// Probe for an advertiser whose service name starts with `prefix`.
    /// Returns the first match within the timeout.
    fn resolve_one(&self, prefix: &str, timeout: Duration) -> Result<Option<(IpAddr, u16)>>;
}

/// Discovery over UDP broadcast.
pub struct BroadcastDiscovery {
    service_name: String,
    discovery_port: u16,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl BroadcastDiscovery {
    pub fn new(service_name: &str, discovery_port: u16) -> Self {
        Self {
            service_name: service_name.to_string(),
            discovery_port,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }
}

impl Discovery for BroadcastDiscovery {
    fn advertise(&mut self, stream_port: u16) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let socket = udp::broadcast_socket(self.discovery_port, ADVERTISE_READ_TIMEOUT)?;
        let announce = encode_announce(stream_port, &self.service_name);

        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("discovery".into())
            .spawn(move || {
                let mut buf = [0u8; 512];
                while running.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, src)) => {
                            if is_probe(&buf[..len]) {
                                if let Err(e) = socket.send_to(&announce, src) {
                                    tracing::debug!(src = %src, "announce failed: {}", e);
                                }
                            }
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            tracing::warn!("discovery receive failed: {}", e);
                        }
                    }
                }
            })
            .map_err(|e| NetworkError::DiscoveryFailed(e.to_string()))?;

        self.thread_handle = Some(handle);
        tracing::info!(
            port = self.discovery_port,
            service = %self.service_name,
            "advertising"
        );
        Ok(())
    }

    fn unadvertise(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn resolve_one(&self, prefix: &str, timeout: Duration) -> Result<Option<(IpAddr, u16)>> {
        let socket = udp::broadcast_socket(0, Duration::from_millis(200))?;
        let probe = [DISCOVERY_MAGIC, KIND_PROBE];
        let targets: [SocketAddr; 2] = [
            (Ipv4Addr::BROADCAST, self.discovery_port).into(),
            (Ipv4Addr::LOCALHOST, self.discovery_port).into(),
        ];
        for target in targets {
            if let Err(e) = socket.send_to(&probe, target) {
                tracing::debug!(target = %target, "probe failed: {}", e);
            }
        }

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 512];
        while Instant::now() < deadline {
            match socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    if let Some((port, name)) = parse_announce(&buf[..len]) {
                        if name.starts_with(prefix) {
                            tracing::info!(service = %name, ip = %src.ip(), port, "resolved");
                            return Ok(Some((src.ip(), port)));
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string()).into()),
            }
        }
        Ok(None)
    }
}

impl Drop for BroadcastDiscovery {
    fn drop(&mut self) {
        self.unadvertise();
    }
}

fn is_probe(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == DISCOVERY_MAGIC && buf[1] == KIND_PROBE
}

fn encode_announce(stream_port: u16, name: &str) -> Bytes {
    let name_bytes = name.as_bytes();
    let mut buf = BytesMut::with_capacity(6 + name_bytes.len());
    buf.put_u8(DISCOVERY_MAGIC);
    buf.put_u8(KIND_ANNOUNCE);
    buf.put_u16(stream_port);
    buf.put_u16(name_bytes.len() as u16);
    buf.put_slice(name_bytes);
    buf.freeze()
}

fn parse_announce(buf: &[u8]) -> Option<(u16, String)> {
    if buf.len() < 6 || buf[0] != DISCOVERY_MAGIC || buf[1] != KIND_ANNOUNCE {
        return None;
    }
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let name_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let name = buf.get(6..6 + name_len)?;
    Some((port, String::from_utf8_lossy(name).into_owned()))
}
