//! Sender pipeline
//!
//! Captures, encodes, and fans audio out to every enabled listener, while
//! servicing the control port. Three worker threads run for the life of
//! the pipeline:
//!
//! - `sender-control`: receives Hello/Goodbye/Pong and keeps the
//!   [`ListenerRegistry`] current
//! - `sender-keepalive`: pings every known listener so round-trip times
//!   stay fresh and silent peers age out
//! - `sender-encode`: reads PCM chunks, encodes, and sends one stream
//!   packet per encoded frame to each enabled listener
//!
//! The pipeline is one-shot: once stopped it cannot be started again.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::audio::CaptureSource;
use crate::clock::now_millis;
use crate::codec::AudioEncoder;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::events::SenderObserver;
use crate::network::udp;
use crate::protocol::{ControlPacket, StreamPacket};
use crate::registry::ListenerRegistry;

/// How long control reads block before re-checking the running flag
const CONTROL_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Keep-alive loop granularity
const KEEPALIVE_TICK: Duration = Duration::from_millis(100);

/// Stale listeners are swept at most this often
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Capture chunks between level callbacks
const LEVEL_EVERY_N_CHUNKS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct Counters {
    frames_encoded: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time snapshot of the sender counters
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderStats {
    pub frames_encoded: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
}

/// Live capture/encode/fan-out pipeline.
pub struct SenderPipeline {
    config: AppConfig,
    registry: Arc<ListenerRegistry>,
    observer: Arc<dyn SenderObserver>,
    running: Arc<AtomicBool>,
    state: Mutex<PipelineState>,
    threads: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl SenderPipeline {
    pub fn new(config: AppConfig, observer: Arc<dyn SenderObserver>) -> Self {
        Self {
            config,
            registry: Arc::new(ListenerRegistry::new()),
            observer,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(PipelineState::Idle),
            threads: Vec::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Opens the sockets and spawns the worker threads.
    ///
    /// Fails when the control port is taken, and when called more than
    /// once: a stopped pipeline stays stopped.
    pub fn start(
        &mut self,
        mut capture: Box<dyn CaptureSource>,
        mut encoder: Box<dyn AudioEncoder>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PipelineState::Idle => *state = PipelineState::Running,
                PipelineState::Running => {
                    return Err(Error::Pipeline("sender already running".into()))
                }
                PipelineState::Stopped => {
                    return Err(Error::Pipeline(
                        "sender cannot be restarted after stop".into(),
                    ))
                }
            }
        }

        let stream_port = self.config.stream_port();
        let control_port = self.config.control_port();
        let stream_socket = udp::stream_sender_socket()?;
        let control_socket = Arc::new(udp::control_socket(control_port, CONTROL_READ_TIMEOUT)?);

        self.running.store(true, Ordering::SeqCst);

        // control: keep the registry current
        let handle = {
            let running = self.running.clone();
            let registry = self.registry.clone();
            let observer = self.observer.clone();
            let socket = control_socket.clone();
            spawn_worker("sender-control", move || {
                let mut buf = [0u8; 2048];
                while running.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, src)) => handle_control(
                            &registry,
                            observer.as_ref(),
                            &buf[..len],
                            src,
                            now_millis(),
                            stream_port,
                        ),
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            tracing::warn!("control receive failed: {}", e);
                        }
                    }
                }
            })?
        };
        self.threads.push(handle);

        // keep-alive: ping every known listener on a fixed cadence
        let handle = {
            let running = self.running.clone();
            let registry = self.registry.clone();
            let socket = control_socket;
            let interval = Duration::from_secs(self.config.net.keep_alive_secs);
            spawn_worker("sender-keepalive", move || {
                let mut last_ping: Option<Instant> = None;
                while running.load(Ordering::Relaxed) {
                    if last_ping.map_or(true, |at| at.elapsed() >= interval) {
                        last_ping = Some(Instant::now());
                        let ping = ControlPacket::Ping {
                            echo_millis: now_millis(),
                        }
                        .encode();
                        for info in registry.snapshot() {
                            let dest = SocketAddr::new(info.addr.ip(), control_port);
                            if let Err(e) = socket.send_to(&ping, dest) {
                                tracing::debug!(dest = %dest, "ping failed: {}", e);
                            }
                        }
                    }
                    thread::sleep(KEEPALIVE_TICK);
                }
            })?
        };
        self.threads.push(handle);

        // encode and fan out
        let handle = {
            let running = self.running.clone();
            let registry = self.registry.clone();
            let observer = self.observer.clone();
            let counters = self.counters.clone();
            let frame_len = encoder.frame_len();
            let stale_ms = self.config.net.stale_secs as i64 * 1000;
            spawn_worker("sender-encode", move || {
                encode_loop(
                    &running,
                    &registry,
                    observer.as_ref(),
                    &counters,
                    capture.as_mut(),
                    encoder.as_mut(),
                    &stream_socket,
                    frame_len,
                    stale_ms,
                );
            })?
        };
        self.threads.push(handle);

        tracing::info!(
            stream_port,
            control_port,
            "sender pipeline started"
        );
        Ok(())
    }

    /// Registry of every listener heard from, shared with the control
    /// thread.
    pub fn registry(&self) -> Arc<ListenerRegistry> {
        self.registry.clone()
    }

    /// Mutes or unmutes one listener without removing it.
    /// Returns false when the address is unknown.
    pub fn set_listener_enabled(&self, addr: SocketAddr, enabled: bool) -> bool {
        let known = self.registry.set_enabled(addr, enabled);
        if known {
            tracing::info!(addr = %addr, enabled, "listener toggled");
            self.observer.registry_changed(&self.registry.snapshot());
        }
        known
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            frames_encoded: self.counters.frames_encoded.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
        }
    }

    /// Stops the worker threads and releases the sockets. Idempotent.
    pub fn stop(&mut self) {
        {
            let mut state = self.state.lock();
            if *state == PipelineState::Stopped {
                return;
            }
            *state = PipelineState::Stopped;
        }
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("sender pipeline stopped");
    }
}

impl Drop for SenderPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(
    name: &str,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|e| Error::Pipeline(format!("failed to spawn {}: {}", name, e)))
}

/// Applies one control datagram to the registry.
///
/// The registry is keyed by stream destination, so `src` is normalized to
/// (peer ip, stream port) regardless of which port the peer sent from.
fn handle_control(
    registry: &ListenerRegistry,
    observer: &dyn SenderObserver,
    datagram: &[u8],
    src: SocketAddr,
    now_ms: i64,
    stream_port: u16,
) {
    let packet = match ControlPacket::decode(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!(src = %src, "undecodable control packet: {}", e);
            return;
        }
    };
    let addr = SocketAddr::new(src.ip(), stream_port);
    match packet {
        ControlPacket::Hello { name } => {
            if registry.upsert(addr, Some(&name)) {
                if let Some(info) = registry.get(addr) {
                    tracing::info!(addr = %addr, name = %info.display_name(), "listener joined");
                    observer.listener_joined(addr, &info.display_name());
                }
            }
            observer.registry_changed(&registry.snapshot());
        }
        ControlPacket::Goodbye => {
            if let Some(info) = registry.remove(addr) {
                tracing::info!(addr = %addr, name = %info.display_name(), "listener left");
                observer.listener_left(addr, &info.display_name());
                observer.registry_changed(&registry.snapshot());
            }
        }
        ControlPacket::Pong { echo_millis } => {
            let rtt_ms = now_ms - echo_millis;
            registry.upsert(addr, None);
            registry.set_rtt(addr, rtt_ms);
            tracing::trace!(addr = %addr, rtt_ms, "pong");
            observer.registry_changed(&registry.snapshot());
        }
        ControlPacket::Ping { .. } => {
            // receivers answer pings; the sender only emits them
            tracing::debug!(src = %src, "ignoring ping on sender control port");
        }
    }
}

/// Removes listeners that stopped answering keep-alives.
fn sweep_stale(registry: &ListenerRegistry, observer: &dyn SenderObserver, stale_ms: i64) {
    let stale = registry.stale_addresses(stale_ms);
    if stale.is_empty() {
        return;
    }
    for addr in stale {
        if let Some(info) = registry.remove(addr) {
            tracing::warn!(addr = %addr, name = %info.display_name(), "listener went silent, removing");
            observer.listener_left(addr, &info.display_name());
        }
    }
    observer.registry_changed(&registry.snapshot());
}

/// Normalized RMS of an interleaved PCM chunk, in [0, 1].
fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64;
            v * v
        })
        .sum();
    ((sum_squares / samples.len() as f64).sqrt() / i16::MAX as f64) as f32
}

#[allow(clippy::too_many_arguments)]
fn encode_loop(
    running: &AtomicBool,
    registry: &ListenerRegistry,
    observer: &dyn SenderObserver,
    counters: &Counters,
    capture: &mut dyn CaptureSource,
    encoder: &mut dyn AudioEncoder,
    socket: &UdpSocket,
    frame_len: usize,
    stale_ms: i64,
) {
    let mut chunk = vec![0i16; frame_len];
    let mut sequence: u16 = 0;
    let mut chunk_index: u64 = 0;
    let start = Instant::now();
    let mut last_sweep = Instant::now();

    while running.load(Ordering::Relaxed) {
        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            last_sweep = Instant::now();
            sweep_stale(registry, observer, stale_ms);
        }

        let got = match capture.read(&mut chunk) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("capture failed, stopping sender: {}", e);
                running.store(false, Ordering::SeqCst);
                break;
            }
        };
        if got == 0 {
            continue;
        }

        chunk_index += 1;
        if chunk_index % LEVEL_EVERY_N_CHUNKS == 0 {
            observer.level_changed(rms_level(&chunk[..got]));
        }

        let pts_micros = start.elapsed().as_micros() as i64;
        match encoder.submit_input(&chunk[..got], pts_micros) {
            Ok(true) => {}
            Ok(false) => {
                tracing::trace!("encoder refused chunk, dropping");
                continue;
            }
            Err(e) => {
                tracing::warn!("encode failed: {}", e);
                continue;
            }
        }

        loop {
            let frame = match encoder.poll_output() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("encoder poll failed: {}", e);
                    break;
                }
            };
            counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
            let wire = StreamPacket {
                sequence,
                pts_micros: frame.pts_micros,
                payload: frame.data,
            }
            .encode();
            sequence = sequence.wrapping_add(1);
            for dest in registry.snapshot_enabled() {
                match socket.send_to(&wire, dest) {
                    Ok(sent) => {
                        counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                        counters.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        // one unreachable listener must not stall the rest
                        counters.send_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(dest = %dest, "send failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecParams, EncodedFrame};
    use crate::error::{AudioError, CodecError};
    use crate::events::NullObserver;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    fn test_config(base_port: u16) -> AppConfig {
        let mut config = AppConfig::default();
        config.net.base_port = base_port;
        config
    }

    #[derive(Default)]
    struct RecordingObserver {
        joined: Mutex<Vec<(SocketAddr, String)>>,
        left: Mutex<Vec<(SocketAddr, String)>>,
        snapshots: AtomicUsize,
    }

    impl SenderObserver for RecordingObserver {
        fn listener_joined(&self, addr: SocketAddr, display_name: &str) {
            self.joined.lock().push((addr, display_name.to_string()));
        }

        fn listener_left(&self, addr: SocketAddr, display_name: &str) {
            self.left.lock().push((addr, display_name.to_string()));
        }

        fn registry_changed(&self, _listeners: &[crate::registry::ListenerInfo]) {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Produces a constant tone chunk every few milliseconds.
    struct ToneCapture;

    impl CaptureSource for ToneCapture {
        fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
            thread::sleep(Duration::from_millis(5));
            for (i, sample) in buf.iter_mut().enumerate() {
                *sample = if i % 2 == 0 { 8000 } else { -8000 };
            }
            Ok(buf.len())
        }

        fn sample_rate(&self) -> u32 {
            48_000
        }

        fn channels(&self) -> u16 {
            2
        }
    }

    /// Emits one fixed-size frame per submitted chunk.
    struct PassthroughEncoder {
        pending: VecDeque<EncodedFrame>,
    }

    impl PassthroughEncoder {
        fn new() -> Self {
            Self {
                pending: VecDeque::new(),
            }
        }
    }

    impl AudioEncoder for PassthroughEncoder {
        fn submit_input(&mut self, _samples: &[i16], pts_micros: i64) -> Result<bool, CodecError> {
            self.pending.push_back(EncodedFrame {
                data: Bytes::from_static(&[0xF0; 32]),
                pts_micros,
            });
            Ok(true)
        }

        fn poll_output(&mut self) -> Result<Option<EncodedFrame>, CodecError> {
            Ok(self.pending.pop_front())
        }

        fn reconfigure(&mut self, _params: &CodecParams) -> Result<(), CodecError> {
            self.pending.clear();
            Ok(())
        }

        fn frame_len(&self) -> usize {
            960
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_pong_measures_rtt() {
        let registry = ListenerRegistry::new();
        let pong = ControlPacket::Pong { echo_millis: 1000 }.encode();
        handle_control(
            &registry,
            &NullObserver,
            &pong,
            addr("192.168.1.10:48123"),
            1045,
            50_005,
        );
        let info = registry.get(addr("192.168.1.10:50005")).unwrap();
        assert_eq!(info.rtt_ms, Some(45));
    }

    #[test]
    fn test_hello_and_goodbye_emit_events() {
        let registry = ListenerRegistry::new();
        let observer = RecordingObserver::default();
        let src = addr("192.168.1.10:48123");

        let hello = ControlPacket::Hello {
            name: "Phone-A".into(),
        }
        .encode();
        handle_control(&registry, &observer, &hello, src, 0, 50_005);
        // repeated Hellos refresh, they do not re-join
        handle_control(&registry, &observer, &hello, src, 0, 50_005);
        assert_eq!(
            *observer.joined.lock(),
            vec![(addr("192.168.1.10:50005"), "Phone-A".to_string())]
        );

        let goodbye = ControlPacket::Goodbye.encode();
        handle_control(&registry, &observer, &goodbye, src, 0, 50_005);
        assert_eq!(
            *observer.left.lock(),
            vec![(addr("192.168.1.10:50005"), "Phone-A".to_string())]
        );
        assert!(registry.is_empty());
        // one per Hello, one for the Goodbye
        assert_eq!(observer.snapshots.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_control_source_port_is_ignored() {
        let registry = ListenerRegistry::new();
        let hello = ControlPacket::Hello { name: String::new() }.encode();
        // same peer, two ephemeral source ports
        handle_control(&registry, &NullObserver, &hello, addr("192.168.1.10:48123"), 0, 50_005);
        handle_control(&registry, &NullObserver, &hello, addr("192.168.1.10:55999"), 0, 50_005);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(addr("192.168.1.10:50005")).is_some());
    }

    #[test]
    fn test_garbage_control_packet_is_ignored() {
        let registry = ListenerRegistry::new();
        handle_control(
            &registry,
            &NullObserver,
            b"\xFFgarbage",
            addr("192.168.1.10:48123"),
            0,
            50_005,
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sweep_removes_silent_listeners() {
        let registry = ListenerRegistry::new();
        let observer = RecordingObserver::default();
        registry.upsert(addr("192.168.1.10:50005"), Some("Phone-A"));
        registry.upsert(addr("192.168.1.11:50005"), Some("Phone-B"));
        registry.backdate(addr("192.168.1.10:50005"), 60_000);

        sweep_stale(&registry, &observer, 30_000);
        assert_eq!(registry.len(), 1);
        assert_eq!(observer.left.lock().len(), 1);
        assert_eq!(observer.left.lock()[0].1, "Phone-A");

        // nothing stale, nothing republished
        let before = observer.snapshots.load(Ordering::SeqCst);
        sweep_stale(&registry, &observer, 30_000);
        assert_eq!(observer.snapshots.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_rms_level_bounds() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0; 480]), 0.0);
        let full_scale = vec![i16::MAX; 480];
        assert!((rms_level(&full_scale) - 1.0).abs() < 1e-3);
        let half = vec![i16::MAX / 2; 480];
        assert!((rms_level(&half) - 0.5).abs() < 1e-2);
    }

    #[test]
    fn test_fan_out_honors_enabled_flag() {
        let mut pipeline = SenderPipeline::new(test_config(41_310), Arc::new(NullObserver));
        let registry = pipeline.registry();

        let enabled_sock = UdpSocket::bind("127.0.0.1:41310").unwrap();
        enabled_sock
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let disabled_sock = UdpSocket::bind("127.0.0.2:41310").unwrap();
        disabled_sock
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();

        // register both before any traffic flows, then mute one
        registry.upsert(addr("127.0.0.2:41310"), Some("disabled"));
        registry.set_enabled(addr("127.0.0.2:41310"), false);
        registry.upsert(addr("127.0.0.1:41310"), Some("enabled"));

        pipeline
            .start(Box::new(ToneCapture), Box::new(PassthroughEncoder::new()))
            .unwrap();

        let mut buf = [0u8; 2048];
        let len = enabled_sock.recv(&mut buf).unwrap();
        let first = StreamPacket::decode(&buf[..len]).unwrap();
        assert_eq!(first.payload.len(), 32);

        let len = enabled_sock.recv(&mut buf).unwrap();
        let second = StreamPacket::decode(&buf[..len]).unwrap();
        assert!(second.sequence != first.sequence);
        assert!(second.pts_micros >= first.pts_micros);

        let err = disabled_sock.recv(&mut buf).unwrap_err();
        assert!(
            err.kind() == std::io::ErrorKind::WouldBlock
                || err.kind() == std::io::ErrorKind::TimedOut
        );

        pipeline.stop();
        assert!(!pipeline.is_running());
        assert!(pipeline.stats().packets_sent >= 2);
    }

    #[test]
    fn test_keepalive_pings_known_listeners() {
        let mut pipeline = SenderPipeline::new(test_config(41_330), Arc::new(NullObserver));
        let registry = pipeline.registry();

        // listener control socket on a second loopback address, so the
        // ping does not land on the pipeline's own control port
        let listener_ctl = udp::control_socket_on(
            "127.0.0.2".parse().unwrap(),
            41_331,
            Duration::from_secs(2),
        )
        .unwrap();

        registry.upsert(addr("127.0.0.2:41330"), Some("Phone-A"));
        pipeline
            .start(Box::new(ToneCapture), Box::new(PassthroughEncoder::new()))
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = listener_ctl.recv_from(&mut buf).unwrap();
        match ControlPacket::decode(&buf[..len]).unwrap() {
            ControlPacket::Ping { echo_millis } => {
                assert!((now_millis() - echo_millis).abs() < 5_000);
            }
            other => panic!("expected ping, got {:?}", other),
        }

        pipeline.stop();
    }

    #[test]
    fn test_pipeline_is_one_shot() {
        let mut pipeline = SenderPipeline::new(test_config(41_320), Arc::new(NullObserver));
        pipeline
            .start(Box::new(ToneCapture), Box::new(PassthroughEncoder::new()))
            .unwrap();
        pipeline.stop();
        pipeline.stop();

        let err = pipeline
            .start(Box::new(ToneCapture), Box::new(PassthroughEncoder::new()))
            .unwrap_err();
        assert!(matches!(err, Error::Pipeline(_)));
    }

    #[test]
    fn test_stop_before_start_is_harmless() {
        let mut pipeline = SenderPipeline::new(test_config(41_340), Arc::new(NullObserver));
        pipeline.stop();
        assert!(!pipeline.is_running());
    }
}
