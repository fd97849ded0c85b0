//! Receiver pipeline
//!
//! Ingests stream packets into a jitter buffer and plays them out through
//! a decoder and sink. Two worker threads share the buffer:
//!
//! - `receiver-ingest`: validates datagrams and pushes payloads, evicting
//!   the oldest frame when the buffer is full so playback stays live
//! - `receiver-decode`: waits for pre-roll, then pops payloads, decodes,
//!   and writes PCM to the playback sink
//!
//! The decoder starts in framed mode. When payloads turn out not to be
//! self-describing (no decoded output within the stall window, or a decode
//! error), the pipeline reconfigures it to raw mode and keeps going; a
//! stream from an older sender plays instead of crashing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::audio::buffer::{JitterBuffer, JitterBufferStats};
use crate::audio::PlaybackSink;
use crate::codec::{framing, AudioDecoder, CodecParams, DecoderMode};
use crate::config::AppConfig;
use crate::error::Result;
use crate::events::ReceiverObserver;
use crate::network::udp;
use crate::protocol::StreamPacket;

/// Poll interval while waiting for pre-roll
const PREROLL_TICK: Duration = Duration::from_millis(2);

/// Poll interval when the jitter buffer runs dry
const DRY_TICK: Duration = Duration::from_millis(1);

/// Consecutive reconfigure failures before playback is reported degraded
const DEGRADED_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverState {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Default)]
struct Counters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    invalid_packets: AtomicU64,
    frames_decoded: AtomicU64,
}

/// Point-in-time snapshot of the receiver counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub invalid_packets: u64,
    pub frames_decoded: u64,
}

/// Live ingest/decode/playback pipeline.
pub struct ReceiverPipeline {
    config: AppConfig,
    observer: Arc<dyn ReceiverObserver>,
    jitter: Arc<JitterBuffer>,
    running: Arc<AtomicBool>,
    state: Mutex<ReceiverState>,
    threads: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl ReceiverPipeline {
    pub fn new(config: AppConfig, observer: Arc<dyn ReceiverObserver>) -> Self {
        let jitter = Arc::new(JitterBuffer::new(config.receiver.jitter_capacity));
        Self {
            config,
            observer,
            jitter,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(ReceiverState::Stopped),
            threads: Vec::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Binds the stream port and spawns the worker threads.
    ///
    /// Starting an already running pipeline is a no-op. A stopped pipeline
    /// can be started again with a fresh decoder and sink.
    pub fn start(
        &mut self,
        decoder: Box<dyn AudioDecoder>,
        sink: Box<dyn PlaybackSink>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ReceiverState::Stopped {
                return Ok(());
            }
            *state = ReceiverState::Starting;
        }

        let stream_port = self.config.stream_port();
        let socket = match udp::stream_receiver_socket(stream_port) {
            Ok(socket) => socket,
            Err(e) => {
                *self.state.lock() = ReceiverState::Stopped;
                return Err(e.into());
            }
        };

        self.running.store(true, Ordering::SeqCst);

        let handle = {
            let running = self.running.clone();
            let jitter = self.jitter.clone();
            let counters = self.counters.clone();
            thread::Builder::new()
                .name("receiver-ingest".into())
                .spawn(move || ingest_loop(&running, &jitter, &counters, &socket))
                .map_err(|e| {
                    crate::error::Error::Pipeline(format!("failed to spawn receiver-ingest: {}", e))
                })?
        };
        self.threads.push(handle);

        let handle = {
            let running = self.running.clone();
            let jitter = self.jitter.clone();
            let observer = self.observer.clone();
            let counters = self.counters.clone();
            let params = CodecParams::from(&self.config.audio);
            let tuning = DecodeTuning {
                preroll_frames: self.config.receiver.preroll_frames,
                stall: Duration::from_millis(self.config.receiver.stall_ms),
                error_backoff: Duration::from_millis(self.config.receiver.error_backoff_ms),
            };
            thread::Builder::new()
                .name("receiver-decode".into())
                .spawn(move || {
                    decode_loop(
                        &running,
                        &jitter,
                        observer.as_ref(),
                        &counters,
                        decoder,
                        sink,
                        &params,
                        &tuning,
                    )
                })
                .map_err(|e| {
                    crate::error::Error::Pipeline(format!("failed to spawn receiver-decode: {}", e))
                })?
        };
        self.threads.push(handle);

        *self.state.lock() = ReceiverState::Running;
        tracing::info!(stream_port, "receiver pipeline started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            invalid_packets: self.counters.invalid_packets.load(Ordering::Relaxed),
            frames_decoded: self.counters.frames_decoded.load(Ordering::Relaxed),
        }
    }

    pub fn jitter_stats(&self) -> JitterBufferStats {
        self.jitter.stats()
    }

    /// Stops the worker threads, drops the decoder and sink, and clears
    /// the jitter buffer. Idempotent.
    pub fn stop(&mut self) {
        {
            let mut state = self.state.lock();
            if *state == ReceiverState::Stopped {
                return;
            }
            *state = ReceiverState::Stopped;
        }
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.jitter.clear();
        tracing::info!("receiver pipeline stopped");
    }
}

impl Drop for ReceiverPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DecodeTuning {
    preroll_frames: usize,
    stall: Duration,
    error_backoff: Duration,
}

fn ingest_loop(
    running: &AtomicBool,
    jitter: &JitterBuffer,
    counters: &Counters,
    socket: &std::net::UdpSocket,
) {
    let mut buf = [0u8; crate::constants::MAX_PACKET_SIZE];
    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, _src)) => match StreamPacket::decode(&buf[..len]) {
                Ok(packet) => {
                    counters.packets_received.fetch_add(1, Ordering::Relaxed);
                    counters.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                    jitter.push(packet.payload);
                }
                Err(e) => {
                    // foreign traffic on the port is not our problem
                    counters.invalid_packets.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("discarding datagram: {}", e);
                }
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::warn!("stream receive failed: {}", e);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_loop(
    running: &AtomicBool,
    jitter: &JitterBuffer,
    observer: &dyn ReceiverObserver,
    counters: &Counters,
    mut decoder: Box<dyn AudioDecoder>,
    mut sink: Box<dyn PlaybackSink>,
    params: &CodecParams,
    tuning: &DecodeTuning,
) {
    // pre-roll: let the buffer absorb network jitter before playback starts
    while running.load(Ordering::Relaxed) && jitter.len() < tuning.preroll_frames {
        thread::sleep(PREROLL_TICK);
    }
    tracing::debug!(frames = jitter.len(), "pre-roll complete");

    let mut last_output = Instant::now();
    let mut accepted_any = false;
    let mut reconfigure_failures = 0u32;

    while running.load(Ordering::Relaxed) {
        // a framed-mode decoder that accepts input but never produces
        // output is being fed bare packets; drop to raw interpretation
        if decoder.mode() == DecoderMode::Framed
            && accepted_any
            && last_output.elapsed() > tuning.stall
        {
            tracing::info!(
                stall_ms = tuning.stall.as_millis() as u64,
                "no decoded output, switching to raw payloads"
            );
            force_raw(
                decoder.as_mut(),
                params,
                observer,
                &mut reconfigure_failures,
            );
            last_output = Instant::now();
        }

        let payload = match jitter.pop() {
            Some(payload) => payload,
            None => {
                thread::sleep(DRY_TICK);
                continue;
            }
        };

        let submitted = match decoder.mode() {
            DecoderMode::Framed => decoder.submit_input(&payload),
            // a framed payload reaching a raw decoder still plays
            DecoderMode::Raw => decoder.submit_input(framing::strip_if_framed(&payload)),
        };
        match submitted {
            Ok(true) => accepted_any = true,
            Ok(false) => {
                tracing::trace!("decoder refused payload, dropping");
                continue;
            }
            Err(e) => {
                tracing::warn!("decode failed: {}", e);
                force_raw(
                    decoder.as_mut(),
                    params,
                    observer,
                    &mut reconfigure_failures,
                );
                thread::sleep(tuning.error_backoff);
                continue;
            }
        }

        loop {
            match decoder.poll_output() {
                Ok(Some(pcm)) => {
                    last_output = Instant::now();
                    counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = sink.write(&pcm) {
                        tracing::warn!("playback write failed: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("decoder poll failed: {}", e);
                    force_raw(
                        decoder.as_mut(),
                        params,
                        observer,
                        &mut reconfigure_failures,
                    );
                    thread::sleep(tuning.error_backoff);
                    break;
                }
            }
        }
    }
}

/// Rebuilds the decoder in raw mode. Playback continues best-effort even
/// when the rebuild itself keeps failing.
fn force_raw(
    decoder: &mut dyn AudioDecoder,
    params: &CodecParams,
    observer: &dyn ReceiverObserver,
    failures: &mut u32,
) {
    let was_framed = decoder.mode() == DecoderMode::Framed;
    match decoder.reconfigure(params, DecoderMode::Raw) {
        Ok(()) => {
            *failures = 0;
            if was_framed {
                observer.mode_changed(DecoderMode::Raw);
            }
        }
        Err(e) => {
            *failures += 1;
            tracing::error!(failures = *failures, "decoder reconfigure failed: {}", e);
            if *failures == DEGRADED_AFTER_FAILURES {
                observer.playback_degraded("decoder reconfigure keeps failing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AudioError, CodecError};
    use crate::events::NullObserver;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::net::UdpSocket;
    use std::sync::atomic::AtomicUsize;

    fn test_config(base_port: u16, preroll: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.net.base_port = base_port;
        config.receiver.preroll_frames = preroll;
        config.receiver.stall_ms = 60;
        config.receiver.error_backoff_ms = 1;
        config
    }

    /// What the mock decoder does with framed-mode input.
    #[derive(Clone, Copy)]
    enum FramedBehavior {
        Decode,
        AcceptSilently,
        Fail,
    }

    struct MockDecoder {
        mode: DecoderMode,
        framed: FramedBehavior,
        reconfigure_fails: bool,
        pending: VecDeque<Vec<i16>>,
    }

    impl MockDecoder {
        fn new(framed: FramedBehavior) -> Self {
            Self {
                mode: DecoderMode::Framed,
                framed,
                reconfigure_fails: false,
                pending: VecDeque::new(),
            }
        }
    }

    impl AudioDecoder for MockDecoder {
        fn submit_input(&mut self, _data: &[u8]) -> Result<bool, CodecError> {
            match (self.mode, self.framed) {
                (DecoderMode::Raw, _) | (DecoderMode::Framed, FramedBehavior::Decode) => {
                    self.pending.push_back(vec![7; 960]);
                    Ok(true)
                }
                (DecoderMode::Framed, FramedBehavior::AcceptSilently) => Ok(true),
                (DecoderMode::Framed, FramedBehavior::Fail) => {
                    Err(CodecError::DecodingFailed("mock framed failure".into()))
                }
            }
        }

        fn poll_output(&mut self) -> Result<Option<Vec<i16>>, CodecError> {
            Ok(self.pending.pop_front())
        }

        fn reconfigure(
            &mut self,
            _params: &CodecParams,
            mode: DecoderMode,
        ) -> Result<(), CodecError> {
            if self.reconfigure_fails {
                return Err(CodecError::DecoderInit("mock reconfigure failure".into()));
            }
            self.pending.clear();
            self.mode = mode;
            Ok(())
        }

        fn mode(&self) -> DecoderMode {
            self.mode
        }
    }

    struct RecordingSink {
        samples: Arc<Mutex<Vec<i16>>>,
    }

    impl PlaybackSink for RecordingSink {
        fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
            self.samples.lock().extend_from_slice(samples);
            Ok(())
        }

        fn sample_rate(&self) -> u32 {
            48_000
        }

        fn channels(&self) -> u16 {
            2
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        modes: Mutex<Vec<DecoderMode>>,
        degraded: AtomicUsize,
    }

    impl ReceiverObserver for RecordingObserver {
        fn mode_changed(&self, mode: DecoderMode) {
            self.modes.lock().push(mode);
        }

        fn playback_degraded(&self, _detail: &str) {
            self.degraded.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn send_stream_packets(port: u16, count: u16, payload: &'static [u8]) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        for sequence in 0..count {
            let packet = StreamPacket {
                sequence,
                pts_micros: sequence as i64 * 10_000,
                payload: Bytes::from_static(payload),
            };
            socket
                .send_to(&packet.encode(), ("127.0.0.1", port))
                .unwrap();
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn wait_for<F: Fn() -> bool>(deadline: Duration, predicate: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_ingest_decode_playback() {
        let mut pipeline = ReceiverPipeline::new(test_config(41_350, 1), Arc::new(NullObserver));
        let samples = Arc::new(Mutex::new(Vec::new()));
        pipeline
            .start(
                Box::new(MockDecoder::new(FramedBehavior::Decode)),
                Box::new(RecordingSink {
                    samples: samples.clone(),
                }),
            )
            .unwrap();

        send_stream_packets(41_350, 5, &[0x10; 40]);
        assert!(wait_for(Duration::from_secs(2), || {
            samples.lock().len() >= 5 * 960
        }));

        // a foreign datagram is counted and discarded, never fatal
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.send_to(b"not audio", ("127.0.0.1", 41_350)).unwrap();
        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.stats().invalid_packets == 1
        }));

        let stats = pipeline.stats();
        assert_eq!(stats.packets_received, 5);
        assert!(stats.frames_decoded >= 5);

        pipeline.stop();
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.jitter_stats().level, 0);
    }

    #[test]
    fn test_preroll_gates_playback() {
        let mut pipeline = ReceiverPipeline::new(test_config(41_360, 3), Arc::new(NullObserver));
        let samples = Arc::new(Mutex::new(Vec::new()));
        pipeline
            .start(
                Box::new(MockDecoder::new(FramedBehavior::Decode)),
                Box::new(RecordingSink {
                    samples: samples.clone(),
                }),
            )
            .unwrap();

        // two frames buffered, pre-roll of three: nothing plays
        send_stream_packets(41_360, 2, &[0x10; 40]);
        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.stats().packets_received == 2
        }));
        thread::sleep(Duration::from_millis(100));
        assert!(samples.lock().is_empty());

        // the third frame opens the gate
        send_stream_packets(41_360, 1, &[0x10; 40]);
        assert!(wait_for(Duration::from_secs(2), || {
            samples.lock().len() >= 3 * 960
        }));

        pipeline.stop();
    }

    #[test]
    fn test_stall_switches_to_raw() {
        let config = test_config(41_370, 1);
        let observer = Arc::new(RecordingObserver::default());
        let mut pipeline = ReceiverPipeline::new(config, observer.clone());
        let samples = Arc::new(Mutex::new(Vec::new()));
        pipeline
            .start(
                Box::new(MockDecoder::new(FramedBehavior::AcceptSilently)),
                Box::new(RecordingSink {
                    samples: samples.clone(),
                }),
            )
            .unwrap();

        // accepted input with no output for longer than the stall window
        send_stream_packets(41_370, 40, &[0x10; 40]);
        assert!(wait_for(Duration::from_secs(2), || {
            !samples.lock().is_empty()
        }));
        assert_eq!(*observer.modes.lock(), vec![DecoderMode::Raw]);
        assert_eq!(observer.degraded.load(Ordering::SeqCst), 0);

        pipeline.stop();
    }

    #[test]
    fn test_decode_error_switches_to_raw() {
        let observer = Arc::new(RecordingObserver::default());
        let mut pipeline = ReceiverPipeline::new(test_config(41_380, 1), observer.clone());
        let samples = Arc::new(Mutex::new(Vec::new()));
        pipeline
            .start(
                Box::new(MockDecoder::new(FramedBehavior::Fail)),
                Box::new(RecordingSink {
                    samples: samples.clone(),
                }),
            )
            .unwrap();

        send_stream_packets(41_380, 10, &[0x10; 40]);
        assert!(wait_for(Duration::from_secs(2), || {
            !samples.lock().is_empty()
        }));
        assert_eq!(*observer.modes.lock(), vec![DecoderMode::Raw]);

        pipeline.stop();
    }

    #[test]
    fn test_repeated_reconfigure_failure_degrades() {
        let observer = Arc::new(RecordingObserver::default());
        let mut pipeline = ReceiverPipeline::new(test_config(41_390, 1), observer.clone());
        let mut decoder = MockDecoder::new(FramedBehavior::Fail);
        decoder.reconfigure_fails = true;
        let samples = Arc::new(Mutex::new(Vec::new()));
        pipeline
            .start(
                Box::new(decoder),
                Box::new(RecordingSink {
                    samples: samples.clone(),
                }),
            )
            .unwrap();

        send_stream_packets(41_390, 10, &[0x10; 40]);
        assert!(wait_for(Duration::from_secs(2), || {
            observer.degraded.load(Ordering::SeqCst) == 1
        }));
        // stuck in framed mode, so nothing ever played
        assert!(observer.modes.lock().is_empty());
        assert!(samples.lock().is_empty());

        pipeline.stop();
    }

    #[test]
    fn test_start_twice_is_noop_and_restart_works() {
        let mut pipeline = ReceiverPipeline::new(test_config(41_400, 1), Arc::new(NullObserver));
        let samples = Arc::new(Mutex::new(Vec::new()));
        pipeline
            .start(
                Box::new(MockDecoder::new(FramedBehavior::Decode)),
                Box::new(RecordingSink {
                    samples: samples.clone(),
                }),
            )
            .unwrap();
        // second start changes nothing
        pipeline
            .start(
                Box::new(MockDecoder::new(FramedBehavior::Decode)),
                Box::new(RecordingSink {
                    samples: samples.clone(),
                }),
            )
            .unwrap();

        pipeline.stop();
        pipeline.stop();

        // a stopped pipeline accepts a fresh decoder and sink
        pipeline
            .start(
                Box::new(MockDecoder::new(FramedBehavior::Decode)),
                Box::new(RecordingSink {
                    samples: samples.clone(),
                }),
            )
            .unwrap();
        send_stream_packets(41_400, 2, &[0x10; 40]);
        assert!(wait_for(Duration::from_secs(2), || {
            !samples.lock().is_empty()
        }));
        pipeline.stop();
    }
}
