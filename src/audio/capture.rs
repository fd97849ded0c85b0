//! Audio capture from input devices
//!
//! The pipeline reads PCM through the [`CaptureSource`] trait; the cpal
//! implementation runs the device callback on its own named thread and
//! hands samples over through a lock-free ring.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{create_shared_ring, SharedSampleRing};
use crate::audio::device::{default_input_device, get_device_by_id};
use crate::error::AudioError;

/// How long a blocking read waits before giving the caller a chance to
/// observe shutdown.
const READ_TICK: Duration = Duration::from_millis(250);

/// Source of interleaved 16-bit PCM.
///
/// `read` either fills `buf` completely and returns its length, or returns
/// 0 when not enough samples arrived within the source's internal tick.
/// Partially accumulated samples are retained for the next call, so a slow
/// or idle device never blocks its caller indefinitely and never loses
/// data across ticks.
pub trait CaptureSource: Send {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError>;

    /// Sample rate of the delivered PCM
    fn sample_rate(&self) -> u32;

    /// Channel count of the delivered PCM
    fn channels(&self) -> u16;
}

/// Capture from a cpal input device
pub struct CpalCapture {
    device_id: Option<String>,
    running: Arc<AtomicBool>,
    ring: SharedSampleRing,
    pending: Vec<i16>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    samples_captured: Arc<AtomicU64>,
    config: StreamConfig,
}

impl CpalCapture {
    /// Create a capture for the given device id, or the default input
    /// device when `None`.
    pub fn new(
        device_id: Option<&str>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, AudioError> {
        // validate the device exists up front; the stream opens on start()
        match device_id {
            Some(id) => drop(get_device_by_id(id)?),
            None => drop(default_input_device()?),
        }

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // one second of audio between callback and reader
        let ring = create_shared_ring(sample_rate as usize * channels as usize);

        Ok(Self {
            device_id: device_id.map(str::to_string),
            running: Arc::new(AtomicBool::new(false)),
            ring,
            pending: Vec::new(),
            thread_handle: None,
            error_rx: None,
            samples_captured: Arc::new(AtomicU64::new(0)),
            config,
        })
    }

    /// Start the device stream
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = match &self.device_id {
            Some(id) => get_device_by_id(id)?,
            None => default_input_device()?,
        };
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let ring = self.ring.clone();
        let samples_captured = self.samples_captured.clone();
        let config = self.config.clone();

        self.samples_captured.store(0, Ordering::SeqCst);
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let device = device.into_inner();
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        samples_captured.fetch_add(data.len() as u64, Ordering::Relaxed);

                        // convert on the callback, push what fits
                        let mut chunk = [0i16; 512];
                        for block in data.chunks(chunk.len()) {
                            for (dst, &src) in chunk.iter_mut().zip(block) {
                                *dst = (src.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            }
                            ring.push_slice(&chunk[..block.len()]);
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("failed to start capture stream: {}", e);
                            return;
                        }
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                        // stream drops here, stopping the device
                    }
                    Err(e) => {
                        tracing::error!("failed to build capture stream: {}", e);
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop the device stream
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Total samples delivered by the device callback
    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    /// Last stream error, if the device reported one
    pub fn take_error(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl CaptureSource for CpalCapture {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }

        let deadline = Instant::now() + READ_TICK;
        loop {
            let want = buf.len() - self.pending.len();
            if want == 0 {
                break;
            }
            let start = self.pending.len();
            self.pending.resize(buf.len(), 0);
            let got = self.ring.pop_slice(&mut self.pending[start..]);
            self.pending.truncate(start + got);

            if self.pending.len() == buf.len() {
                break;
            }
            if Instant::now() >= deadline {
                // keep what we have for the next call
                return Ok(0);
            }
            thread::sleep(Duration::from_millis(1));
        }

        buf.copy_from_slice(&self.pending);
        self.pending.clear();
        Ok(buf.len())
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
