//! Audio playback to output devices
//!
//! Mirror image of the capture path: the pipeline writes PCM through the
//! [`PlaybackSink`] trait, a lock-free ring carries it to the cpal output
//! callback running on its own named thread.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{create_shared_ring, SharedSampleRing};
use crate::audio::device::{default_output_device, get_device_by_id};
use crate::error::AudioError;

/// How long a blocked write waits for ring space before dropping the
/// remainder. A wedged output device must not stall the decode loop.
const WRITE_TICK: Duration = Duration::from_millis(500);

/// Sink for interleaved 16-bit PCM.
///
/// `write` blocks until the sink has accepted the samples. Implementations
/// bound the wait internally so a dead device cannot wedge the caller.
pub trait PlaybackSink: Send {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError>;

    /// Sample rate the sink expects
    fn sample_rate(&self) -> u32;

    /// Channel count the sink expects
    fn channels(&self) -> u16;
}

/// Playback through a cpal output device
pub struct CpalPlayback {
    device_id: Option<String>,
    running: Arc<AtomicBool>,
    ring: SharedSampleRing,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    samples_played: Arc<AtomicU64>,
    config: StreamConfig,
}

impl CpalPlayback {
    /// Create a sink for the given device id, or the default output device
    /// when `None`.
    pub fn new(
        device_id: Option<&str>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, AudioError> {
        match device_id {
            Some(id) => drop(get_device_by_id(id)?),
            None => drop(default_output_device()?),
        }

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // half a second of audio between writer and callback
        let ring = create_shared_ring(sample_rate as usize * channels as usize / 2);

        Ok(Self {
            device_id: device_id.map(str::to_string),
            running: Arc::new(AtomicBool::new(false)),
            ring,
            thread_handle: None,
            error_rx: None,
            samples_played: Arc::new(AtomicU64::new(0)),
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
            None => default_output_device()?,
        };
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let ring = self.ring.clone();
        let samples_played = self.samples_played.clone();
        let config = self.config.clone();

        self.samples_played.store(0, Ordering::SeqCst);
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                let device = device.into_inner();
                let mut pcm: Vec<i16> = Vec::new();
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        pcm.resize(data.len(), 0);
                        let got = ring.pop_slice(&mut pcm);
                        samples_played.fetch_add(got as u64, Ordering::Relaxed);
                        for (dst, &src) in data[..got].iter_mut().zip(&pcm[..got]) {
                            *dst = src as f32 / i16::MAX as f32;
                        }
                        // underruns play silence, not stale samples
                        for dst in data[got..].iter_mut() {
                            *dst = 0.0;
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
                            tracing::error!("failed to start playback stream: {}", e);
                            return;
                        }
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to build playback stream: {}", e);
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

    /// Total samples handed to the device callback
    pub fn samples_played(&self) -> u64 {
        self.samples_played.load(Ordering::Relaxed)
    }

    /// Last stream error, if the device reported one
    pub fn take_error(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl PlaybackSink for CpalPlayback {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }

        let deadline = Instant::now() + WRITE_TICK;
        let mut offset = 0;
        while offset < samples.len() {
            offset += self.ring.try_push_slice(&samples[offset..]);
            if offset == samples.len() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    dropped = samples.len() - offset,
                    "output device stalled, dropping samples"
                );
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}
