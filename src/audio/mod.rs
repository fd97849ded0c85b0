//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

pub use buffer::{JitterBuffer, SampleRing};
pub use capture::{CaptureSource, CpalCapture};
pub use device::{get_device_by_id, list_devices, AudioDevice};
pub use playback::{CpalPlayback, PlaybackSink};
