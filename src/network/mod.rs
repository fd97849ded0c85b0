//! Network subsystem for UDP audio transport

pub mod control;
pub mod discovery;
pub mod receiver;
pub mod sender;
pub mod udp;

pub use control::{send_goodbye, send_hello, KeepAlive};
pub use discovery::{BroadcastDiscovery, Discovery};
pub use receiver::ReceiverPipeline;
pub use sender::SenderPipeline;
