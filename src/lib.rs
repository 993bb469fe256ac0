//! Two-peer WebRTC session bootstrap over a pluggable signaling channel.

pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::SignalingConfig;
pub use error::{SignalError, SignalResult};
pub use session::{RenegotiationGuard, Session};
pub use signaling::{MemoryChannel, SignalingChannel};
