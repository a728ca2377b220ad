//! wrender - real-time PCM rendering
//!
//! A [`RenderSession`](audio::RenderSession) accepts PCM from producer
//! threads and paces it into an audio endpoint from a background drain task,
//! negotiating the device format, converting when needed and reporting
//! stalls through a watchdog.

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod health;

pub use error::{RenderError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
