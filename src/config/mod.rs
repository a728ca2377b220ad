//! Command line and configuration file handling

mod args;
mod settings;

pub use args::{Args, Command, SampleEncoding};
pub use settings::{ConfigError, RenderConfig};
