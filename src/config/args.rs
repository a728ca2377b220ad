//! CLI argument parsing using clap

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// wrender - real-time PCM renderer
///
/// Plays raw PCM on an audio endpoint with format negotiation, device
/// hot-swap and stall detection
#[derive(Parser, Debug)]
#[command(name = "wrender")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (default: wrender.toml next to the executable,
    /// then the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,
}

/// Sample encoding of raw PCM input
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Unsigned 8-bit
    U8,
    /// Signed 16-bit
    S16,
    /// Signed 24-bit packed
    S24,
    /// Signed 32-bit
    S32,
    /// 32-bit float
    F32,
}

impl SampleEncoding {
    pub fn bits(&self) -> u16 {
        match self {
            SampleEncoding::U8 => 8,
            SampleEncoding::S16 => 16,
            SampleEncoding::S24 => 24,
            SampleEncoding::S32 | SampleEncoding::F32 => 32,
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List active render devices
    List {
        /// Show device IDs (useful for scripting)
        #[arg(long)]
        show_ids: bool,
    },

    /// Play a raw PCM file (or stdin with "-")
    Play {
        /// Input file, "-" for stdin
        input: String,

        /// Sample rate in Hz
        #[arg(short, long, default_value = "48000")]
        rate: u32,

        /// Channel count
        #[arg(long, default_value = "2")]
        channels: u16,

        /// Sample encoding
        #[arg(short, long, value_enum, default_value = "s16")]
        encoding: SampleEncoding,

        /// Samples are big-endian
        #[arg(long)]
        big_endian: bool,

        /// Render device ID (default: from config, then system default)
        #[arg(short, long)]
        device: Option<String>,

        /// Output gain from 0.0 to 1.0 (default: from config)
        #[arg(short, long)]
        gain: Option<f32>,

        /// Stream continuously instead of treating the input as a clip
        #[arg(long)]
        stream: bool,
    },

    /// Print or write a sample configuration file
    Config {
        /// Write the sample to this path instead of printing it
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_defaults() {
        let args = Args::parse_from(["wrender", "play", "clip.raw"]);
        match &args.command {
            Command::Play {
                input,
                rate,
                channels,
                encoding,
                big_endian,
                stream,
                ..
            } => {
                assert_eq!(input, "clip.raw");
                assert_eq!(*rate, 48000);
                assert_eq!(*channels, 2);
                assert_eq!(*encoding, SampleEncoding::S16);
                assert!(!*big_endian);
                assert!(!*stream);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from(["wrender", "list", "--show-ids", "-vv"]);
        assert!(matches!(args.command, Command::List { show_ids: true }));
        assert_eq!(args.log_level(), tracing::Level::TRACE);

        let args = Args::parse_from(["wrender", "-q", "config"]);
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_encoding_bits() {
        let args = Args::parse_from(["wrender", "play", "-", "-e", "f32", "-r", "44100"]);
        match args.command {
            Command::Play { encoding, rate, .. } => {
                assert_eq!(encoding.bits(), 32);
                assert_eq!(rate, 44100);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
