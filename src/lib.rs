// Library interface for the capture WebM writer

// Declare all modules
pub mod config;
pub mod ebml;
pub mod error;
pub mod ivf;
pub mod muxer;
pub mod reader;
pub mod sequencer;
pub mod webm;

pub use config::{CaptureConfig, Quality};
pub use error::{ConfigError, IvfError, MuxError, ParseError};
pub use muxer::{SessionStats, VideoTrack, WebmMuxer};
pub use sequencer::{CueEntry, Frame, Timebase};
