use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while writing a WebM document.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Underlying write or seek failed; the output is left incomplete
    #[error("I/O error while writing container: {0}")]
    Io(#[from] io::Error),

    /// A container was closed while a more deeply nested one was still open
    #[error("container 0x{id:X} at offset {offset} is not the innermost open container (innermost: {innermost:?})")]
    UnbalancedContainer {
        id: u32,
        offset: u64,
        innermost: Option<u64>,
    },

    /// A rewritten region did not occupy exactly the bytes reserved for it
    #[error("region at offset {offset} was reserved with {reserved} bytes but rewritten with {written}")]
    PatchSizeMismatch {
        offset: u64,
        reserved: u64,
        written: u64,
    },

    /// Value collides with (or exceeds) the 8-byte "unknown size" sentinel
    #[error("value {0} is too large for an EBML size field")]
    SizeTooLarge(u64),

    #[error("invalid timebase {num}/{den}")]
    InvalidTimebase { num: u32, den: u32 },

    /// Timestamp (after rescaling or clamping) has no representable successor
    #[error("frame timestamp {pts_ms} ms is out of range")]
    TimestampOutOfRange { pts_ms: i64 },
}

pub type Result<T> = std::result::Result<T, MuxError>;

/// Errors raised while reading an EBML document back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("truncated data at offset {offset}: needed {needed} bytes")]
    Truncated { offset: u64, needed: usize },

    /// First byte of a variable-length field has no marker bit in range
    #[error("invalid variable-length integer at offset {offset}")]
    InvalidVint { offset: u64 },

    #[error("element 0x{id:X} at offset {offset} overruns its parent by {excess} bytes")]
    Overrun { id: u32, offset: u64, excess: u64 },

    #[error("element payload of {len} bytes cannot hold a {kind}")]
    InvalidPayload { kind: &'static str, len: usize },
}

/// Errors raised by the IVF packet reader.
#[derive(Debug, Error)]
pub enum IvfError {
    #[error("I/O error while reading IVF: {0}")]
    Io(#[from] io::Error),

    #[error("invalid IVF signature: expected DKIF, got {0:?}")]
    InvalidSignature([u8; 4]),

    #[error("unsupported IVF version: expected 0, got {0}")]
    UnsupportedVersion(u16),

    #[error("unsupported codec FourCC {0:?}: only VP80 can be muxed")]
    UnsupportedCodec([u8; 4]),

    #[error("truncated IVF header: expected {expected} bytes, got {got}")]
    TruncatedHeader { expected: usize, got: usize },

    #[error("truncated frame {frame_index}: expected {expected} bytes, got {got}")]
    TruncatedFrame {
        frame_index: u64,
        expected: usize,
        got: usize,
    },
}

/// Errors raised while loading a capture configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
