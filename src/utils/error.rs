use std::io;
use thiserror::Error;

/// Main error type for the encoder library.
///
/// Contract violations on the arithmetic coder (wrong call order, bin/context
/// misuse) are not represented here: they are programmer errors, asserted in
/// debug builds, matching the coder's trust model.
#[derive(Error, Debug)]
pub enum EncoderError {
    /// A configuration that can never produce a valid schedule or bitstream.
    /// Detected at construction time, never at runtime.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// An invalid argument was provided to a public entry point.
    #[error("Invalid argument: {0}")]
    InvalidArg(String),
    /// An invalid operation was attempted (e.g. encoding after `finish`).
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    /// An I/O error from a payload writer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A specialized `Result` type for encoding operations.
pub type Result<T> = std::result::Result<T, EncoderError>;
