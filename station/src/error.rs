//! Error types for the capture and recording pipeline.
//!
//! Nothing here is fatal to the process: every error ends up as the
//! terminal state of one panel's source or recorder.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Why a camera connection could not be opened.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The liveness probe did not finish inside its time budget.
    #[error("timed out after {timeout:?} opening {address}")]
    Timeout { address: String, timeout: Duration },

    /// The probe finished and reported that the camera cannot be opened.
    #[error("camera at {address} could not be opened")]
    Refused { address: String },

    /// The isolated probe could not be started or supervised.
    #[error("probe failed: {0}")]
    Probe(#[source] io::Error),

    /// `open` was called from inside a probe worker.
    #[error("connection opener called from inside a probe worker")]
    Nested,

    /// The camera backend rejected the connection.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Failure to pull the next frame from a streaming connection.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("end of stream")]
    EndOfStream,

    #[error("could not decode frame: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure inside a recording session's writer.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("encoder error: {0}")]
    Encoder(String),
}

/// Failure reading or writing the station configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not access configuration file: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("could not serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("no camera slot {0}")]
    InvalidSlot(usize),
}
