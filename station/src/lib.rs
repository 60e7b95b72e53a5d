//! Video ingestion and recording for a four-camera monitoring station.
//!
//! Capture threads own camera connections and report to one interactive thread
//! over a channel. That thread owns every panel, fans frames out to the
//! presenter and to bounded recording queues, and runs all lifecycle commands.

pub mod config;
pub mod connection;
pub mod error;
pub mod frame_source;
pub mod frame_writer;
pub mod logging;
pub mod message;
#[cfg(feature = "ffmpeg")]
pub mod mpeg_encoder;
pub mod opener;
pub mod panel;
pub mod picture;
pub mod recorder;
pub mod recordings;
#[cfg(feature = "ffmpeg")]
pub mod rtsp;
pub mod station;

pub use crate::message::{Command, DisplayState, Notification, Presenter, Scope};
pub use crate::station::{Station, StationHandle, StationSetup};
