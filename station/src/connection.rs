//! The seam between the pipeline and whatever actually talks to a camera.
//!
//! A `Connector` opens connections; a `Connection` is an exclusively owned,
//! open stream that hands out decoded frames. Dropping a connection releases it.

use crate::error::{ConnectError, StreamError};
use image::{Rgb, RgbImage};
use station_types::{CameraAddress, Frame, StreamProperties};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub trait Connection: Send {
    /// Width, height and frame rate the camera reports.
    fn properties(&self) -> StreamProperties;

    /// Ask the backend to hand out the newest frame instead of a queued backlog.
    fn disable_buffering(&mut self) {}

    /// Block until the next frame is decoded.
    fn read_frame(&mut self) -> Result<Frame, StreamError>;
}

pub trait Connector: Send + Sync {
    fn connect(&self, address: &CameraAddress) -> Result<Box<dyn Connection>, ConnectError>;
}

/// A camera that paints moving colour bars, paced at its frame rate.
///
/// Stands in for real hardware when the station is built without a camera backend.
pub struct TestPatternConnector {
    properties: StreamProperties,
    connect_delay: Duration,
    frame_limit: Option<u64>,
    live: Arc<AtomicUsize>,
}

impl TestPatternConnector {
    pub fn new(properties: StreamProperties) -> TestPatternConnector {
        TestPatternConnector {
            properties,
            connect_delay: Duration::from_millis(0),
            frame_limit: None,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulated handshake time for every connection attempt.
    pub fn with_connect_delay(mut self, delay: Duration) -> TestPatternConnector {
        self.connect_delay = delay;
        self
    }

    /// End every stream after this many frames.
    pub fn with_frame_limit(mut self, limit: u64) -> TestPatternConnector {
        self.frame_limit = Some(limit);
        self
    }

    /// Connections handed out and not yet dropped.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Default for TestPatternConnector {
    fn default() -> TestPatternConnector {
        TestPatternConnector::new(StreamProperties::new(640, 360, 25.0))
    }
}

impl Connector for TestPatternConnector {
    fn connect(&self, _address: &CameraAddress) -> Result<Box<dyn Connection>, ConnectError> {
        thread::sleep(self.connect_delay);
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(TestPatternCamera {
            properties: self.properties,
            frame_limit: self.frame_limit,
            frames_sent: 0,
            next_frame_at: Instant::now(),
            live: Arc::clone(&self.live),
        }))
    }
}

struct TestPatternCamera {
    properties: StreamProperties,
    frame_limit: Option<u64>,
    frames_sent: u64,
    next_frame_at: Instant,
    live: Arc<AtomicUsize>,
}

impl TestPatternCamera {
    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.properties.recording_fps())
    }

    fn paint(&self) -> RgbImage {
        const BARS: [[u8; 3]; 7] = [
            [192, 192, 192], [192, 192, 0], [0, 192, 192], [0, 192, 0],
            [192, 0, 192], [192, 0, 0], [0, 0, 192],
        ];

        let StreamProperties { width, height, .. } = self.properties;
        let span = u64::from(width.max(1));
        // bars move four pixels a frame, wrapping at the image width
        let shift = self.frames_sent % span * 4 % span;

        RgbImage::from_fn(width, height, |x, _y| {
            let bar = ((u64::from(x) + shift) % span) as usize * BARS.len() / span as usize;
            Rgb(BARS[bar.min(BARS.len() - 1)])
        })
    }
}

impl Connection for TestPatternCamera {
    fn properties(&self) -> StreamProperties {
        self.properties
    }

    fn read_frame(&mut self) -> Result<Frame, StreamError> {
        if matches!(self.frame_limit, Some(limit) if self.frames_sent >= limit) {
            return Err(StreamError::EndOfStream);
        }

        let now = Instant::now();
        if self.next_frame_at > now {
            thread::sleep(self.next_frame_at - now);
        }
        self.next_frame_at = Instant::now() + self.frame_interval();

        let frame = Frame::new(self.paint());
        self.frames_sent += 1;
        Ok(frame)
    }
}

impl Drop for TestPatternCamera {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
