//! Recording sessions.
//!
//! The panel pushes frames into a bounded `FrameQueue` without ever blocking;
//! a writer thread drains it, stamps each frame and hands it to a `FrameWriter`.
//! Stopping is join-based: when `Recorder::stop` returns the file is closed.
//! Frames still queued at that moment are discarded, not written.

use crate::error::RecordError;
use crate::frame_writer::{FrameWriter, RecordingSettings};
use crate::picture;
use chrono::Local;
use crossbeam_queue::ArrayQueue;
use station_types::Frame;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const RECORDING_QUEUE_CAPACITY: usize = 500;

/// How long the writer sleeps when it finds the queue empty.
const IDLE_WAIT: Duration = Duration::from_millis(20);

/// Bounded frame hand-off between the interactive thread and a writer thread.
pub struct FrameQueue {
    frames: ArrayQueue<Frame>,
    dropped: AtomicU64,
    high_water: AtomicUsize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> FrameQueue {
        FrameQueue {
            frames: ArrayQueue::new(capacity),
            dropped: AtomicU64::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    /// Never blocks. Returns `false` and counts a drop when the queue is full.
    pub fn push(&self, frame: Frame) -> bool {
        match self.frames.push(frame) {
            Ok(()) => {
                self.high_water.fetch_max(self.frames.len(), Ordering::Relaxed);
                true
            },
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            },
        }
    }

    pub fn pop(&self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Empties the queue, returning how many frames were thrown away.
    pub fn discard_all(&self) -> usize {
        let mut discarded = 0;
        while self.frames.pop().is_some() {
            discarded += 1;
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Largest length the queue has reached.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RecorderState {
    Recording,
    Finished,
}

/// What a finished recording session did.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames_written: u64,
    /// Queued but unwritten when the session stopped.
    pub frames_discarded: u64,
    /// Refused because the queue was full.
    pub frames_dropped: u64,
    pub encoder_failed: bool,
}

pub struct Recorder {
    settings: RecordingSettings,
    queue: Arc<FrameQueue>,
    running: Arc<AtomicBool>,
    written: Arc<AtomicU64>,
    handle: Option<JoinHandle<WriterOutcome>>,
    summary: Option<RecordingSummary>,
}

struct WriterOutcome {
    discarded: u64,
    encoder_failed: bool,
}

impl Recorder {
    pub fn start(settings: RecordingSettings, writer: Box<dyn FrameWriter>) -> std::io::Result<Recorder> {
        Recorder::with_capacity(settings, writer, RECORDING_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        settings: RecordingSettings,
        writer: Box<dyn FrameWriter>,
        capacity: usize,
    ) -> std::io::Result<Recorder> {
        let queue = Arc::new(FrameQueue::new(capacity));
        let running = Arc::new(AtomicBool::new(true));
        let written = Arc::new(AtomicU64::new(0));

        let handle = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let written = Arc::clone(&written);
            let label = settings.label.clone();
            let path = settings.path.clone();

            thread::Builder::new()
                .name(format!("recorder {}", label))
                .spawn(move || write_loop(writer, &queue, &running, &written, &label, &path))?
        };

        info!(path = %settings.path.display(), fps = settings.fps, width = settings.width, height = settings.height, "recording started");

        Ok(Recorder {
            settings,
            queue,
            running,
            written,
            handle: Some(handle),
            summary: None,
        })
    }

    /// Offers a frame to the writer. Returns `false` if it was dropped.
    pub fn enqueue(&self, frame: Frame) -> bool {
        if self.state() == RecorderState::Finished {
            return false;
        }

        let queued = self.queue.push(frame);
        if !queued {
            let dropped = self.queue.dropped();
            if dropped == 1 || dropped % 100 == 0 {
                debug!(path = %self.settings.path.display(), dropped, "recording queue full, dropping frames");
            }
        }
        queued
    }

    pub fn state(&self) -> RecorderState {
        if self.summary.is_none() && self.running.load(Ordering::SeqCst) {
            RecorderState::Recording
        } else {
            RecorderState::Finished
        }
    }

    pub fn settings(&self) -> &RecordingSettings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings.path
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    pub fn frames_written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// Stops the writer and waits for it to close the file. Safe to call more than once.
    pub fn stop(&mut self) -> RecordingSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }

        self.running.store(false, Ordering::SeqCst);

        let outcome = match self.handle.take().map(JoinHandle::join) {
            Some(Ok(outcome)) => outcome,
            _ => WriterOutcome { discarded: self.queue.discard_all() as u64, encoder_failed: true },
        };

        let summary = RecordingSummary {
            path: self.settings.path.clone(),
            frames_written: self.frames_written(),
            frames_discarded: outcome.discarded,
            frames_dropped: self.queue.dropped(),
            encoder_failed: outcome.encoder_failed,
        };

        self.summary = Some(summary.clone());
        summary
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn write_loop(
    mut writer: Box<dyn FrameWriter>,
    queue: &FrameQueue,
    running: &AtomicBool,
    written: &AtomicU64,
    label: &str,
    path: &Path,
) -> WriterOutcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), RecordError> {
        while running.load(Ordering::SeqCst) {
            let frame = match queue.pop() {
                Some(frame) => frame,
                None => {
                    thread::sleep(IDLE_WAIT);
                    continue;
                },
            };

            let mut image = frame.to_rgb_image();
            picture::stamp(&mut image, label, &Local::now());
            writer.write(&image)?;
            written.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }));

    let mut encoder_failed = match result {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "exception in recording, closing file");
            true
        },
        Err(_) => {
            warn!(path = %path.display(), "recording writer panicked, closing file");
            true
        },
    };

    running.store(false, Ordering::SeqCst);
    let discarded = queue.discard_all() as u64;

    if let Err(e) = writer.finish() {
        warn!(path = %path.display(), error = %e, "could not finalize recording");
        encoder_failed = true;
    }

    info!(path = %path.display(), frames = written.load(Ordering::SeqCst), discarded, "recording saved");
    WriterOutcome { discarded, encoder_failed }
}
