//! One camera slot.
//!
//! A panel owns at most one `FrameSource` and at most one `Recorder`. It lives on
//! the interactive thread and is only ever touched through `&mut`, so refresh,
//! teardown and the event handlers of one panel never overlap.

use crate::config::DeviceConfig;
use crate::frame_source::{FrameSource, SourceEvent};
use crate::frame_writer::{RecordingSettings, WriterFactory};
use crate::message::{DisplayState, Notification, Presenter, StationEvent};
use crate::opener::ConnectionOpener;
use crate::recorder::{Recorder, RecorderState};
use crate::recordings;
use chrono::Local;
use station_types::{CameraAddress, Credentials, Frame, Slot, SourceId, SourceIdGenerator, StreamProperties};
use std::mem;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What every panel of a station shares.
pub struct PanelContext {
    pub opener: Arc<ConnectionOpener>,
    pub devices: Arc<dyn DeviceConfig>,
    pub credentials: Credentials,
    pub stream_path: String,
    pub recordings_dir: PathBuf,
    pub writer_factory: Arc<dyn WriterFactory>,
    pub events: Sender<StationEvent>,
    pub source_ids: SourceIdGenerator,
}

impl PanelContext {
    /// Address and title for `slot` as the device configuration has them now.
    fn identity(&self, slot: Slot) -> (Option<CameraAddress>, String) {
        let host = self.devices.device_address(slot);
        let address = CameraAddress::new(host.as_deref(), &self.credentials, &self.stream_path);
        let title = self.devices.device_name(slot).unwrap_or_else(|| slot.default_title());
        (address, title)
    }
}

enum Recording {
    Off,
    /// Asked for before the connection was ready.
    Pending,
    Live(Recorder),
}

pub struct PanelController {
    slot: Slot,
    title: String,
    address: Option<CameraAddress>,
    source: Option<FrameSource>,
    stream: Option<StreamProperties>,
    recording: Recording,
    display: DisplayState,
    latest: Option<Frame>,
    context: Arc<PanelContext>,
}

impl PanelController {
    /// Reads the slot's identity from the device configuration. Does not connect.
    pub fn new(slot: Slot, context: Arc<PanelContext>) -> PanelController {
        let (address, title) = context.identity(slot);
        let display = if address.is_some() { DisplayState::Starting } else { DisplayState::NoAddress };

        PanelController {
            slot,
            title,
            address,
            source: None,
            stream: None,
            recording: Recording::Off,
            display,
            latest: None,
            context,
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn address(&self) -> Option<&CameraAddress> {
        self.address.as_ref()
    }

    pub fn display(&self) -> &DisplayState {
        &self.display
    }

    pub fn latest_frame(&self) -> Option<&Frame> {
        self.latest.as_ref()
    }

    pub fn source_id(&self) -> Option<SourceId> {
        self.source.as_ref().map(FrameSource::id)
    }

    pub fn stream_properties(&self) -> Option<StreamProperties> {
        self.stream
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.recording, Recording::Live(_))
    }

    pub fn recording_requested(&self) -> bool {
        !matches!(self.recording, Recording::Off)
    }

    pub fn recorder(&self) -> Option<&Recorder> {
        match &self.recording {
            Recording::Live(recorder) => Some(recorder),
            _ => None,
        }
    }

    /// Replaces the panel's identity, stopping whatever the old one had running.
    /// An empty title falls back to the slot's default. The panel is left idle;
    /// `start` connects to the new address.
    pub fn configure(&mut self, host: Option<&str>, title: Option<String>, presenter: &mut dyn Presenter) {
        self.stop_source();
        self.suspend_recording(presenter);

        let address = CameraAddress::new(host, &self.context.credentials, &self.context.stream_path);
        let title = title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| self.slot.default_title());

        info!(slot = %self.slot, title = %title, address = ?address.as_ref().map(ToString::to_string), "panel configured");
        self.address = address;
        self.title = title;

        if self.address.is_none() {
            self.set_display(DisplayState::NoAddress, presenter);
        }
    }

    /// Starts a capture thread if there is an address and no live source.
    pub fn start(&mut self, presenter: &mut dyn Presenter) {
        if self.source.is_some() {
            return;
        }

        let address = match &self.address {
            Some(address) => address.clone(),
            None => {
                self.set_display(DisplayState::NoAddress, presenter);
                return;
            },
        };

        let id = self.context.source_ids.next();
        let slot = self.slot;
        let events = self.context.events.clone();
        let mut source = FrameSource::new(id, address);

        let started = source.start(Arc::clone(&self.context.opener), move |event| {
            let _ = events.send(StationEvent::Source { slot, source: id, event });
        });

        match started {
            Ok(()) => {
                debug!(slot = %self.slot, source = %id, "capture thread started");
                self.source = Some(source);
                if self.display != DisplayState::Refreshing {
                    self.set_display(DisplayState::Starting, presenter);
                }
            },
            Err(e) => {
                warn!(slot = %self.slot, error = %e, "could not start capture thread");
                self.set_display(DisplayState::Error(e.to_string()), presenter);
            },
        }
    }

    /// Stops the live source, re-reads the device configuration and starts again.
    pub fn refresh(&mut self, presenter: &mut dyn Presenter) {
        info!(slot = %self.slot, "refreshing panel");
        self.set_display(DisplayState::Refreshing, presenter);

        self.stop_source();
        self.suspend_recording(presenter);

        let (address, title) = self.context.identity(self.slot);
        debug!(slot = %self.slot, address = ?address.as_ref().map(ToString::to_string), "address after refresh");
        self.address = address;
        self.title = title;

        self.start(presenter);
    }

    pub fn handle_source_event(&mut self, id: SourceId, event: SourceEvent, presenter: &mut dyn Presenter) {
        if self.source_id() != Some(id) {
            debug!(slot = %self.slot, source = %id, "discarding event from a replaced source");
            return;
        }

        match event {
            SourceEvent::ConnectionReady(properties) => self.on_connection_ready(properties, presenter),
            SourceEvent::Frame(frame) => self.on_frame(frame, presenter),
            SourceEvent::Unavailable(reason) => {
                self.stop_source();
                self.set_display(DisplayState::NotConnected, presenter);
                presenter.notify(Notification::SourceFailed { slot: self.slot, reason });
            },
            SourceEvent::Interrupted(reason) => {
                self.stop_source();
                self.suspend_recording(presenter);
                self.set_display(DisplayState::Error(reason.clone()), presenter);
                presenter.notify(Notification::SourceFailed { slot: self.slot, reason });
            },
        }
    }

    fn on_connection_ready(&mut self, properties: StreamProperties, presenter: &mut dyn Presenter) {
        info!(slot = %self.slot, width = properties.width, height = properties.height, fps = properties.fps, "camera connected");
        self.stream = Some(properties);
        self.set_display(DisplayState::Live, presenter);
        presenter.notify(Notification::ConnectionReady { slot: self.slot, properties });

        if let Recording::Pending = self.recording {
            debug!(slot = %self.slot, "starting recording requested before the connection was ready");
            self.begin_recording(presenter);
        }
    }

    fn on_frame(&mut self, frame: Frame, presenter: &mut dyn Presenter) {
        let writer_ended = match &self.recording {
            Recording::Live(recorder) => {
                recorder.enqueue(frame.clone());
                recorder.state() == RecorderState::Finished
            },
            _ => false,
        };

        if writer_ended {
            // the encoder gave up; do not reopen a file on every frame
            self.stop_recording(presenter);
        }

        self.latest = Some(frame.clone());
        presenter.notify(Notification::FrameReady { slot: self.slot, frame });
    }

    /// Records now if the connection is ready, otherwise as soon as it is.
    pub fn start_recording(&mut self, presenter: &mut dyn Presenter) {
        if self.is_recording() {
            return;
        }

        if self.stream.is_some() {
            self.begin_recording(presenter);
            return;
        }

        if self.address.is_none() {
            warn!(slot = %self.slot, "no video address for recording");
        } else {
            debug!(slot = %self.slot, "no video capture for recording yet");
        }
        self.recording = Recording::Pending;
    }

    fn begin_recording(&mut self, presenter: &mut dyn Presenter) {
        let properties = match self.stream {
            Some(properties) => properties,
            None => return,
        };

        let factory = &self.context.writer_factory;
        let name = recordings::file_name(&self.title, &Local::now(), factory.extension());
        let settings = RecordingSettings {
            path: self.context.recordings_dir.join(name),
            fps: properties.recording_fps(),
            width: properties.width,
            height: properties.height,
            label: self.title.clone(),
        };

        let recorder = factory.create(&settings)
            .map_err(|e| e.to_string())
            .and_then(|writer| Recorder::start(settings.clone(), writer).map_err(|e| e.to_string()));

        match recorder {
            Ok(recorder) => {
                info!(slot = %self.slot, path = %settings.path.display(), "started recording");
                self.recording = Recording::Live(recorder);
                presenter.notify(Notification::RecordingStarted { slot: self.slot, path: settings.path });
            },
            Err(reason) => {
                warn!(slot = %self.slot, path = %settings.path.display(), error = %reason, "could not start recording");
                self.recording = Recording::Off;
            },
        }
    }

    /// Ends the live session, if any, and forgets a pending request. Safe to repeat.
    pub fn stop_recording(&mut self, presenter: &mut dyn Presenter) {
        if let Recording::Live(mut recorder) = mem::replace(&mut self.recording, Recording::Off) {
            let summary = recorder.stop();
            info!(slot = %self.slot, path = %summary.path.display(), frames = summary.frames_written, "stopped recording");
            presenter.notify(Notification::RecordingStopped { slot: self.slot, summary });
        }
    }

    /// Stops source and recording and waits for both. The panel can be started again.
    pub fn teardown(&mut self, presenter: &mut dyn Presenter) {
        self.stop_source();
        self.stop_recording(presenter);
        self.latest = None;
        self.set_display(DisplayState::Closed, presenter);
        info!(slot = %self.slot, "panel closed");
    }

    /// Ends a live session because its connection went away. The request stays,
    /// so the next connection opens a new file.
    fn suspend_recording(&mut self, presenter: &mut dyn Presenter) {
        if self.is_recording() {
            self.stop_recording(presenter);
            self.recording = Recording::Pending;
        }
    }

    /// Joins the capture thread; the connection is released when this returns.
    fn stop_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
        self.stream = None;
    }

    fn set_display(&mut self, state: DisplayState, presenter: &mut dyn Presenter) {
        if self.display == state {
            return;
        }

        self.display = state.clone();
        presenter.notify(Notification::DisplayChanged { slot: self.slot, title: self.title.clone(), state });
    }
}

impl Drop for PanelController {
    fn drop(&mut self) {
        self.stop_source();
        if let Recording::Live(recorder) = &mut self.recording {
            recorder.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceTable;
    use crate::connection::TestPatternConnector;
    use crate::frame_writer::RecordingFormat;
    use crate::opener::ThreadProbe;
    use std::sync::mpsc::{self, Receiver};
    use std::time::{Duration, Instant};

    struct Harness {
        panel: PanelController,
        devices: Arc<DeviceTable>,
        events: Receiver<StationEvent>,
        seen: Vec<Notification>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(host: &str) -> Harness {
            let dir = tempfile::tempdir().unwrap();
            let connector = Arc::new(TestPatternConnector::new(StreamProperties::new(32, 24, 100.0)));
            let opener = ConnectionOpener::new(Arc::new(ThreadProbe::new(connector.clone())), connector)
                .with_timeout(Duration::from_secs(2));
            let devices = Arc::new(DeviceTable::new());
            let slot = Slot::new(1).unwrap();
            devices.set(slot, host, "");

            let (sender, events) = mpsc::channel();
            let context = Arc::new(PanelContext {
                opener: Arc::new(opener),
                devices: devices.clone(),
                credentials: Credentials::new("u", "p"),
                stream_path: "stream".to_owned(),
                recordings_dir: dir.path().to_path_buf(),
                writer_factory: Arc::new(RecordingFormat::Mjpeg),
                events: sender,
                source_ids: SourceIdGenerator::new(),
            });

            Harness { panel: PanelController::new(slot, context), devices, events, seen: Vec::new(), _dir: dir }
        }

        fn pump_until(&mut self, mut done: impl FnMut(&PanelController, &[Notification]) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done(&self.panel, &self.seen) {
                assert!(Instant::now() < deadline, "panel never reached the expected state");
                if let Ok(StationEvent::Source { source, event, .. }) = self.events.recv_timeout(Duration::from_millis(50)) {
                    let seen = &mut self.seen;
                    self.panel.handle_source_event(source, event, &mut |n: Notification| seen.push(n));
                }
            }
        }

        fn with_presenter<T>(&mut self, f: impl FnOnce(&mut PanelController, &mut dyn Presenter) -> T) -> T {
            let seen = &mut self.seen;
            f(&mut self.panel, &mut |n: Notification| seen.push(n))
        }
    }

    #[test]
    fn title_defaults_to_slot_number() {
        let harness = Harness::new("10.0.0.5");
        assert_eq!(harness.panel.title(), "Panel 2");
        assert_eq!(harness.panel.address().unwrap().host(), "10.0.0.5");
    }

    #[test]
    fn no_address_never_connects() {
        let mut harness = Harness::new("");
        harness.with_presenter(|panel, p| panel.start(p));

        assert_eq!(harness.panel.source_id(), None);
        assert_eq!(*harness.panel.display(), DisplayState::NoAddress);
        assert_eq!(harness.panel.display().to_string(), "Does not have an assigned IP address.");
        assert!(harness.events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn recording_requested_early_starts_on_connection() {
        let mut harness = Harness::new("10.0.0.5");
        harness.with_presenter(|panel, p| {
            panel.start_recording(p);
            panel.start(p);
        });
        assert!(harness.panel.recording_requested());
        assert!(!harness.panel.is_recording());

        harness.pump_until(|panel, _| panel.is_recording());
        harness.pump_until(|panel, _| panel.recorder().map_or(false, |r| r.frames_written() >= 2));

        harness.with_presenter(|panel, p| panel.stop_recording(p));
        let stopped = harness.seen.iter().filter(|n| matches!(n, Notification::RecordingStopped { .. })).count();
        assert_eq!(stopped, 1);
        assert!(!harness.panel.recording_requested());
    }

    #[test]
    fn stop_recording_twice_is_a_no_op() {
        let mut harness = Harness::new("10.0.0.5");
        harness.with_presenter(|panel, p| {
            panel.stop_recording(p);
            panel.stop_recording(p);
        });

        assert!(harness.seen.is_empty());
        assert!(recordings::list(&harness.panel.context.recordings_dir, "mjpeg").unwrap().is_empty());
    }

    #[test]
    fn refresh_picks_up_new_configuration() {
        let mut harness = Harness::new("10.0.0.5");
        harness.with_presenter(|panel, p| panel.start(p));
        harness.pump_until(|panel, _| panel.latest_frame().is_some());
        let old = harness.panel.source_id();

        harness.devices.set(harness.panel.slot(), "10.0.0.9", "Loading Dock");
        harness.with_presenter(|panel, p| panel.refresh(p));

        assert_ne!(harness.panel.source_id(), old);
        assert_eq!(harness.panel.title(), "Loading Dock");
        assert_eq!(harness.panel.address().unwrap().host(), "10.0.0.9");
        harness.pump_until(|panel, _| *panel.display() == DisplayState::Live);
    }

    #[test]
    fn teardown_closes_panel() {
        let mut harness = Harness::new("10.0.0.5");
        harness.with_presenter(|panel, p| {
            panel.start(p);
            panel.start_recording(p);
        });
        harness.pump_until(|panel, _| panel.is_recording());

        harness.with_presenter(|panel, p| panel.teardown(p));

        assert_eq!(harness.panel.source_id(), None);
        assert!(!harness.panel.is_recording());
        assert_eq!(*harness.panel.display(), DisplayState::Closed);
        assert!(harness.seen.iter().any(|n| matches!(n, Notification::RecordingStopped { .. })));
    }
}
