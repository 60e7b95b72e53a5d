//! The station: four panels, the interactive event loop and the global commands.

use crate::config::DeviceConfig;
use crate::frame_writer::WriterFactory;
use crate::message::{Command, Notification, Presenter, Scope, StationEvent};
use crate::opener::ConnectionOpener;
use crate::panel::{PanelContext, PanelController};
use station_types::{Credentials, Slot, SourceIdGenerator};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_REFRESH_COOLDOWN: Duration = Duration::from_secs(4);

/// Rejects a second trigger within `interval` of the last accepted one.
#[derive(Debug)]
pub struct Cooldown {
    interval: Duration,
    last: Option<Instant>,
}

impl Cooldown {
    pub fn new(interval: Duration) -> Cooldown {
        Cooldown { interval, last: None }
    }

    pub fn try_begin(&mut self, now: Instant) -> bool {
        if self.remaining(now) > Duration::from_secs(0) {
            return false;
        }
        self.last = Some(now);
        true
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self.interval.checked_sub(now.saturating_duration_since(last)).unwrap_or_default(),
            None => Duration::from_secs(0),
        }
    }
}

/// Everything a station is built from.
pub struct StationSetup {
    pub opener: ConnectionOpener,
    pub devices: Arc<dyn DeviceConfig>,
    pub credentials: Credentials,
    pub stream_path: String,
    pub recordings_dir: PathBuf,
    pub writer_factory: Arc<dyn WriterFactory>,
    pub refresh_cooldown: Duration,
}

/// Posts commands to a running station from any thread.
#[derive(Clone)]
pub struct StationHandle {
    sender: Sender<StationEvent>,
}

impl StationHandle {
    /// `false` once the station has gone away.
    pub fn send(&self, command: Command) -> bool {
        self.sender.send(StationEvent::Command(command)).is_ok()
    }
}

pub struct Station {
    panels: Vec<PanelController>,
    devices: Arc<dyn DeviceConfig>,
    events: Receiver<StationEvent>,
    sender: Sender<StationEvent>,
    recording: bool,
    refresh_cooldown: Cooldown,
    refresh_in_flight: bool,
    running: bool,
}

impl Station {
    pub fn new(setup: StationSetup) -> Station {
        let (sender, events) = mpsc::channel();
        let devices = Arc::clone(&setup.devices);

        let context = Arc::new(PanelContext {
            opener: Arc::new(setup.opener),
            devices: setup.devices,
            credentials: setup.credentials,
            stream_path: setup.stream_path,
            recordings_dir: setup.recordings_dir,
            writer_factory: setup.writer_factory,
            events: sender.clone(),
            source_ids: SourceIdGenerator::new(),
        });

        let panels = Slot::all()
            .map(|slot| PanelController::new(slot, Arc::clone(&context)))
            .collect();

        Station {
            panels,
            devices,
            events,
            sender,
            recording: false,
            refresh_cooldown: Cooldown::new(setup.refresh_cooldown),
            refresh_in_flight: false,
            running: true,
        }
    }

    pub fn handle(&self) -> StationHandle {
        StationHandle { sender: self.sender.clone() }
    }

    pub fn panels(&self) -> &[PanelController] {
        &self.panels
    }

    pub fn panel(&self, slot: Slot) -> &PanelController {
        &self.panels[slot.index()]
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.refresh_in_flight
    }

    /// Starts every configured panel, as at application start.
    pub fn start_all(&mut self, presenter: &mut dyn Presenter) {
        for panel in &mut self.panels {
            panel.start(presenter);
        }
    }

    /// Processes events until a shutdown command, then tears everything down.
    pub fn run(&mut self, presenter: &mut dyn Presenter) {
        while self.running {
            match self.events.recv() {
                Ok(event) => self.dispatch(event, presenter),
                Err(_) => break,
            }
        }
        self.shutdown(presenter);
    }

    /// Handles at most one event, waiting up to `wait` for it to arrive.
    pub fn pump(&mut self, presenter: &mut dyn Presenter, wait: Duration) -> bool {
        match self.events.recv_timeout(wait) {
            Ok(event) => {
                self.dispatch(event, presenter);
                true
            },
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn dispatch(&mut self, event: StationEvent, presenter: &mut dyn Presenter) {
        match event {
            StationEvent::Source { slot, source, event } => {
                self.panels[slot.index()].handle_source_event(source, event, presenter);
                self.update_recording_flag(presenter);
            },
            StationEvent::Command(command) => self.execute(command, presenter),
            StationEvent::RefreshAllFinished => {
                self.refresh_in_flight = false;
                info!("refresh of all panels dispatched");
                presenter.notify(Notification::RefreshAllFinished);
            },
        }
    }

    pub fn execute(&mut self, command: Command, presenter: &mut dyn Presenter) {
        if !self.running {
            debug!(?command, "station is shut down, ignoring command");
            return;
        }

        match command {
            Command::Configure { slot, host, title } => self.configure(slot, host.as_deref(), title, presenter),
            Command::Start(slot) => self.panels[slot.index()].start(presenter),
            Command::Stop(slot) => self.panels[slot.index()].teardown(presenter),
            Command::Refresh(slot) => self.panels[slot.index()].refresh(presenter),
            Command::RefreshAll => {
                self.refresh_all();
            },
            Command::StartRecording(scope) => self.start_recording(scope, presenter),
            Command::StopRecording(scope) => self.stop_recording(scope, presenter),
            Command::ToggleRecording => self.toggle_recording(presenter),
            Command::Shutdown => self.shutdown(presenter),
        }
    }

    /// Stores a slot's new camera, then restarts the panel on it. Later refreshes
    /// read the stored device back.
    pub fn configure(&mut self, slot: Slot, host: Option<&str>, title: Option<String>, presenter: &mut dyn Presenter) {
        let (host, title) = match self.devices.store_device(slot, host.unwrap_or(""), title.as_deref().unwrap_or("")) {
            Ok(device) => (Some(device.host).filter(|h| !h.is_empty()), Some(device.name)),
            Err(e) => {
                warn!(%slot, error = %e, "could not store device, using it for this session only");
                (host.map(str::to_owned), title)
            },
        };

        let panel = &mut self.panels[slot.index()];
        panel.configure(host.as_deref(), title, presenter);
        panel.start(presenter);
    }

    /// Queues a refresh of every panel from a background thread. Returns `false`
    /// while the cooldown from the previous call is still running.
    pub fn refresh_all(&mut self) -> bool {
        let now = Instant::now();
        if !self.refresh_cooldown.try_begin(now) {
            info!(remaining = ?self.refresh_cooldown.remaining(now), "refresh is cooling down");
            return false;
        }

        self.refresh_in_flight = true;
        let sender = self.sender.clone();

        let spawned = thread::Builder::new()
            .name("refresh all".to_owned())
            .spawn(move || {
                for slot in Slot::all() {
                    if sender.send(StationEvent::Command(Command::Refresh(slot))).is_err() {
                        return;
                    }
                }
                let _ = sender.send(StationEvent::RefreshAllFinished);
            });

        if let Err(e) = spawned {
            warn!(error = %e, "could not start refresh thread, refreshing inline");
            for slot in Slot::all() {
                let _ = self.sender.send(StationEvent::Command(Command::Refresh(slot)));
            }
            let _ = self.sender.send(StationEvent::RefreshAllFinished);
        }
        true
    }

    pub fn toggle_recording(&mut self, presenter: &mut dyn Presenter) {
        if self.recording {
            debug!("trying to stop recording");
            self.stop_recording(Scope::All, presenter);
        } else {
            self.start_recording(Scope::All, presenter);
        }
    }

    pub fn start_recording(&mut self, scope: Scope, presenter: &mut dyn Presenter) {
        for panel in self.panels.iter_mut().filter(|p| scope.includes(p.slot())) {
            panel.start_recording(presenter);
        }
        self.update_recording_flag(presenter);
    }

    pub fn stop_recording(&mut self, scope: Scope, presenter: &mut dyn Presenter) {
        for panel in self.panels.iter_mut().filter(|p| scope.includes(p.slot())) {
            panel.stop_recording(presenter);
        }
        self.update_recording_flag(presenter);
    }

    fn update_recording_flag(&mut self, presenter: &mut dyn Presenter) {
        let recording = self.panels.iter().any(PanelController::recording_requested);
        if recording != self.recording {
            self.recording = recording;
            presenter.notify(Notification::RecordingToggled { recording });
        }
    }

    /// Tears down every panel. Further commands are ignored.
    pub fn shutdown(&mut self, presenter: &mut dyn Presenter) {
        if !self.running {
            return;
        }

        info!("shutting down station");
        for panel in &mut self.panels {
            panel.teardown(presenter);
        }
        self.running = false;
        self.update_recording_flag(presenter);
    }
}
