use crate::connection::Connection;
use crate::error::StreamError;
use crate::opener::ConnectionOpener;
use station_types::{CameraAddress, Frame, SourceId, StreamProperties};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SourceState {
    Idle,
    Opening,
    Streaming,
    Failed,
    Stopped,
}

impl SourceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SourceState::Failed | SourceState::Stopped)
    }

    fn from_u8(value: u8) -> SourceState {
        match value {
            0 => SourceState::Idle,
            1 => SourceState::Opening,
            2 => SourceState::Streaming,
            3 => SourceState::Failed,
            _ => SourceState::Stopped,
        }
    }
}

/// What a capture thread reports, in order.
#[derive(Debug)]
pub enum SourceEvent {
    /// The connection is open; recording sessions take their codec parameters from here.
    ConnectionReady(StreamProperties),
    Frame(Frame),
    /// The camera could not be opened. Terminal.
    Unavailable(String),
    /// A streaming connection stopped delivering frames. Terminal.
    Interrupted(String),
}

impl SourceEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceEvent::Unavailable(_) | SourceEvent::Interrupted(_))
    }
}

/// Owns one camera connection on its own capture thread.
///
/// An instance runs once: after it fails or is stopped a new one must be created.
pub struct FrameSource {
    id: SourceId,
    address: CameraAddress,
    state: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSource {
    pub fn new(id: SourceId, address: CameraAddress) -> FrameSource {
        FrameSource {
            id,
            address,
            state: Arc::new(AtomicU8::new(SourceState::Idle as u8)),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn address(&self) -> &CameraAddress {
        &self.address
    }

    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Spawns the capture thread. `emit` is called from that thread for every event.
    pub fn start<F>(&mut self, opener: Arc<ConnectionOpener>, emit: F) -> std::io::Result<()>
        where F: Fn(SourceEvent) + Send + 'static
    {
        if self.state() != SourceState::Idle {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        self.state.store(SourceState::Opening as u8, Ordering::SeqCst);

        let id = self.id;
        let address = self.address.clone();
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);

        let spawned = thread::Builder::new()
            .name(format!("capture {}", address.host()))
            .spawn(move || capture_loop(id, &address, &opener, &state, &running, &emit));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            },
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.state.store(SourceState::Failed as u8, Ordering::SeqCst);
                Err(e)
            },
        }
    }

    /// Asks the loop to exit at its next iteration and waits until it has,
    /// which also means the connection has been released.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(source = %self.id, "capture thread panicked");
                self.state.store(SourceState::Failed as u8, Ordering::SeqCst);
            }
        }

        if !self.state().is_terminal() {
            self.state.store(SourceState::Stopped as u8, Ordering::SeqCst);
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    id: SourceId,
    address: &CameraAddress,
    opener: &ConnectionOpener,
    state: &AtomicU8,
    running: &AtomicBool,
    emit: &dyn Fn(SourceEvent),
) {
    info!(source = %id, %address, "trying video capture");

    let mut connection = None;
    let ran = panic::catch_unwind(AssertUnwindSafe(|| {
        open_and_stream(id, address, opener, state, running, emit, &mut connection)
    }));

    let end = ran.unwrap_or_else(|_| {
        let streaming = state.load(Ordering::SeqCst) == SourceState::Streaming as u8;
        error!(source = %id, streaming, "exception in video thread");
        let reason = "camera backend panicked".to_owned();
        emit(if streaming { SourceEvent::Interrupted(reason) } else { SourceEvent::Unavailable(reason) });
        SourceState::Failed
    });

    // the only place the connection is released
    if let Some(connection) = connection.take() {
        drop(connection);
        info!(source = %id, "camera released");
    }
    state.store(end as u8, Ordering::SeqCst);
    info!(source = %id, state = ?end, "video thread stopped");
}

/// Opens the camera into `connection` and streams from it. Returns the terminal state.
fn open_and_stream(
    id: SourceId,
    address: &CameraAddress,
    opener: &ConnectionOpener,
    state: &AtomicU8,
    running: &AtomicBool,
    emit: &dyn Fn(SourceEvent),
    connection: &mut Option<Box<dyn Connection>>,
) -> SourceState {
    let opened = match opener.open(address) {
        Ok(opened) => connection.insert(opened),
        Err(e) => {
            warn!(source = %id, %address, error = %e, "failed to open video source");
            emit(SourceEvent::Unavailable(e.to_string()));
            return SourceState::Failed;
        },
    };

    if !running.load(Ordering::SeqCst) {
        info!(source = %id, "stopped while opening");
        return SourceState::Stopped;
    }

    opened.disable_buffering();
    let properties = opened.properties();
    state.store(SourceState::Streaming as u8, Ordering::SeqCst);
    emit(SourceEvent::ConnectionReady(properties));

    stream(id, &mut **opened, running, emit)
}

/// Pulls frames until asked to stop or the connection fails.
fn stream(id: SourceId, connection: &mut dyn Connection, running: &AtomicBool, emit: &dyn Fn(SourceEvent)) -> SourceState {
    while running.load(Ordering::SeqCst) {
        match connection.read_frame() {
            Ok(frame) => emit(SourceEvent::Frame(frame)),
            Err(StreamError::EndOfStream) => {
                debug!(source = %id, "frame read failed, end of stream");
                emit(SourceEvent::Interrupted(StreamError::EndOfStream.to_string()));
                return SourceState::Failed;
            },
            Err(e) => {
                warn!(source = %id, error = %e, "frame read failed");
                emit(SourceEvent::Interrupted(e.to_string()));
                return SourceState::Failed;
            },
        }
    }

    SourceState::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connector, TestPatternConnector};
    use crate::error::ConnectError;
    use crate::opener::{in_probe_worker, ThreadProbe};
    use station_types::{Credentials, SourceIdGenerator};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn address() -> CameraAddress {
        CameraAddress::new(Some("10.0.0.5"), &Credentials::new("u", "p"), "stream").unwrap()
    }

    fn opener(connector: Arc<dyn Connector>) -> Arc<ConnectionOpener> {
        Arc::new(ConnectionOpener::new(Arc::new(ThreadProbe::new(connector.clone())), connector)
            .with_timeout(Duration::from_secs(2)))
    }

    /// Every read fails; counts the attempts and the releases.
    struct BrokenCamera {
        reads: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl Connection for BrokenCamera {
        fn properties(&self) -> StreamProperties {
            StreamProperties::new(8, 8, 25.0)
        }

        fn read_frame(&mut self) -> Result<Frame, StreamError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(StreamError::Decode("corrupt packet".to_owned()))
        }
    }

    impl Drop for BrokenCamera {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct BrokenConnector {
        reads: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl Connector for BrokenConnector {
        fn connect(&self, _address: &CameraAddress) -> Result<Box<dyn Connection>, ConnectError> {
            Ok(Box::new(BrokenCamera { reads: self.reads.clone(), released: self.released.clone() }))
        }
    }

    struct PanickingCamera;

    impl Connection for PanickingCamera {
        fn properties(&self) -> StreamProperties {
            StreamProperties::new(8, 8, 25.0)
        }

        fn read_frame(&mut self) -> Result<Frame, StreamError> {
            panic!("driver bug")
        }
    }

    struct PanickingConnector;

    impl Connector for PanickingConnector {
        fn connect(&self, _address: &CameraAddress) -> Result<Box<dyn Connection>, ConnectError> {
            Ok(Box::new(PanickingCamera))
        }
    }

    fn run_until_terminal(source: &mut FrameSource, opener: Arc<ConnectionOpener>) -> Vec<SourceEvent> {
        let (sender, receiver) = mpsc::channel();
        source.start(opener, move |event| { let _ = sender.send(event); }).unwrap();

        let mut events = Vec::new();
        while let Ok(event) = receiver.recv_timeout(Duration::from_secs(5)) {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        source.stop();
        events
    }

    #[test]
    fn first_failed_read_is_terminal() {
        let connector = Arc::new(BrokenConnector::default());
        let mut source = FrameSource::new(SourceIdGenerator::new().next(), address());

        let events = run_until_terminal(&mut source, opener(connector.clone()));

        assert!(matches!(events[0], SourceEvent::ConnectionReady(_)));
        assert!(matches!(events[1], SourceEvent::Interrupted(_)));
        assert_eq!(events.len(), 2);
        assert_eq!(connector.reads.load(Ordering::SeqCst), 1);
        // the probe's connection plus the real one, each released once
        assert_eq!(connector.released.load(Ordering::SeqCst), 2);
        assert_eq!(source.state(), SourceState::Failed);
    }

    #[test]
    fn panicking_backend_is_contained() {
        let mut source = FrameSource::new(SourceIdGenerator::new().next(), address());

        let events = run_until_terminal(&mut source, opener(Arc::new(PanickingConnector)));

        assert!(matches!(events.last(), Some(SourceEvent::Interrupted(_))));
        assert_eq!(source.state(), SourceState::Failed);
    }

    /// Passes the liveness check, then panics when the capture thread opens for real.
    struct PanicsOnOpen;

    impl Connector for PanicsOnOpen {
        fn connect(&self, _address: &CameraAddress) -> Result<Box<dyn Connection>, ConnectError> {
            if !in_probe_worker() {
                panic!("driver crashed while opening");
            }
            Ok(Box::new(PanickingCamera))
        }
    }

    /// Opens fine but panics when asked to drop its buffer.
    struct PanicsOnSetup {
        released: Arc<AtomicUsize>,
    }

    impl Connection for PanicsOnSetup {
        fn properties(&self) -> StreamProperties {
            StreamProperties::new(8, 8, 25.0)
        }

        fn disable_buffering(&mut self) {
            panic!("unsupported option");
        }

        fn read_frame(&mut self) -> Result<Frame, StreamError> {
            Err(StreamError::EndOfStream)
        }
    }

    impl Drop for PanicsOnSetup {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct PanicsOnSetupConnector {
        released: Arc<AtomicUsize>,
    }

    impl Connector for PanicsOnSetupConnector {
        fn connect(&self, _address: &CameraAddress) -> Result<Box<dyn Connection>, ConnectError> {
            Ok(Box::new(PanicsOnSetup { released: self.released.clone() }))
        }
    }

    #[test]
    fn panic_while_opening_reports_unavailable() {
        let mut source = FrameSource::new(SourceIdGenerator::new().next(), address());

        let events = run_until_terminal(&mut source, opener(Arc::new(PanicsOnOpen)));

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SourceEvent::Unavailable(_)));
        assert_eq!(source.state(), SourceState::Failed);
    }

    #[test]
    fn panic_before_streaming_releases_the_connection() {
        let connector = Arc::new(PanicsOnSetupConnector::default());
        let mut source = FrameSource::new(SourceIdGenerator::new().next(), address());

        let events = run_until_terminal(&mut source, opener(connector.clone()));

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SourceEvent::Unavailable(_)));
        assert_eq!(source.state(), SourceState::Failed);
        // the liveness check's connection plus the real one, each released once
        assert_eq!(connector.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_releases_the_connection() {
        let connector = Arc::new(TestPatternConnector::new(StreamProperties::new(16, 16, 100.0)));
        let mut source = FrameSource::new(SourceIdGenerator::new().next(), address());
        let (sender, receiver) = mpsc::channel();

        source.start(opener(connector.clone()), move |event| { let _ = sender.send(event); }).unwrap();

        let mut frames = 0;
        while frames < 3 {
            if let SourceEvent::Frame(frame) = receiver.recv_timeout(Duration::from_secs(5)).unwrap() {
                assert_eq!(frame.image().dimensions(), (16, 16));
                frames += 1;
            }
        }
        assert_eq!(source.state(), SourceState::Streaming);

        source.stop();
        assert_eq!(source.state(), SourceState::Stopped);
        assert_eq!(connector.live_connections(), 0);
    }

    #[test]
    fn unreachable_camera_never_streams() {
        struct Unreachable;

        impl Connector for Unreachable {
            fn connect(&self, _address: &CameraAddress) -> Result<Box<dyn Connection>, ConnectError> {
                Err(ConnectError::Backend("no route to host".to_owned()))
            }
        }

        let mut source = FrameSource::new(SourceIdGenerator::new().next(), address());
        let events = run_until_terminal(&mut source, opener(Arc::new(Unreachable)));

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SourceEvent::Unavailable(_)));
        assert_eq!(source.state(), SourceState::Failed);
    }
}
