//! Time-bounded connection opening.
//!
//! Camera drivers can hang forever inside their open call. Before touching a
//! camera from the capture thread, the opener runs a liveness probe somewhere
//! that can be abandoned (a child process or a detached thread), waits at most
//! `timeout` for it, and only then opens the real connection.

use crate::connection::{Connection, Connector};
use crate::error::ConnectError;
use station_types::CameraAddress;
use std::cell::Cell;
use std::env;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Set in the environment of probe child processes.
pub const PROBE_WORKER_ENV: &str = "STATION_PROBE_WORKER";
/// Carries the camera URL into probe child processes.
pub const PROBE_URL_ENV: &str = "STATION_PROBE_URL";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

thread_local! {
    static IN_PROBE_THREAD: Cell<bool> = Cell::new(false);
}

/// True inside a probe worker, thread or process.
pub fn in_probe_worker() -> bool {
    IN_PROBE_THREAD.with(Cell::get) || env::var_os(PROBE_WORKER_ENV).is_some()
}

/// Starts an isolated connection attempt.
pub trait Probe: Send + Sync {
    fn spawn(&self, address: &CameraAddress) -> io::Result<Box<dyn ProbeHandle>>;
}

/// A running probe.
pub trait ProbeHandle: Send {
    /// `Some(true)` once the camera answered, `Some(false)` if it refused, `None` while still running.
    fn try_finish(&mut self) -> io::Result<Option<bool>>;

    /// Forcefully end the attempt. Must not block on the attempt itself.
    fn terminate(&mut self) -> io::Result<()>;
}

/// Runs the probe in a child process that can be killed on timeout.
///
/// The address travels in `PROBE_URL_ENV`; a zero exit status means the camera opened.
pub struct ProcessProbe {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessProbe {
    pub fn new(program: impl Into<PathBuf>) -> ProcessProbe {
        ProcessProbe { program: program.into(), args: Vec::new() }
    }

    /// Re-runs the current executable with `args` (its probe subcommand).
    pub fn current_exe<I, S>(args: I) -> io::Result<ProcessProbe>
        where I: IntoIterator<Item=S>, S: Into<OsString>
    {
        let mut probe = ProcessProbe::new(env::current_exe()?);
        probe.args = args.into_iter().map(Into::into).collect();
        Ok(probe)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> ProcessProbe {
        self.args.push(arg.into());
        self
    }
}

impl Probe for ProcessProbe {
    fn spawn(&self, address: &CameraAddress) -> io::Result<Box<dyn ProbeHandle>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(PROBE_WORKER_ENV, "1")
            .env(PROBE_URL_ENV, address.url())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()?;

        debug!(pid = child.id(), %address, "spawned probe process");
        Ok(Box::new(ProcessProbeHandle { child }))
    }
}

struct ProcessProbeHandle {
    child: Child,
}

impl ProbeHandle for ProcessProbeHandle {
    fn try_finish(&mut self) -> io::Result<Option<bool>> {
        Ok(self.child.try_wait()?.map(|status| status.success()))
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill()?;
        }
        // reap so the process is really gone when this returns
        self.child.wait()?;
        Ok(())
    }
}

/// Runs the probe on a detached thread. On timeout the thread is abandoned.
pub struct ThreadProbe {
    connector: Arc<dyn Connector>,
}

impl ThreadProbe {
    pub fn new(connector: Arc<dyn Connector>) -> ThreadProbe {
        ThreadProbe { connector }
    }
}

impl Probe for ThreadProbe {
    fn spawn(&self, address: &CameraAddress) -> io::Result<Box<dyn ProbeHandle>> {
        let (sender, receiver) = mpsc::channel();
        let connector = Arc::clone(&self.connector);
        let address = address.clone();

        thread::Builder::new()
            .name(format!("probe {}", address.host()))
            .spawn(move || {
                IN_PROBE_THREAD.with(|flag| flag.set(true));
                let opened = connector.connect(&address).is_ok();
                // the probe's own connection is dropped before reporting
                let _ = sender.send(opened);
            })?;

        Ok(Box::new(ThreadProbeHandle { receiver: Some(receiver) }))
    }
}

struct ThreadProbeHandle {
    receiver: Option<Receiver<bool>>,
}

impl ProbeHandle for ThreadProbeHandle {
    fn try_finish(&mut self) -> io::Result<Option<bool>> {
        let receiver = match &self.receiver {
            Some(receiver) => receiver,
            None => return Ok(Some(false)),
        };

        match receiver.try_recv() {
            Ok(opened) => Ok(Some(opened)),
            Err(TryRecvError::Empty) => Ok(None),
            // the worker died without reporting
            Err(TryRecvError::Disconnected) => Ok(Some(false)),
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.receiver = None;
        Ok(())
    }
}

pub struct ConnectionOpener {
    probe: Arc<dyn Probe>,
    connector: Arc<dyn Connector>,
    timeout: Duration,
}

impl ConnectionOpener {
    pub fn new(probe: Arc<dyn Probe>, connector: Arc<dyn Connector>) -> ConnectionOpener {
        ConnectionOpener { probe, connector, timeout: DEFAULT_OPEN_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> ConnectionOpener {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Blocks for at most `timeout` on the probe, then opens the connection for real.
    pub fn open(&self, address: &CameraAddress) -> Result<Box<dyn Connection>, ConnectError> {
        if in_probe_worker() {
            return Err(ConnectError::Nested);
        }

        let mut handle = self.probe.spawn(address).map_err(ConnectError::Probe)?;
        let deadline = Instant::now() + self.timeout;

        loop {
            match handle.try_finish() {
                Ok(Some(true)) => break,
                Ok(Some(false)) => return Err(ConnectError::Refused { address: address.to_string() }),
                Ok(None) => {},
                Err(e) => {
                    if let Err(kill) = handle.terminate() {
                        warn!(%address, error = %kill, "could not stop the connection check");
                    }
                    return Err(ConnectError::Probe(e));
                },
            }

            let now = Instant::now();
            if now >= deadline {
                if let Err(e) = handle.terminate() {
                    warn!(%address, error = %e, "could not stop the connection check");
                }
                info!(%address, timeout = ?self.timeout, "timeout occurred while opening camera");
                return Err(ConnectError::Timeout { address: address.to_string(), timeout: self.timeout });
            }

            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }

        debug!(%address, "probe succeeded, opening connection");
        self.connector.connect(address)
    }
}
