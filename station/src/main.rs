use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use station::connection::Connector;
use station::config::{configured_slots, ConfigFile, DeviceConfig, StationConfig, DEFAULT_CONFIG_FILE};
use station::frame_writer::WriterFactory;
use station::message::{Command, Notification, Presenter};
use station::opener::{self, ConnectionOpener, ProcessProbe};
use station::station::{Station, StationHandle, StationSetup};
use station::{logging, recordings};
use station_types::{CameraAddress, Slot, MAX_SLOTS};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use tracing::info;

#[derive(Parser)]
#[command(name = "station", about = "Four-camera monitoring and recording station")]
struct Cli {
    /// Settings and device table
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cameras and take commands from stdin (the default)
    Run,
    /// Assign a camera to a slot
    Configure {
        #[arg(long)]
        slot: usize,
        /// IP address; anything else leaves the slot without a camera
        #[arg(long, default_value = "")]
        host: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Forget every configured camera
    ClearConfig,
    /// List finished recordings, newest first
    Recordings,
    /// Connection probe worker, run by the station itself
    #[command(hide = true)]
    Probe,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = ConfigFile::new(&cli.config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.config, file),
        Commands::Configure { slot, host, name } => {
            let device = file.save_device(slot, &host, &name)
                .with_context(|| format!("saving slot {} to {}", slot, cli.config.display()))?;
            if device.host.is_empty() && !host.trim().is_empty() {
                println!("{} is not an IP address, slot {} has no camera", host.trim(), slot);
            }
            Ok(())
        },
        Commands::ClearConfig => file.clear_devices()
            .with_context(|| format!("clearing {}", cli.config.display())),
        Commands::Recordings => {
            let config = file.load().context("reading configuration")?;
            let dir = &config.station.recordings_dir;
            for path in recordings::list(dir, config.station.recording_format.extension())
                .with_context(|| format!("listing {}", dir.display()))?
            {
                println!("{}", path.display());
            }
            Ok(())
        },
        Commands::Probe => probe(&file),
    }
}

/// Exits 0 if the camera in `PROBE_URL_ENV` opens, 1 otherwise.
fn probe(file: &ConfigFile) -> Result<()> {
    let config = file.load().unwrap_or_default();
    let opened = env::var(opener::PROBE_URL_ENV).ok()
        .and_then(|url| CameraAddress::from_url(&url))
        .map_or(false, |address| config.station.backend.connector().connect(&address).is_ok());

    process::exit(if opened { 0 } else { 1 })
}

fn run(config_path: &Path, file: ConfigFile) -> Result<()> {
    let config: StationConfig = file.load()
        .with_context(|| format!("reading {}", config_path.display()))?;
    logging::init(&config.log).context("setting up logging")?;

    let settings = &config.station;
    fs::create_dir_all(&settings.recordings_dir)
        .with_context(|| format!("creating {}", settings.recordings_dir.display()))?;

    let probe = ProcessProbe::current_exe(vec![OsString::from("--config"), config_path.as_os_str().to_owned(), OsString::from("probe")])
        .context("locating the station executable")?;
    let opener = ConnectionOpener::new(Arc::new(probe), settings.backend.connector())
        .with_timeout(settings.open_timeout());

    let devices: Arc<dyn DeviceConfig> = Arc::new(file);
    info!(cameras = configured_slots(&*devices), backend = ?settings.backend, format = ?settings.recording_format, "starting station");

    let mut station = Station::new(StationSetup {
        opener,
        devices,
        credentials: settings.credentials(),
        stream_path: settings.stream_path.clone(),
        recordings_dir: settings.recordings_dir.clone(),
        writer_factory: Arc::new(settings.recording_format),
        refresh_cooldown: settings.refresh_cooldown(),
    });

    read_commands(station.handle())
        .context("starting the command reader")?;

    let mut presenter = ConsolePresenter::default();
    station.start_all(&mut presenter);
    station.run(&mut presenter);
    info!("station closed");
    Ok(())
}

/// Turns stdin lines into commands. End of input shuts the station down.
fn read_commands(handle: StationHandle) -> io::Result<()> {
    thread::Builder::new()
        .name("commands".to_owned())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                if line.trim().is_empty() {
                    continue;
                }

                let command = match line.parse::<Command>() {
                    Ok(command) => command,
                    Err(e) => {
                        eprintln!("{}", e);
                        continue;
                    },
                };
                if !handle.send(command) {
                    return;
                }
            }
            handle.send(Command::Shutdown);
        })?;
    Ok(())
}

/// Logs what a screen would show, and counts frames per panel.
#[derive(Default)]
struct ConsolePresenter {
    frames: [u64; MAX_SLOTS],
}

impl Presenter for ConsolePresenter {
    fn notify(&mut self, notification: Notification) {
        match notification {
            Notification::FrameReady { slot, .. } => {
                self.frames[slot.index()] += 1;
            },
            Notification::ConnectionReady { slot, properties } => {
                info!(%slot, width = properties.width, height = properties.height, fps = properties.fps, "live");
            },
            Notification::SourceFailed { slot, reason } => {
                info!(%slot, frames = self.frames[slot.index()], %reason, "video stopped");
            },
            Notification::DisplayChanged { slot, title, state } => {
                info!(%slot, "{}: {}", title, state);
            },
            Notification::RecordingStarted { slot, path } => {
                info!(%slot, path = %path.display(), "recording");
            },
            Notification::RecordingStopped { slot, summary } => {
                info!(%slot, path = %summary.path.display(), frames = summary.frames_written, dropped = summary.frames_dropped, "recording saved");
            },
            Notification::RecordingToggled { recording } => {
                info!(recording, "{}", if recording { "Stop Recording" } else { "Start Recording" });
            },
            Notification::RefreshAllFinished => {
                let panels: Vec<_> = Slot::all().map(|slot| self.frames[slot.index()]).collect();
                info!(?panels, "refresh finished");
            },
        }
    }
}
