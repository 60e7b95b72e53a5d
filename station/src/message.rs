use crate::frame_source::SourceEvent;
use crate::recorder::RecordingSummary;
use station_types::{Frame, Slot, SourceId, StreamProperties};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Everything that reaches the interactive thread.
#[derive(Debug)]
pub enum StationEvent {
    Source { slot: Slot, source: SourceId, event: SourceEvent },
    Command(Command),
    RefreshAllFinished,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Scope {
    One(Slot),
    All,
}

impl Scope {
    pub fn includes(self, slot: Slot) -> bool {
        match self {
            Scope::One(one) => one == slot,
            Scope::All => true,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command {
    Configure { slot: Slot, host: Option<String>, title: Option<String> },
    Start(Slot),
    Stop(Slot),
    Refresh(Slot),
    RefreshAll,
    StartRecording(Scope),
    StopRecording(Scope),
    ToggleRecording,
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCommandError(String);

impl fmt::Display for ParseCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseCommandError {}

fn parse_slot(word: Option<&str>) -> Result<Slot, ParseCommandError> {
    let word = word.ok_or_else(|| ParseCommandError("missing slot".to_owned()))?;
    word.parse::<usize>().ok()
        .and_then(Slot::new)
        .ok_or_else(|| ParseCommandError(format!("no camera slot {}", word)))
}

fn parse_scope(word: Option<&str>) -> Result<Scope, ParseCommandError> {
    match word {
        None | Some("all") => Ok(Scope::All),
        slot => parse_slot(slot).map(Scope::One),
    }
}

/// The line syntax of the console command surface, e.g. `refresh 2` or `record`.
impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Command, ParseCommandError> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| ParseCommandError("empty command".to_owned()))?;

        let command = match verb {
            "start" => Command::Start(parse_slot(words.next())?),
            "stop" => Command::Stop(parse_slot(words.next())?),
            "refresh" => match words.next() {
                None | Some("all") => Command::RefreshAll,
                slot => Command::Refresh(parse_slot(slot)?),
            },
            "record" => match words.next() {
                None => Command::ToggleRecording,
                scope => Command::StartRecording(parse_scope(scope)?),
            },
            "stop-record" => Command::StopRecording(parse_scope(words.next())?),
            "configure" => {
                let slot = parse_slot(words.next())?;
                let host = words.next().filter(|h| *h != "-").map(str::to_owned);
                let title = words.collect::<Vec<_>>().join(" ");
                let title = if title.is_empty() { None } else { Some(title) };
                Command::Configure { slot, host, title }
            },
            "quit" | "exit" | "shutdown" => Command::Shutdown,
            other => return Err(ParseCommandError(format!("unknown command {:?}", other))),
        };

        Ok(command)
    }
}

/// What a panel is currently showing instead of (or along with) video.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DisplayState {
    NoAddress,
    Starting,
    Refreshing,
    Live,
    NotConnected,
    Error(String),
    Closed,
}

impl fmt::Display for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayState::NoAddress => write!(f, "Does not have an assigned IP address."),
            DisplayState::Starting => write!(f, "Starting camera..."),
            DisplayState::Refreshing => write!(f, "Refreshing..."),
            DisplayState::Live => write!(f, "Live"),
            DisplayState::NotConnected => write!(f, "Camera failed to open."),
            DisplayState::Error(reason) => write!(f, "Camera error: {}", reason),
            DisplayState::Closed => write!(f, "Closed"),
        }
    }
}

/// Outputs of the core, delivered on the interactive thread.
#[derive(Clone, Debug)]
pub enum Notification {
    FrameReady { slot: Slot, frame: Frame },
    ConnectionReady { slot: Slot, properties: StreamProperties },
    SourceFailed { slot: Slot, reason: String },
    RecordingStarted { slot: Slot, path: PathBuf },
    RecordingStopped { slot: Slot, summary: RecordingSummary },
    DisplayChanged { slot: Slot, title: String, state: DisplayState },
    RecordingToggled { recording: bool },
    RefreshAllFinished,
}

/// The presentation layer. Only ever called from the interactive thread.
pub trait Presenter {
    fn notify(&mut self, notification: Notification);
}

impl<F> Presenter for F where F: FnMut(Notification) {
    fn notify(&mut self, notification: Notification) {
        self(notification)
    }
}
