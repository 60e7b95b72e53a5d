//! Subscriber setup: a console layer filtered by `RUST_LOG` (or the configured
//! level) and an optional CSV file that keeps INFO events only.

use crate::config::LogSettings;
use chrono::Local;
use std::fmt::{self, Write as _};
use std::fs::{self, OpenOptions};
use std::io;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

pub fn init(settings: &LogSettings) -> io::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console = subscriber_fmt::layer()
        .with_thread_names(true)
        .with_filter(env_filter);

    let csv = match &settings.csv_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;

            Some(subscriber_fmt::layer()
                .with_ansi(false)
                .event_format(CsvFormat)
                .with_writer(Mutex::new(file))
                .with_filter(filter_fn(|meta| *meta.level() == Level::INFO)))
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(csv)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// `"timestamp","target","level","message"`, one event per line.
struct CsvFormat;

impl<S, N> FormatEvent<S, N> for CsvFormat
    where S: Subscriber + for<'a> LookupSpan<'a>,
          N: for<'a> FormatFields<'a> + 'static
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let mut message = MessageVisitor::default();
        event.record(&mut message);

        let meta = event.metadata();
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S,%3f").to_string();
        writeln!(writer, "{}", csv_row(&[&timestamp, meta.target(), meta.level().as_str(), &message.text]))
    }
}

/// Collects the message followed by `key=value` for every other field.
#[derive(Default)]
struct MessageVisitor {
    text: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let fields = std::mem::take(&mut self.text);
            self.text = format!("{:?}{}", value, fields);
        } else {
            let _ = write!(self.text, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.text.insert_str(0, value);
        } else {
            let _ = write!(self.text, " {}={}", field.name(), value);
        }
    }
}

fn csv_row(fields: &[&str]) -> String {
    fields.iter()
        .map(|field| format!("\"{}\"", field.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(",")
}
