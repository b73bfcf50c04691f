use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Formats every event as `[2024-05-01T12:30:05.123Z] message`.
pub struct EventLine;

impl<S, N> FormatEvent<S, N> for EventLine
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "[{}] ", timestamp(Utc::now()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Logs to stdout and appends the same lines to `log_file`.
pub fn init(log_file: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().event_format(EventLine))
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(EventLine)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io;
    use std::sync::Arc;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn timestamps_are_iso_8601_with_millis() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(timestamp(at), "2024-05-01T12:30:05.123Z");
    }

    #[test]
    fn events_are_written_as_bracketed_lines() {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .event_format(EventLine)
                .with_ansi(false)
                .with_writer(buffer.clone()),
        );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Configuration saved successfully.");
        });

        let written = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(written.starts_with('['));
        assert!(written.ends_with("Z] Configuration saved successfully.\n"));
        assert_eq!(written.lines().count(), 1);
    }
}
