use crate::event::LogEvent;
use crate::formatter::JsonFormatter;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// `tracing_subscriber` layer that renders every event it sees as one
/// JSON line and writes it through a [`MakeWriter`].
///
/// Formatting and writing happen synchronously on the thread that emitted
/// the event, so the scoped context read by the formatter is the
/// emitter's own. Level filtering is left to the surrounding subscriber
/// (see [`crate::init`]).
pub struct JsonLayer<W = fn() -> io::Stdout> {
    formatter: JsonFormatter,
    make_writer: W,
    /// Events observed by the layer.
    pub total_events: Arc<AtomicU64>,
    /// Lines written successfully.
    pub written_events: Arc<AtomicU64>,
    /// Lines lost because the writer returned an error.
    pub failed_writes: Arc<AtomicU64>,
}

impl JsonLayer {
    /// Layer writing to stdout.
    pub fn new(formatter: JsonFormatter) -> Self {
        Self {
            formatter,
            make_writer: io::stdout,
            total_events: Arc::new(AtomicU64::new(0)),
            written_events: Arc::new(AtomicU64::new(0)),
            failed_writes: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<W> JsonLayer<W> {
    /// Replace the destination, keeping the formatter and counters.
    pub fn with_writer<W2>(self, make_writer: W2) -> JsonLayer<W2>
    where
        W2: for<'w> MakeWriter<'w> + 'static,
    {
        JsonLayer {
            formatter: self.formatter,
            make_writer,
            total_events: self.total_events,
            written_events: self.written_events,
            failed_writes: self.failed_writes,
        }
    }

    pub fn formatter(&self) -> &JsonFormatter {
        &self.formatter
    }
}

impl<S, W> Layer<S> for JsonLayer<W>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let record = LogEvent::from_tracing(event);
        let mut line = self.formatter.format(&record);
        line.push('\n');

        let mut writer = self.make_writer.make_writer_for(event.metadata());
        match writer.write_all(line.as_bytes()).and_then(|()| writer.flush()) {
            Ok(()) => {
                self.written_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
                eprintln!("error writing log line: {}", e);
            }
        }
    }
}
