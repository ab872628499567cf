use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::cell::Cell;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::field::{Field, Visit};
use tracing::{Event, Level};

/// Attribute names every [`LogEvent`] carries by itself. Caller-supplied
/// extras never take these names in the rendered output.
pub const NATURAL_ATTRIBUTES: &[&str] = &[
    "timestamp",
    "level",
    "target",
    "module_path",
    "file",
    "line",
    "pid",
    "thread_id",
    "thread_name",
    "message",
    "exception",
];

/// Numeric rank of a level, on the usual 10-step scale.
pub fn level_rank(level: &Level) -> u32 {
    match *level {
        Level::TRACE => 5,
        Level::DEBUG => 10,
        Level::INFO => 20,
        Level::WARN => 30,
        _ => 40,
    }
}

/// Primary payload of a log call.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    /// Entries are lifted into the top level of the rendered object.
    Structured(Map<String, Value>),
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(s.to_string())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(s)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(m: Map<String, Value>) -> Self {
        Message::Structured(m)
    }
}

/// Error attached to a log call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    /// Outermost first: the error itself, then each `source()` in turn.
    pub frames: Vec<String>,
}

impl ExceptionInfo {
    /// Capture `err` with its concrete type name.
    pub fn from_error<E: Error + 'static>(err: &E) -> Self {
        Self::capture(std::any::type_name::<E>(), err)
    }

    /// Capture a type-erased error, as recorded by `tracing`. The type
    /// name is the leading identifier of its `Debug` form, usually the
    /// struct or variant name, or `Error` when there is none.
    pub fn from_dyn(err: &(dyn Error + 'static)) -> Self {
        let debug = format!("{:?}", err);
        let name: String = debug
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
            .collect();
        let name = name.trim_matches(':');
        Self::capture(if name.is_empty() { "Error" } else { name }, err)
    }

    fn capture(type_name: &str, err: &(dyn Error + 'static)) -> Self {
        let message = err.to_string();
        let mut frames = vec![format!("{}: {}", type_name, message)];
        let mut source = err.source();
        while let Some(cause) = source {
            frames.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        Self {
            type_name: type_name.to_string(),
            message,
            frames,
        }
    }

    /// One-line description, `Type: message`.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.type_name, self.message)
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Small process-unique number for the calling thread, assigned on first use.
pub fn current_thread_id() -> u64 {
    THREAD_ID
        .try_with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        })
        .unwrap_or(0)
}

fn current_thread_name(id: u64) -> String {
    match std::thread::current().name() {
        Some(name) => name.to_string(),
        None => format!("Thread-{}", id),
    }
}

/// Snapshot of one logging call.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    /// Logger name; the `tracing` target for events coming from a layer.
    pub target: String,
    pub pid: u32,
    pub thread_id: u64,
    pub thread_name: String,
    pub message: Message,
    pub exception: Option<ExceptionInfo>,
    pub extra: Map<String, Value>,
}

impl LogEvent {
    /// New event stamped with the current time, process and thread.
    pub fn new(level: Level, target: impl Into<String>, message: impl Into<Message>) -> Self {
        let thread_id = current_thread_id();
        Self {
            timestamp: Utc::now(),
            level,
            target: target.into(),
            pid: std::process::id(),
            thread_id,
            thread_name: current_thread_name(thread_id),
            message: message.into(),
            exception: None,
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build an event from a `tracing` event. The `message` field becomes
    /// the text message, the first error-valued field becomes the
    /// exception, everything else lands in `extra`.
    pub fn from_tracing(event: &Event<'_>) -> Self {
        let mut extra = Map::new();
        let mut message: Option<String> = None;
        let mut exception: Option<ExceptionInfo> = None;

        let mut visitor = FieldVisitor {
            fields: &mut extra,
            message: &mut message,
            exception: &mut exception,
        };
        event.record(&mut visitor);

        let meta = event.metadata();
        let mut log_event = LogEvent::new(*meta.level(), meta.target(), message.unwrap_or_default());
        log_event.exception = exception;
        log_event.extra = extra;
        log_event
    }
}

pub struct FieldVisitor<'a> {
    pub fields: &'a mut Map<String, Value>,
    pub message: &'a mut Option<String>,
    pub exception: &'a mut Option<ExceptionInfo>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        // Non-finite floats have no JSON form and become null.
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        if self.exception.is_none() {
            *self.exception = Some(ExceptionInfo::from_dyn(value));
        } else {
            self.fields.insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(field.name().to_string(), Value::String(format!("{:?}", value)));
        }
    }
}
