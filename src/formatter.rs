//! Rendering of [`LogEvent`]s as single JSON lines.
//!
//! Output fields are assembled in a fixed order: configured base fields,
//! `asctime`, `levelname`, `levelno`, `pid`, `threadName`, `thread`,
//! `name`, the message (or the entries of a structured message),
//! `exc_message`/`exc_traceback` when an exception is attached, `context`,
//! and finally the event's extra attributes. Every insertion goes through
//! [`safe_merge`]/[`safe_insert`], so a later field never replaces an
//! earlier one; it is stored under a `_`-suffixed name instead.

use crate::context;
use crate::event::{level_rank, LogEvent, Message, NATURAL_ATTRIBUTES};
use crate::merge::{safe_insert, safe_merge};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashSet;
use std::fmt::{self, Write as _};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

/// Field names written by the formatter itself.
pub const FIXED_FIELDS: &[&str] = &[
    "asctime",
    "levelname",
    "levelno",
    "pid",
    "threadName",
    "thread",
    "name",
    "message",
    "exc_message",
    "exc_traceback",
    "context",
];

pub const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

fn reserved_fields() -> &'static HashSet<&'static str> {
    static RESERVED: OnceLock<HashSet<&'static str>> = OnceLock::new();
    RESERVED.get_or_init(|| {
        FIXED_FIELDS
            .iter()
            .chain(NATURAL_ATTRIBUTES.iter())
            .copied()
            .collect()
    })
}

/// Error produced while serializing a record. Never escapes
/// [`JsonFormatter::format`].
#[derive(thiserror::Error, Debug)]
pub enum EncodeFailure {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),

    #[error("encoder panicked: {0}")]
    Panicked(String),
}

/// Source of the request-scoped environment consulted for the `context`
/// block, e.g. the current HTTP request's variables.
pub trait EnvironmentSupplier: Send + Sync {
    fn environment(&self) -> Map<String, Value>;
}

impl<F> EnvironmentSupplier for F
where
    F: Fn() -> Map<String, Value> + Send + Sync,
{
    fn environment(&self) -> Map<String, Value> {
        self()
    }
}

/// Serializes the assembled record.
pub trait JsonEncoder: Send + Sync {
    fn encode(&self, value: &Value) -> Result<String, EncodeFailure>;
}

impl<F> JsonEncoder for F
where
    F: Fn(&Value) -> Result<String, EncodeFailure> + Send + Sync,
{
    fn encode(&self, value: &Value) -> Result<String, EncodeFailure> {
        self(value)
    }
}

/// Single-line JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactEncoder;

impl JsonEncoder for CompactEncoder {
    fn encode(&self, value: &Value) -> Result<String, EncodeFailure> {
        Ok(serde_json::to_string(value)?)
    }
}

/// Indented JSON, handy on a developer console.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrettyEncoder;

impl JsonEncoder for PrettyEncoder {
    fn encode(&self, value: &Value) -> Result<String, EncodeFailure> {
        Ok(serde_json::to_string_pretty(value)?)
    }
}

/// Configuration of a [`JsonFormatter`].
///
/// ```
/// use serde_json::json;
/// use tracing_json_context::formatter::FormatterConfig;
///
/// let config = FormatterConfig::default()
///     .with_base_field("app", json!("svc"))
///     .with_context_from_environment("rid", "LOG_REQUEST_ID")
///     .with_prefix("json:");
/// assert_eq!(config.prefix, "json:");
/// ```
#[derive(Clone)]
pub struct FormatterConfig {
    /// Seeded into every record before any other field.
    pub base_fields: Map<String, Value>,
    pub environment_supplier: Option<Arc<dyn EnvironmentSupplier>>,
    /// `(output key, environment key)` pairs copied into `context` when the
    /// environment key is present.
    pub context_from_environment: Vec<(String, String)>,
    pub prefix: String,
    pub encoder: Arc<dyn JsonEncoder>,
    /// `chrono` strftime pattern for `asctime`.
    pub time_format: String,
    pub local_time: bool,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            base_fields: Map::new(),
            environment_supplier: None,
            context_from_environment: Vec::new(),
            prefix: String::new(),
            encoder: Arc::new(CompactEncoder),
            time_format: DEFAULT_TIME_FORMAT.to_string(),
            local_time: false,
        }
    }
}

impl fmt::Debug for FormatterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatterConfig")
            .field("base_fields", &self.base_fields)
            .field("environment_supplier", &self.environment_supplier.is_some())
            .field("context_from_environment", &self.context_from_environment)
            .field("prefix", &self.prefix)
            .field("time_format", &self.time_format)
            .field("local_time", &self.local_time)
            .finish_non_exhaustive()
    }
}

impl FormatterConfig {
    pub fn with_base_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.base_fields.insert(key.into(), value.into());
        self
    }

    pub fn with_environment_supplier(mut self, supplier: impl EnvironmentSupplier + 'static) -> Self {
        self.environment_supplier = Some(Arc::new(supplier));
        self
    }

    pub fn with_context_from_environment(
        mut self,
        output_key: impl Into<String>,
        environment_key: impl Into<String>,
    ) -> Self {
        self.context_from_environment
            .push((output_key.into(), environment_key.into()));
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_encoder(mut self, encoder: impl JsonEncoder + 'static) -> Self {
        self.encoder = Arc::new(encoder);
        self
    }

    pub fn with_time_format(mut self, time_format: impl Into<String>) -> Self {
        self.time_format = time_format.into();
        self
    }

    pub fn with_local_time(mut self, local_time: bool) -> Self {
        self.local_time = local_time;
        self
    }
}

/// Turns [`LogEvent`]s into prefixed JSON strings.
#[derive(Debug, Clone, Default)]
pub struct JsonFormatter {
    config: FormatterConfig,
}

impl JsonFormatter {
    pub fn new(config: FormatterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FormatterConfig {
        &self.config
    }

    /// Render `event`. Never panics and never fails: if the encoder
    /// errors, the line degrades to the error plus a debug rendering of
    /// the record, and if even that cannot be produced, to the error
    /// alone.
    pub fn format(&self, event: &LogEvent) -> String {
        let record = Value::Object(self.format_obj(event));
        let body = match self.encode(&record) {
            Ok(json) => json,
            Err(err) => encoding_fallback(&err, &record),
        };
        let mut line = String::with_capacity(self.config.prefix.len() + body.len());
        line.push_str(&self.config.prefix);
        line.push_str(&body);
        line
    }

    /// Assemble the record object without serializing it.
    pub fn format_obj(&self, event: &LogEvent) -> Map<String, Value> {
        let reserved = reserved_fields();
        let unreserved = HashSet::new();
        let mut record = self.config.base_fields.clone();

        let fixed = [
            ("asctime", Value::String(self.format_time(event))),
            ("levelname", Value::String(event.level.to_string())),
            ("levelno", Value::from(level_rank(&event.level))),
            ("pid", Value::from(event.pid)),
            ("threadName", Value::String(event.thread_name.clone())),
            ("thread", Value::from(event.thread_id)),
            ("name", Value::String(event.target.clone())),
        ];
        for (key, value) in fixed {
            safe_insert(&mut record, key, value, &unreserved);
        }

        match &event.message {
            Message::Text(text) => {
                safe_insert(&mut record, "message", Value::String(text.clone()), &unreserved);
            }
            Message::Structured(entries) => {
                safe_merge(&mut record, entries.clone(), reserved, &unreserved);
            }
        }

        if let Some(exc) = &event.exception {
            safe_insert(&mut record, "exc_message", Value::String(exc.summary()), &unreserved);
            let frames = exc.frames.iter().cloned().map(Value::String).collect();
            safe_insert(&mut record, "exc_traceback", Value::Array(frames), &unreserved);
        }

        safe_insert(&mut record, "context", Value::Object(self.context_block()), &unreserved);

        safe_merge(&mut record, event.extra.clone(), reserved, &unreserved);
        record
    }

    /// Environment-derived keys first, then the current context store.
    /// A store value takes the plain key; an environment value it
    /// displaces is kept under a `_`-suffixed key.
    fn context_block(&self) -> Map<String, Value> {
        let mut block = Map::new();
        if let Some(supplier) = &self.config.environment_supplier {
            let environment =
                catch_unwind(AssertUnwindSafe(|| supplier.environment())).unwrap_or_default();
            for (output_key, environment_key) in &self.config.context_from_environment {
                if let Some(value) = environment.get(environment_key) {
                    block.insert(output_key.clone(), value.clone());
                }
            }
        }

        let unreserved = HashSet::new();
        for (key, value) in context::snapshot() {
            if let Some(displaced) = block.insert(key.clone(), value) {
                safe_insert(&mut block, key, displaced, &unreserved);
            }
        }
        block
    }

    fn format_time(&self, event: &LogEvent) -> String {
        let mut out = String::new();
        let written = if self.config.local_time {
            let local = event.timestamp.with_timezone(&chrono::Local);
            write!(out, "{}", local.format(&self.config.time_format))
        } else {
            write!(out, "{}", event.timestamp.format(&self.config.time_format))
        };
        match written {
            Ok(()) => out,
            // Invalid strftime pattern.
            Err(_) => event.timestamp.to_rfc3339(),
        }
    }

    fn encode(&self, record: &Value) -> Result<String, EncodeFailure> {
        catch_unwind(AssertUnwindSafe(|| self.config.encoder.encode(record)))
            .unwrap_or_else(|payload| Err(EncodeFailure::Panicked(panic_message(payload.as_ref()))))
    }
}

fn encoding_fallback(err: &EncodeFailure, record: &Value) -> String {
    let attempt = catch_unwind(AssertUnwindSafe(|| -> Result<String, fmt::Error> {
        let mut out = String::new();
        write!(out, "(error encoding: {}) {:?}", err, record)?;
        Ok(out)
    }));
    match attempt {
        Ok(Ok(out)) => out,
        Ok(Err(fmt_err)) => format!("(error encoding: {})", fmt_err),
        Err(payload) => format!("(error encoding: {})", panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
