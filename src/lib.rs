//! JSON log lines for `tracing`, decorated with scoped request context.
//!
//! - [`formatter::JsonFormatter`] renders a [`event::LogEvent`] as one
//!   JSON document, merging base fields, the request environment, the
//!   [`context`] store and per-event extras without letting any of them
//!   overwrite another.
//! - [`layer::JsonLayer`] plugs the formatter into `tracing_subscriber`.
//! - [`request::UnitOfWork`] starts a request: correlation ID from
//!   [`ids`], environment for the formatter and a timed body reader from
//!   [`stream`].

pub mod ids;
pub mod merge;
pub mod context;
pub mod stream;
pub mod event;
pub mod formatter;
pub mod layer;
pub mod request;
pub mod env;
pub mod init;

pub use formatter::{FormatterConfig, JsonFormatter};
pub use layer::JsonLayer;
