//! Framework-agnostic request hooks.
//!
//! A web integration calls [`UnitOfWork::begin`] when a request arrives and
//! [`RequestSummary::log`] when the response is ready. In between, the
//! request environment is visible to the formatter through
//! [`RequestEnvironmentSupplier`], and the body reader reports its timing
//! through the [`ReadTimingStream`] handed back by `begin`.

use crate::context;
use crate::formatter::EnvironmentSupplier;
use crate::ids::{self, CorrelationId};
use crate::stream::{ReadStats, ReadStatsHandle, ReadTimingStream};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Correlation ID of the request.
pub const LOG_REQUEST_ID: &str = "LOG_REQUEST_ID";
pub const REMOTE_ADDR: &str = "REMOTE_ADDR";
pub const LOG_USER_ID: &str = "LOG_USER_ID";
/// Leading characters of the credential used, never the full token.
pub const LOG_AUTH_TOKEN_PREFIX: &str = "LOG_AUTH_TOKEN_PREFIX";
/// Name of the routed handler.
pub const LOG_API_ENDPOINT: &str = "LOG_API_ENDPOINT";

pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
pub const HTTP_HOST: &str = "HTTP_HOST";
pub const HTTP_REFERER: &str = "HTTP_REFERER";
pub const RAW_URI: &str = "RAW_URI";
pub const REQUEST_URI: &str = "REQUEST_URI";
pub const PATH_INFO: &str = "PATH_INFO";
pub const QUERY_STRING: &str = "QUERY_STRING";
pub const SQL_NUM_QUERIES: &str = "SQL_NUM_QUERIES";
pub const SQL_TOTAL_TIME: &str = "SQL_TOTAL_TIME";

/// Longest response body excerpt kept for failed requests.
pub const MAX_ERROR_BODY_BYTES: usize = 512;

pub type Environment = Map<String, Value>;

/// `(context key, environment key)` pairs usually copied into every line.
pub fn default_context_mapping() -> Vec<(String, String)> {
    [
        ("rid", LOG_REQUEST_ID),
        ("ip", REMOTE_ADDR),
        ("uid", LOG_USER_ID),
        ("tok", LOG_AUTH_TOKEN_PREFIX),
        ("endpoint", LOG_API_ENDPOINT),
    ]
    .into_iter()
    .map(|(out, key)| (out.to_string(), key.to_string()))
    .collect()
}

thread_local! {
    static THREAD_ENVIRONMENT: RefCell<Option<Environment>> = const { RefCell::new(None) };
}

tokio::task_local! {
    static TASK_ENVIRONMENT: RefCell<Option<Environment>>;
}

fn with_environment<R>(f: impl FnOnce(&mut Option<Environment>) -> R) -> Option<R> {
    if TASK_ENVIRONMENT.try_with(|_| ()).is_ok() {
        TASK_ENVIRONMENT.try_with(|cell| f(&mut cell.borrow_mut())).ok()
    } else {
        THREAD_ENVIRONMENT.try_with(|cell| f(&mut cell.borrow_mut())).ok()
    }
}

/// Copy of the environment of the request being handled on this
/// execution context; empty outside of a request.
pub fn current_environment() -> Environment {
    with_environment(|env| env.clone())
        .flatten()
        .unwrap_or_default()
}

/// Set one key of the current request environment, e.g. the endpoint
/// name once routing is done. No-op outside of a request.
pub fn set_environment_value(key: impl Into<String>, value: impl Into<Value>) {
    let (key, value) = (key.into(), value.into());
    with_environment(|env| {
        if let Some(env) = env {
            env.insert(key, value);
        }
    });
}

/// [`EnvironmentSupplier`] reading [`current_environment`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestEnvironmentSupplier;

impl EnvironmentSupplier for RequestEnvironmentSupplier {
    fn environment(&self) -> Map<String, Value> {
        current_environment()
    }
}

/// Identity and timing of one request. Cheap to clone and `Send`, so it
/// can travel into spawned work.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: CorrelationId,
    started: Instant,
    body: ReadStatsHandle,
}

impl RequestHandle {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn body_stats(&self) -> ReadStats {
        self.body.get()
    }

    /// Summary pre-filled from the current environment, timing and body
    /// counters.
    pub fn summary(&self, status_code: u16) -> RequestSummary {
        let mut summary = RequestSummary::from_environment(&current_environment(), status_code)
            .with_duration(self.elapsed());
        summary.set_request_body(&self.body_stats());
        summary
    }
}

/// Generate the correlation ID, record it under [`LOG_REQUEST_ID`] and
/// wrap the body.
fn prepare<R>(
    mut environment: Environment,
    body: R,
) -> (RequestHandle, Environment, ReadTimingStream<R>) {
    let id = ids::generate(&HashSet::new());
    environment.insert(LOG_REQUEST_ID.to_string(), id.clone().into());
    tracing::trace!(rid = %id, "unit of work started");

    let body = ReadTimingStream::new(body);
    let handle = RequestHandle {
        id,
        started: Instant::now(),
        body: body.stats_handle(),
    };
    (handle, environment, body)
}

/// One request in flight on a blocking handler. Dropping it uninstalls
/// the request environment and restores whatever was installed before.
///
/// Not `Send`; async handlers go through [`serve`] instead.
#[derive(Debug)]
pub struct UnitOfWork {
    handle: RequestHandle,
    previous: Option<Environment>,
    _not_send: PhantomData<*const ()>,
}

impl UnitOfWork {
    /// Start a request: generate its correlation ID, record it under
    /// [`LOG_REQUEST_ID`], install `environment` for the current execution
    /// context and wrap the request body.
    pub fn begin<R>(environment: Environment, body: R) -> (Self, ReadTimingStream<R>) {
        let (handle, environment, body) = prepare(environment, body);
        let previous = with_environment(|slot| slot.replace(environment)).flatten();
        let unit = Self {
            handle,
            previous,
            _not_send: PhantomData,
        };
        (unit, body)
    }

    pub fn handle(&self) -> &RequestHandle {
        &self.handle
    }

    pub fn id(&self) -> &CorrelationId {
        self.handle.id()
    }

    pub fn elapsed(&self) -> Duration {
        self.handle.elapsed()
    }

    pub fn body_stats(&self) -> ReadStats {
        self.handle.body_stats()
    }

    pub fn summary(&self, status_code: u16) -> RequestSummary {
        self.handle.summary(status_code)
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let previous = self.previous.take();
        with_environment(|slot| *slot = previous);
    }
}

/// Run `fut` as its own unit of work: it gets a fresh context store and
/// request environment slot, isolated from other tasks on the same thread.
pub async fn run_unit_of_work<F: Future>(fut: F) -> F::Output {
    let isolated = TASK_ENVIRONMENT.scope(RefCell::new(None), fut);
    context::with_fresh_task_context(isolated).await
}

/// Serve one request on an async handler.
///
/// Does what [`UnitOfWork::begin`] does, then runs the future built by
/// `handler` with a fresh context store and with the request environment
/// installed around each of its polls. The result is `Send` whenever the
/// handler's future is, so it can be spawned onto a multi-threaded
/// runtime.
pub fn serve<R, H, F>(environment: Environment, body: R, handler: H) -> impl Future<Output = F::Output>
where
    H: FnOnce(RequestHandle, ReadTimingStream<R>) -> F,
    F: Future,
{
    let (handle, environment, body) = prepare(environment, body);
    let inner = WithEnvironment {
        environment: Some(environment),
        inner: Box::pin(handler(handle, body)),
    };
    context::with_fresh_task_context(inner)
}

/// Installs its environment for the duration of each poll of `inner`.
struct WithEnvironment<F> {
    environment: Option<Environment>,
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for WithEnvironment<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        with_environment(|slot| std::mem::swap(slot, &mut this.environment));
        let poll = this.inner.as_mut().poll(cx);
        with_environment(|slot| std::mem::swap(slot, &mut this.environment));
        poll
    }
}

/// Lossy text for a byte payload; `"(None)"` when absent.
pub fn safe_to_str(bytes: Option<&[u8]>) -> String {
    match bytes {
        None => "(None)".to_string(),
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Response size: the `Content-Length` header if it parses, otherwise the
/// body length, otherwise `-1`.
pub fn body_size(content_length: Option<&str>, body: Option<&[u8]>) -> i64 {
    if let Some(n) = content_length.and_then(|v| v.trim().parse::<i64>().ok()) {
        return n;
    }
    body.map(|b| b.len() as i64).unwrap_or(-1)
}

fn env_str(environment: &Environment, key: &str) -> Option<String> {
    match environment.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Request path as the client sent it.
pub fn request_path(environment: &Environment) -> String {
    let non_empty = |key: &str| env_str(environment, key).filter(|p| !p.is_empty());
    if let Some(path) = non_empty(RAW_URI).or_else(|| non_empty(REQUEST_URI)) {
        return path;
    }
    let path_info = env_str(environment, PATH_INFO)
        .unwrap_or_default()
        .replace('?', "%3F");
    match env_str(environment, QUERY_STRING).filter(|q| !q.is_empty()) {
        Some(query) => format!("{}?{}", path_info, query),
        None => path_info,
    }
}

/// Access-log record written once per request on target `request_log`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestSummary {
    pub addr: Option<String>,
    pub user_id: Option<String>,
    pub method: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub status_code: u16,
    pub size: Option<i64>,
    /// Seconds.
    pub duration: Option<f64>,
    pub sql_num_queries: u64,
    /// Seconds.
    pub sql_total_time: f64,
    pub referer: Option<String>,
    pub location: Option<String>,
    pub content_type: Option<String>,
    pub user_agent: Option<String>,
    pub app_version: Option<String>,
    pub body: Option<String>,
    pub req_body_size: Option<u64>,
    /// Seconds between the first and last body read.
    pub req_body_duration: Option<f64>,
}

impl RequestSummary {
    pub fn from_environment(environment: &Environment, status_code: u16) -> Self {
        Self {
            addr: env_str(environment, REMOTE_ADDR),
            user_id: env_str(environment, LOG_USER_ID),
            method: env_str(environment, REQUEST_METHOD),
            host: env_str(environment, HTTP_HOST),
            path: request_path(environment),
            status_code,
            sql_num_queries: environment
                .get(SQL_NUM_QUERIES)
                .and_then(Value::as_u64)
                .unwrap_or(0),
            sql_total_time: environment
                .get(SQL_TOTAL_TIME)
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            referer: env_str(environment, HTTP_REFERER),
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration.as_secs_f64());
        self
    }

    pub fn with_size(mut self, content_length: Option<&str>, body: Option<&[u8]>) -> Self {
        self.size = Some(body_size(content_length, body));
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = Some(app_version.into());
        self
    }

    /// Keep an excerpt of the response body, for error responses only.
    pub fn with_response_body(mut self, body: &[u8]) -> Self {
        if self.status_code >= 400 {
            let end = body.len().min(MAX_ERROR_BODY_BYTES);
            self.body = Some(safe_to_str(Some(&body[..end])));
        }
        self
    }

    /// Record request body size and read duration, if the body was read.
    pub fn set_request_body(&mut self, stats: &ReadStats) {
        if !stats.has_read() {
            return;
        }
        self.req_body_size = Some(stats.bytes_read);
        self.req_body_duration = stats
            .duration()
            .and_then(|d| d.to_std().ok())
            .map(|d| d.as_secs_f64());
    }

    /// `"<addr> <method> <path> <status>"`.
    pub fn message(&self) -> String {
        format!(
            "{} {} {} {}",
            self.addr.as_deref().unwrap_or("-"),
            self.method.as_deref().unwrap_or("-"),
            self.path,
            self.status_code
        )
    }

    /// Emit the summary as an `INFO` event on target `request_log`.
    pub fn log(&self) {
        tracing::info!(
            target: "request_log",
            addr = self.addr.as_deref(),
            user_id = self.user_id.as_deref(),
            method = self.method.as_deref(),
            host = self.host.as_deref(),
            path = self.path.as_str(),
            status_code = self.status_code,
            size = self.size,
            duration = self.duration,
            sql_num_queries = self.sql_num_queries,
            sql_total_time = self.sql_total_time,
            referer = self.referer.as_deref(),
            location = self.location.as_deref(),
            content_type = self.content_type.as_deref(),
            user_agent = self.user_agent.as_deref(),
            app_version = self.app_version.as_deref(),
            body = self.body.as_deref(),
            req_body_size = self.req_body_size,
            req_body_duration = self.req_body_duration,
            "{}",
            self.message()
        );
    }
}
