use serde_json::{json, Map, Value};
use std::io::{self, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_json_context::context;
use tracing_json_context::request::{self, RequestEnvironmentSupplier, UnitOfWork};
use tracing_json_context::{FormatterConfig, JsonFormatter, JsonLayer};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn lines(&self) -> Vec<Map<String, Value>> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| match serde_json::from_str(line).unwrap() {
                Value::Object(m) => m,
                other => panic!("not an object: {}", other),
            })
            .collect()
    }
}

struct Broken;

impl Write for Broken {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn with_capture<R>(config: FormatterConfig, f: impl FnOnce() -> R) -> (Vec<Map<String, Value>>, R) {
    let capture = Capture::default();
    let sink = capture.clone();
    let layer = JsonLayer::new(JsonFormatter::new(config)).with_writer(move || sink.clone());
    let subscriber = tracing_subscriber::registry()
        .with(LevelFilter::INFO)
        .with(layer);
    let result = tracing::subscriber::with_default(subscriber, f);
    (capture.lines(), result)
}

#[test]
fn base_fields_and_message_reach_the_line() {
    context::clear();
    let (lines, ()) = with_capture(FormatterConfig::default().with_base_field("app", "svc"), || {
        info!("hello");
    });
    assert_eq!(lines.len(), 1);
    let line = &lines[0];
    assert_eq!(line["app"], json!("svc"));
    assert_eq!(line["message"], json!("hello"));
    assert_eq!(line["levelname"], json!("INFO"));
    assert_eq!(line["levelno"], json!(20));
    assert_eq!(line["name"], json!("json_layer"));
}

#[test]
fn event_fields_become_extras() {
    context::clear();
    let (lines, ()) = with_capture(FormatterConfig::default(), || {
        warn!(name = "shadow", attempts = 3_u64, ratio = 0.5, ok = false, "retrying {}", "upload");
    });
    let line = &lines[0];
    assert_eq!(line["message"], json!("retrying upload"));
    assert_eq!(line["name"], json!("json_layer"));
    assert_eq!(line["name_"], json!("shadow"));
    assert_eq!(line["attempts"], json!(3));
    assert_eq!(line["ratio"], json!(0.5));
    assert_eq!(line["ok"], json!(false));
    assert_eq!(line["levelno"], json!(30));
}

#[test]
fn errors_become_exception_block() {
    context::clear();
    let err = io::Error::new(io::ErrorKind::PermissionDenied, "cannot open spool");
    let (lines, ()) = with_capture(FormatterConfig::default(), || {
        error!(error = &err as &(dyn std::error::Error + 'static), "job failed");
    });
    let line = &lines[0];
    assert!(line["exc_message"].as_str().unwrap().contains("cannot open spool"));
    let frames = line["exc_traceback"].as_array().unwrap();
    assert!(!frames.is_empty());
    assert!(!line.contains_key("error"));
}

#[test]
fn scoped_context_is_attached_while_active() {
    context::clear();
    let (lines, ()) = with_capture(FormatterConfig::default(), || {
        let _job = context::scoped([("job", "nightly-export")]);
        info!("inside");
        {
            let _step = context::scoped([("step", 2)]);
            info!("nested");
        }
        drop(_job);
        info!("outside");
    });
    assert_eq!(lines[0]["context"], json!({"job": "nightly-export"}));
    assert_eq!(lines[1]["context"], json!({"job": "nightly-export", "step": 2}));
    assert_eq!(lines[2]["context"], json!({}));
}

#[test]
fn request_lines_share_correlation_id() {
    context::clear();
    let mut config = FormatterConfig::default().with_environment_supplier(RequestEnvironmentSupplier);
    for (output_key, environment_key) in request::default_context_mapping() {
        config = config.with_context_from_environment(output_key, environment_key);
    }

    let environment = match json!({
        "REMOTE_ADDR": "192.0.2.7",
        "REQUEST_METHOD": "PUT",
        "PATH_INFO": "/items/9",
    }) {
        Value::Object(m) => m,
        _ => unreachable!(),
    };

    let (lines, rid) = with_capture(config, || {
        let (unit, mut body) = UnitOfWork::begin(environment, &b"{\"qty\": 2}"[..]);
        request::set_environment_value(request::LOG_API_ENDPOINT, "items.update");

        let mut payload = String::new();
        body.read_to_string(&mut payload).unwrap();
        {
            let _user = context::scoped([("rid", "from-store")]);
            info!(bytes = payload.len() as u64, "payload parsed");
        }
        unit.summary(200).log();
        unit.id().to_string()
    });

    assert_eq!(lines.len(), 2);
    let handler = &lines[0];
    assert_eq!(handler["context"]["rid"], json!("from-store"));
    assert_eq!(handler["context"]["rid_"], json!(rid));
    assert_eq!(handler["context"]["ip"], json!("192.0.2.7"));
    assert_eq!(handler["context"]["endpoint"], json!("items.update"));

    let summary = &lines[1];
    assert_eq!(summary["name"], json!("request_log"));
    assert_eq!(summary["message"], json!("192.0.2.7 PUT /items/9 200"));
    assert_eq!(summary["context"]["rid"], json!(rid));
    assert_eq!(summary["status_code"], json!(200));
    assert_eq!(summary["req_body_size"], json!(10));
    assert_eq!(summary["path"], json!("/items/9"));
    assert!(!summary.contains_key("user_agent"));

    assert!(request::current_environment().is_empty());
}

#[test]
fn layer_counts_events_and_write_failures() {
    let layer = JsonLayer::new(JsonFormatter::default()).with_writer(|| Broken);
    let total = layer.total_events.clone();
    let written = layer.written_events.clone();
    let failed = layer.failed_writes.clone();

    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::with_default(subscriber, || {
        info!("one");
        info!("two");
    });

    assert_eq!(total.load(Ordering::Relaxed), 2);
    assert_eq!(written.load(Ordering::Relaxed), 0);
    assert_eq!(failed.load(Ordering::Relaxed), 2);
}
