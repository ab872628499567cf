//! Serves one simulated request and prints its JSON log lines.
//!
//! Run with `LOG_FILTER=debug LOG_JSON_PRETTY=1 cargo run --example request_demo`.

use serde_json::{json, Value};
use std::error::Error;
use std::io::{self, Read};
use tracing::{error, info};
use tracing_json_context::context;
use tracing_json_context::init::{init_logging_with_config, LayerConfig};
use tracing_json_context::request::{self, UnitOfWork};

fn handle(body: &mut impl Read) -> io::Result<u16> {
    let mut payload = String::new();
    body.read_to_string(&mut payload)?;

    let _order = context::scoped([("order", "A-1042")]);
    info!(bytes = payload.len() as u64, "payload accepted");

    let err = io::Error::new(io::ErrorKind::TimedOut, "inventory service timed out");
    error!(error = &err as &(dyn Error + 'static), "reservation failed");
    Ok(503)
}

fn main() -> Result<(), Box<dyn Error>> {
    init_logging_with_config(LayerConfig::from_env())?;

    let environment = match json!({
        "REMOTE_ADDR": "203.0.113.9",
        "REQUEST_METHOD": "POST",
        "HTTP_HOST": "shop.example",
        "PATH_INFO": "/orders",
        "QUERY_STRING": "dry_run=1",
        "LOG_USER_ID": "u-77",
    }) {
        Value::Object(m) => m,
        _ => unreachable!(),
    };

    let (unit, mut body) = UnitOfWork::begin(environment, &br#"{"sku": "X-9", "qty": 1}"#[..]);
    request::set_environment_value(request::LOG_API_ENDPOINT, "orders.create");

    let status = handle(&mut body)?;
    unit.summary(status)
        .with_user_agent("curl/8.4.0")
        .with_response_body(br#"{"error": "try again"}"#)
        .log();
    Ok(())
}
