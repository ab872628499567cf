use crate::env::{
    env_flag, env_or, host_name, LOG_ENVIRONMENT_ENV, LOG_FILTER_ENV, LOG_HUMAN_CONSOLE_ENV,
    LOG_JSON_PREFIX_ENV, LOG_JSON_PRETTY_ENV, RUST_LOG_ENV,
};
use crate::formatter::{FormatterConfig, JsonFormatter, PrettyEncoder};
use crate::layer::JsonLayer;
use crate::request;
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Logging layer configuration.
///
/// **Fields**
/// - `formatter`: [`FormatterConfig`] used for every JSON line.
/// - `filter`: directive in `EnvFilter` syntax applied to both layers.
/// - `enable_console`: if `true`, a human-readable
///   `tracing_subscriber::fmt::Layer` writing to stderr is added next to
///   the JSON layer.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub formatter: FormatterConfig,
    pub filter: String,
    pub enable_console: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            formatter: FormatterConfig::default(),
            filter: "info".to_string(),
            enable_console: false,
        }
    }
}

impl LayerConfig {
    /// Configuration for a request-serving process, read from the
    /// variables in [`crate::env`].
    ///
    /// The formatter reports `hostname` (and `environment` when set) as
    /// base fields and copies the request environment keys from
    /// [`request::default_context_mapping`] into `context`.
    pub fn from_env() -> Self {
        let filter = std::env::var(LOG_FILTER_ENV)
            .or_else(|_| std::env::var(RUST_LOG_ENV))
            .unwrap_or_else(|_| "info".to_string());

        let mut formatter = FormatterConfig::default()
            .with_base_field("hostname", host_name())
            .with_prefix(env_or(LOG_JSON_PREFIX_ENV, ""))
            .with_environment_supplier(request::RequestEnvironmentSupplier);
        if let Ok(environment) = std::env::var(LOG_ENVIRONMENT_ENV) {
            formatter = formatter.with_base_field("environment", environment);
        }
        for (output_key, environment_key) in request::default_context_mapping() {
            formatter = formatter.with_context_from_environment(output_key, environment_key);
        }
        if env_flag(LOG_JSON_PRETTY_ENV) {
            formatter = formatter.with_encoder(PrettyEncoder);
        }

        Self {
            formatter,
            filter,
            enable_console: env_flag(LOG_HUMAN_CONSOLE_ENV),
        }
    }
}

/// Error returned when installing the global subscriber.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("invalid filter directive: {0}")]
    Filter(#[from] ParseError),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Initialize the global `tracing` subscriber, writing JSON lines through
/// `make_writer`.
///
/// **Effects**
///
/// Installs a [`Registry`] combined with an [`EnvFilter`], a
/// [`JsonLayer`] and, when `enable_console` is set, the stock `fmt` layer.
pub fn init_logging_with_writer<W>(config: LayerConfig, make_writer: W) -> Result<(), InitError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_new(&config.filter)?;
    let json_layer = JsonLayer::new(JsonFormatter::new(config.formatter)).with_writer(make_writer);
    let console_layer = config
        .enable_console
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(console_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Initialize logging to stdout with the provided [`LayerConfig`].
pub fn init_logging_with_config(config: LayerConfig) -> Result<(), InitError> {
    init_logging_with_writer(config, std::io::stdout)
}

/// Initialize logging with [`LayerConfig::from_env`]. This is the
/// recommended entrypoint for typical services.
pub fn init_logging() -> Result<(), InitError> {
    init_logging_with_config(LayerConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::HOSTNAME_ENV;
    use crate::event::LogEvent;
    use std::sync::Mutex;
    use tracing::Level;

    // Tests touching process environment variables take this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 7] = [
        LOG_FILTER_ENV,
        RUST_LOG_ENV,
        LOG_JSON_PREFIX_ENV,
        LOG_JSON_PRETTY_ENV,
        LOG_ENVIRONMENT_ENV,
        LOG_HUMAN_CONSOLE_ENV,
        HOSTNAME_ENV,
    ];

    #[test]
    fn bad_filter_is_reported() {
        let config = LayerConfig {
            filter: "my_crate=verbose".to_string(),
            ..LayerConfig::default()
        };
        assert!(matches!(
            init_logging_with_writer(config, std::io::sink),
            Err(InitError::Filter(_))
        ));
    }

    #[test]
    fn from_env_reads_every_variable() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved: Vec<_> = VARS.iter().map(|k| (*k, std::env::var(k).ok())).collect();
        for key in VARS {
            std::env::remove_var(key);
        }

        std::env::set_var(HOSTNAME_ENV, "web-7");
        let config = LayerConfig::from_env();
        assert_eq!(config.filter, "info");
        assert_eq!(config.formatter.prefix, "");
        assert!(!config.enable_console);
        assert_eq!(config.formatter.base_fields["hostname"], "web-7");
        assert!(!config.formatter.base_fields.contains_key("environment"));
        let line = JsonFormatter::new(config.formatter).format(&LogEvent::new(Level::INFO, "t", "m"));
        assert!(!line.contains('\n'));

        std::env::set_var(RUST_LOG_ENV, "warn");
        assert_eq!(LayerConfig::from_env().filter, "warn");
        std::env::set_var(LOG_FILTER_ENV, "debug,hyper=info");
        assert_eq!(LayerConfig::from_env().filter, "debug,hyper=info");

        std::env::set_var(LOG_JSON_PREFIX_ENV, "json: ");
        std::env::set_var(LOG_JSON_PRETTY_ENV, "true");
        std::env::set_var(LOG_ENVIRONMENT_ENV, "staging");
        std::env::set_var(LOG_HUMAN_CONSOLE_ENV, "1");
        let config = LayerConfig::from_env();
        assert!(config.enable_console);
        assert_eq!(config.formatter.prefix, "json: ");
        assert_eq!(config.formatter.base_fields["environment"], "staging");
        let line = JsonFormatter::new(config.formatter).format(&LogEvent::new(Level::INFO, "t", "m"));
        assert!(line.starts_with("json: {\n"));

        for (key, value) in saved {
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }

    #[test]
    fn from_env_maps_request_environment() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let config = LayerConfig::from_env();
        let keys: Vec<&str> = config
            .formatter
            .context_from_environment
            .iter()
            .map(|(out, _)| out.as_str())
            .collect();
        assert_eq!(keys, ["rid", "ip", "uid", "tok", "endpoint"]);
        assert!(config.formatter.base_fields.contains_key("hostname"));
        assert!(config.formatter.environment_supplier.is_some());
    }
}
