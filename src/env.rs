//! Environment variable names read by [`crate::init::LayerConfig::from_env`].
//!
//! These are purely helpers; the formatter and layer types remain
//! decoupled from environment access.

/// Filter directive in `EnvFilter` syntax, e.g. `info,my_crate=debug`.
pub const LOG_FILTER_ENV: &str = "LOG_FILTER";

/// Fallback filter directive when [`LOG_FILTER_ENV`] is unset.
pub const RUST_LOG_ENV: &str = "RUST_LOG";

/// Literal prefix written before every JSON document.
pub const LOG_JSON_PREFIX_ENV: &str = "LOG_JSON_PREFIX";

/// `1`/`true` selects indented JSON.
pub const LOG_JSON_PRETTY_ENV: &str = "LOG_JSON_PRETTY";

/// Deployment name, emitted as base field `environment`.
pub const LOG_ENVIRONMENT_ENV: &str = "LOG_ENVIRONMENT";

/// `1`/`true` adds a human-readable console layer on stderr.
pub const LOG_HUMAN_CONSOLE_ENV: &str = "LOG_HUMAN_CONSOLE";

/// Host name override, emitted as base field `hostname`.
pub const HOSTNAME_ENV: &str = "HOSTNAME";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Interpret an environment variable as a boolean switch.
pub fn env_flag(key: &str) -> bool {
    parse_flag(&env_or(key, ""))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Host name from `$HOSTNAME`, then `/etc/hostname`, else `unknown_host`.
pub fn host_name() -> String {
    if let Ok(name) = std::env::var(HOSTNAME_ENV) {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown_host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        for on in ["1", "true", "TRUE", " yes ", "on"] {
            assert!(parse_flag(on), "{}", on);
        }
        for off in ["", "0", "false", "nope"] {
            assert!(!parse_flag(off), "{}", off);
        }
    }

    #[test]
    fn host_name_is_never_empty() {
        assert!(!host_name().is_empty());
    }

    #[test]
    fn missing_variable_uses_default() {
        assert_eq!(env_or("TRACING_JSON_CONTEXT_SURELY_UNSET", "dflt"), "dflt");
    }
}
