//! Telemetry Configuration

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// `EnvFilter` directives, e.g. `info` or `xbos_driver=debug,info`
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::named("xbos-driver")
    }
}

impl TelemetryConfig {
    pub fn named(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// `SERVICE_NAME`, `RUST_LOG` and `JSON_LOGS`, falling back to `service_name`
    pub fn from_env(service_name: &str) -> Self {
        Self::from_lookup(service_name, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(service_name: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::named(service_name);
        Self {
            service_name: lookup("SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: lookup("RUST_LOG")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.log_level),
            json_logs: lookup("JSON_LOGS")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.json_logs),
        }
    }
}
