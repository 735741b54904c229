//! Driver configuration

use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{DriverError, Result};

pub const DEFAULT_ARCHIVER: &str = "http://localhost:8079";

/// How many report destinations must acknowledge a payload before the
/// buffered readings it carried are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPolicy {
    /// One 200 response acknowledges the whole snapshot
    #[default]
    Any,
    /// Every destination must respond with 200
    All,
}

impl FromStr for DeliveryPolicy {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            other => Err(DriverError::Config(format!(
                "delivery policy must be 'any' or 'all', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Namespace for every series id this driver derives
    #[serde(default = "Uuid::new_v4")]
    pub instance_uuid: Uuid,
    #[serde(default)]
    pub report_destinations: Vec<String>,
    #[serde(default = "default_archiver")]
    pub archiver: String,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    #[serde(default = "default_report_timeout")]
    pub report_timeout_secs: u64,
    #[serde(default)]
    pub delivery_policy: DeliveryPolicy,
}

fn default_archiver() -> String {
    DEFAULT_ARCHIVER.to_string()
}

fn default_report_interval() -> u64 {
    10
}

fn default_report_timeout() -> u64 {
    30
}

impl DriverConfig {
    pub fn new(instance_uuid: Uuid) -> Self {
        Self {
            instance_uuid,
            report_destinations: Vec::new(),
            archiver: default_archiver(),
            report_interval_secs: default_report_interval(),
            report_timeout_secs: default_report_timeout(),
            delivery_policy: DeliveryPolicy::default(),
        }
    }

    pub fn with_destination(mut self, url: impl Into<String>) -> Self {
        self.report_destinations.push(url.into());
        self
    }

    pub fn with_archiver(mut self, url: impl Into<String>) -> Self {
        self.archiver = url.into();
        self
    }

    pub fn with_report_interval(mut self, secs: u64) -> Self {
        self.report_interval_secs = secs;
        self
    }

    pub fn with_delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.delivery_policy = policy;
        self
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup using the `XBOS_*` names
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let instance_uuid = match lookup("XBOS_INSTANCE_UUID") {
            Some(raw) => Uuid::parse_str(raw.trim())
                .map_err(|e| DriverError::Config(format!("Invalid XBOS_INSTANCE_UUID: {}", e)))?,
            None => {
                let generated = Uuid::new_v4();
                tracing::warn!(
                    instance_uuid = %generated,
                    "XBOS_INSTANCE_UUID not set; series ids will change on restart"
                );
                generated
            }
        };

        let report_destinations = lookup("XBOS_REPORT_DESTINATIONS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            instance_uuid,
            report_destinations,
            archiver: lookup("XBOS_ARCHIVER").unwrap_or_else(default_archiver),
            report_interval_secs: lookup("XBOS_REPORT_INTERVAL_SECS")
                .map(|v| v.trim().parse::<u64>())
                .transpose()
                .map_err(|e| {
                    DriverError::Config(format!("Invalid XBOS_REPORT_INTERVAL_SECS: {}", e))
                })?
                .unwrap_or_else(default_report_interval),
            report_timeout_secs: lookup("XBOS_REPORT_TIMEOUT_SECS")
                .map(|v| v.trim().parse::<u64>())
                .transpose()
                .map_err(|e| {
                    DriverError::Config(format!("Invalid XBOS_REPORT_TIMEOUT_SECS: {}", e))
                })?
                .unwrap_or_else(default_report_timeout),
            delivery_policy: lookup("XBOS_DELIVERY_POLICY")
                .map(|v| v.parse::<DeliveryPolicy>())
                .transpose()?
                .unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.report_interval_secs == 0 {
            return Err(DriverError::Config(
                "report interval must be at least one second".to_string(),
            ));
        }
        if self.report_timeout_secs == 0 {
            return Err(DriverError::Config(
                "report timeout must be at least one second".to_string(),
            ));
        }
        for url in &self.report_destinations {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(DriverError::Config(format!(
                    "report destination '{}' is not an http(s) URL",
                    url
                )));
            }
        }
        Ok(())
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }

    /// Endpoint subscriptions use when none is given explicitly
    pub fn republish_url(&self) -> String {
        format!("{}/republish", self.archiver.trim_end_matches('/'))
    }
}
