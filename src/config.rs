//! Operator configuration loaded from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::compat;

#[derive(Debug, Clone)]
pub struct Config {
    // Namespaces
    pub system_namespace: String,
    pub upgrade_namespace: String,

    // Platform
    pub server_version: String,
    pub system_image_registry: String,
    pub crd_chart_name: String,
    pub core_chart_name: String,

    // Reconciliation
    pub resync_interval: Duration,

    // Upgrade check
    pub upgrade_check_enabled: bool,
    pub upgrade_check_url: Option<String>,
    pub upgrade_check_interval: Duration,

    // Servers
    pub health_port: u16,
    pub metrics_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config = Self {
            system_namespace: get_env_with_default("SYSTEM_NAMESPACE", "puo-system"),
            upgrade_namespace: get_env_with_default("UPGRADE_NAMESPACE", "system-upgrade"),
            server_version: get_env_with_default("SERVER_VERSION", &default_server_version()),
            system_image_registry: get_env_with_default("SYSTEM_IMAGE_REGISTRY", "docker.io"),
            crd_chart_name: get_env_with_default("CRD_CHART_NAME", "platform-crd"),
            core_chart_name: get_env_with_default("CORE_CHART_NAME", "platform"),
            resync_interval: Duration::from_secs(get_env_u64_with_default(
                "RESYNC_INTERVAL_SECS",
                300,
            )),
            upgrade_check_enabled: get_env_bool_with_default("UPGRADE_CHECK_ENABLED", true),
            upgrade_check_url: get_env_optional("UPGRADE_CHECK_URL"),
            upgrade_check_interval: Duration::from_secs(get_env_u64_with_default(
                "UPGRADE_CHECK_INTERVAL_SECS",
                3600,
            )),
            health_port: get_env_u16_with_default("HEALTH_PORT", 8080),
            metrics_port: get_env_u16_with_default("METRICS_PORT", 8081),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        compat::parse_version(&self.server_version)
            .with_context(|| format!("SERVER_VERSION {:?} is not a valid version", self.server_version))?;

        if self.crd_chart_name == self.core_chart_name {
            return Err(anyhow!(
                "CRD_CHART_NAME and CORE_CHART_NAME must differ (both are {})",
                self.crd_chart_name
            ));
        }

        if self.health_port == self.metrics_port {
            return Err(anyhow!(
                "HEALTH_PORT and METRICS_PORT must differ (both are {})",
                self.health_port
            ));
        }

        Ok(())
    }

    /// Manifest charts in the order they must be upgraded.
    pub fn manifest_charts(&self) -> [&str; 2] {
        [&self.crd_chart_name, &self.core_chart_name]
    }

    /// The upgrade check endpoint, if checking is enabled and a URL is configured.
    pub fn upgrade_check_endpoint(&self) -> Option<&str> {
        if !self.upgrade_check_enabled {
            return None;
        }
        self.upgrade_check_url.as_deref().filter(|u| !u.is_empty())
    }
}

fn default_server_version() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}

fn get_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn get_env_with_default(key: &str, default: &str) -> String {
    get_env_optional(key).unwrap_or_else(|| default.to_string())
}

fn get_env_u64_with_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_u16_with_default(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_bool_with_default(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
impl Config {
    pub fn new_for_test() -> Self {
        Self {
            system_namespace: "puo-system".to_string(),
            upgrade_namespace: "system-upgrade".to_string(),
            server_version: "v0.2.0".to_string(),
            system_image_registry: "docker.io".to_string(),
            crd_chart_name: "platform-crd".to_string(),
            core_chart_name: "platform".to_string(),
            resync_interval: Duration::from_secs(300),
            upgrade_check_enabled: true,
            upgrade_check_url: None,
            upgrade_check_interval: Duration::from_secs(3600),
            health_port: 8080,
            metrics_port: 8081,
        }
    }
}
