use anyhow::Context;
use serde::Deserialize;

use crate::gateway::ShutdownMode;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Queued commands allowed before `execute` rejects; 0 disables the bound.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// How queued commands are treated when the binary stops.
    #[serde(default)]
    pub shutdown: ShutdownMode,
    /// Log every flushed notification at `info`.
    #[serde(default)]
    pub log_notifications: bool,
}

fn default_max_pending() -> usize {
    4096
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            shutdown: ShutdownMode::default(),
            log_notifications: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics_path: default_metrics_path() }
    }
}

impl Config {
    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading {path}"))?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_yaml::from_slice(bytes).context("parsing config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg = Config::from_slice(b"version: \"1\"\n").unwrap();
        assert_eq!(cfg.gateway.max_pending, 4096);
        assert_eq!(cfg.gateway.shutdown, ShutdownMode::Drain);
        assert_eq!(cfg.http.bind, "127.0.0.1:8080");
        assert_eq!(cfg.observability.metrics_path, "/metrics");
    }

    #[test]
    fn reads_gateway_section() {
        let yaml = b"version: \"1\"\ngateway:\n  max_pending: 0\n  shutdown: abandon\n  log_notifications: true\nhttp:\n  bind: 0.0.0.0:9000\n";
        let cfg = Config::from_slice(yaml).unwrap();
        assert_eq!(cfg.gateway.max_pending, 0);
        assert_eq!(cfg.gateway.shutdown, ShutdownMode::Abandon);
        assert!(cfg.gateway.log_notifications);
        assert_eq!(cfg.http.bind, "0.0.0.0:9000");
    }

    #[test]
    fn version_is_required() {
        assert!(Config::from_slice(b"gateway: {}\n").is_err());
    }
}
