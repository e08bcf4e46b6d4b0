//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeGateError, Result};

/// Top-level nodegate configuration, read from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub commands: CommandsConfig,

    /// Frames buffered per connection before sends are rejected (default: 256).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            auth: None,
            heartbeat: HeartbeatConfig::default(),
            commands: CommandsConfig::default(),
            outbound_buffer: default_outbound_buffer(),
            rate_limit: None,
        }
    }
}

fn default_port() -> u16 {
    8470
}

fn default_outbound_buffer() -> usize {
    256
}

/// Shared-secret node authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_env: Option<String>,
}

impl GatewayAuthConfig {
    /// Resolve the node secret from direct value or env var.
    pub fn resolve_secret(&self) -> Option<String> {
        resolve_secret_field(&self.secret, &self.secret_env)
    }
}

/// Liveness sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between sweeps (default: 30).
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// Seconds of silence before a node is evicted (default: 60).
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            timeout_secs: default_heartbeat_timeout(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    60
}

impl HeartbeatConfig {
    /// Sweep period; never zero, a zero setting is read as one second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Command dispatch defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Timeout applied to command types listed in `slow_commands`.
    #[serde(default = "default_slow_timeout_ms")]
    pub slow_timeout_ms: u64,

    #[serde(default = "default_slow_commands")]
    pub slow_commands: Vec<String>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_command_timeout_ms(),
            slow_timeout_ms: default_slow_timeout_ms(),
            slow_commands: default_slow_commands(),
        }
    }
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_slow_timeout_ms() -> u64 {
    60_000
}

fn default_slow_commands() -> Vec<String> {
    vec!["restart".into(), "update".into(), "reboot".into()]
}

impl CommandsConfig {
    /// Default response timeout for a command type.
    pub fn timeout_for(&self, command_type: &str) -> Duration {
        if self.slow_commands.iter().any(|c| c == command_type) {
            Duration::from_millis(self.slow_timeout_ms)
        } else {
            Duration::from_millis(self.default_timeout_ms)
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Max upgrade attempts per IP per minute (default: 10).
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,
}

fn default_max_connections_per_ip() -> u32 {
    10
}

/// Which persistence adapter backs node, command and log records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Directory for the file store (default: `~/.nodegate/store`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "nodegate_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| NodeGateError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5, with env substitution).
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| NodeGateError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Gateway section, or defaults when absent.
    pub fn gateway(&self) -> GatewayConfig {
        self.gateway.clone().unwrap_or_default()
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// The shared secret nodes must present on upgrade.
    pub fn node_secret(&self) -> Option<String> {
        self.gateway
            .as_ref()
            .and_then(|g| g.auth.as_ref())
            .and_then(|a| a.resolve_secret())
    }

    pub fn store_kind(&self) -> StoreKind {
        self.store.as_ref().map(|s| s.kind).unwrap_or_default()
    }

    /// Resolve the file-store directory, expanding `~`.
    pub fn store_dir(&self) -> PathBuf {
        self.store
            .as_ref()
            .and_then(|s| s.dir.as_ref())
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| data_dir().join("store"))
    }

    /// Validate the config. Returns (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let gateway = self.gateway();

        if self.node_secret().is_none() {
            errors.push(
                "gateway.auth.secret is not set; every node upgrade will be rejected".to_string(),
            );
        }

        if gateway.heartbeat.interval_secs == 0 {
            errors.push("gateway.heartbeat.interval_secs must be greater than zero".to_string());
        }
        if gateway.heartbeat.timeout_secs == 0 {
            errors.push("gateway.heartbeat.timeout_secs must be greater than zero".to_string());
        } else if gateway.heartbeat.timeout_secs <= gateway.heartbeat.interval_secs {
            warnings.push(format!(
                "gateway.heartbeat.timeout_secs ({}) should exceed interval_secs ({})",
                gateway.heartbeat.timeout_secs, gateway.heartbeat.interval_secs
            ));
        }

        if gateway.commands.default_timeout_ms == 0 || gateway.commands.slow_timeout_ms == 0 {
            errors.push("gateway.commands timeouts must be greater than zero".to_string());
        }

        if gateway.outbound_buffer == 0 {
            errors.push("gateway.outbound_buffer must be greater than zero".to_string());
        }

        if let Some(logging) = &self.logging {
            if logging.format != "plain" && logging.format != "json" {
                warnings.push(format!(
                    "logging.format '{}' is unknown; falling back to plain",
                    logging.format
                ));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for nodegate data: `~/.nodegate/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nodegate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, unique variable name
        unsafe { std::env::set_var("TEST_NG_SECRET", "s3cret") };
        let input = r#"{"key": "${TEST_NG_SECRET}", "other": "plain"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("s3cret"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_NG_SECRET") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_NG_TEST}"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        let gateway = config.gateway();
        assert_eq!(config.gateway_port(), 8470);
        assert_eq!(config.bind_addr(), "0.0.0.0");
        assert_eq!(gateway.heartbeat.interval(), Duration::from_secs(30));
        assert_eq!(gateway.heartbeat.timeout(), Duration::from_secs(60));
        assert_eq!(gateway.outbound_buffer, 256);
        assert_eq!(config.store_kind(), StoreKind::Memory);
    }

    #[test]
    fn test_zero_heartbeat_interval_is_error_and_clamped() {
        let config: Config = json5::from_str(
            r#"{ gateway: { auth: { secret: "x" }, heartbeat: { interval_secs: 0 } } }"#,
        )
        .unwrap();
        let (_, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("interval_secs")));
        assert_eq!(config.gateway().heartbeat.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/definitely/not/here/config.json")).unwrap();
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_parse_json5() {
        let config = Config::parse(
            r#"{
                // comments are fine
                gateway: {
                    port: 9000,
                    auth: { secret: "abc" },
                    heartbeat: { timeout_secs: 90 },
                },
                store: { kind: "file", dir: "/tmp/ng" },
            }"#,
        )
        .unwrap();
        assert_eq!(config.gateway_port(), 9000);
        assert_eq!(config.node_secret().as_deref(), Some("abc"));
        let gateway = config.gateway();
        assert_eq!(gateway.heartbeat.timeout_secs, 90);
        assert_eq!(gateway.heartbeat.interval_secs, 30);
        assert_eq!(config.store_kind(), StoreKind::File);
        assert_eq!(config.store_dir(), PathBuf::from("/tmp/ng"));
    }

    #[test]
    fn test_secret_resolution_prefers_direct() {
        // SAFETY: test-only, unique variable name
        unsafe { std::env::set_var("TEST_NG_NODE_SECRET", "from-env") };
        let auth = GatewayAuthConfig {
            secret: None,
            secret_env: Some("TEST_NG_NODE_SECRET".into()),
        };
        assert_eq!(auth.resolve_secret(), Some("from-env".into()));

        let auth = GatewayAuthConfig {
            secret: Some("direct".into()),
            secret_env: Some("TEST_NG_NODE_SECRET".into()),
        };
        assert_eq!(auth.resolve_secret(), Some("direct".into()));
        unsafe { std::env::remove_var("TEST_NG_NODE_SECRET") };
    }

    #[test]
    fn test_command_timeouts() {
        let commands = CommandsConfig::default();
        assert_eq!(commands.timeout_for("status"), Duration::from_millis(30_000));
        assert_eq!(commands.timeout_for("restart"), Duration::from_millis(60_000));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_missing_secret_errors() {
        let (_, errors) = Config::default().validate();
        assert!(errors.iter().any(|e| e.contains("auth.secret")));
    }

    #[test]
    fn test_validate_short_timeout_warns() {
        let config = Config {
            gateway: Some(GatewayConfig {
                auth: Some(GatewayAuthConfig {
                    secret: Some("x".into()),
                    secret_env: None,
                }),
                heartbeat: HeartbeatConfig {
                    interval_secs: 30,
                    timeout_secs: 20,
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.contains("timeout_secs")));
    }
}
