// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! dua-config
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors and warnings
// ---------------------------------------------------------------------------

/// Errors raised during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be read.
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A retry delay is unusually large.
    LargeRetryDelay {
        /// Configured maximum delay in seconds.
        secs: u64,
    },
    /// The sandbox root is not an absolute path.
    RelativeSandboxRoot {
        /// The configured path.
        path: String,
    },
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Broker endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BrokerSettings {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Start each session clean instead of resuming.
    #[serde(default)]
    pub clean_start: bool,
}

fn default_port() -> u16 {
    8883
}

fn default_keep_alive() -> u64 {
    30
}

/// Root-key subsystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RootKeySettings {
    /// URL of the signed root-key package.
    pub package_url: String,
    /// Staging path the package is downloaded to before verification.
    pub staging_path: PathBuf,
    /// Refresh interval in seconds.
    #[serde(default = "default_rootkey_refresh")]
    pub refresh_interval_secs: u64,
}

fn default_rootkey_refresh() -> u64 {
    24 * 60 * 60
}

/// Retry tuning shared by the cloud operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RetrySettings {
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Ceiling of every delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Exponential growth factor.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Per-attempt deadline, in seconds.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    4 * 60 * 1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    1.0
}

fn default_attempt_timeout() -> u64 {
    30
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            attempt_timeout_secs: default_attempt_timeout(),
        }
    }
}

impl RetrySettings {
    /// Initial delay as a [`Duration`].
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Max delay as a [`Duration`].
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Attempt timeout as a [`Duration`].
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AgentConfig {
    /// Device identity used in topics and the client id.
    pub device_id: String,
    /// Optional deployment-instance scope appended to topics.
    #[serde(default)]
    pub instance: Option<String>,
    /// Broker endpoint.
    pub broker: BrokerSettings,
    /// Directory under which per-workflow sandboxes live.
    pub sandbox_root: PathBuf,
    /// Path of the workflow progress snapshot.
    pub snapshot_path: PathBuf,
    /// Root-key subsystem; omit to run with the baked-in set only.
    #[serde(default)]
    pub rootkey: Option<RootKeySettings>,
    /// Compatibility properties advertised to the service and matched
    /// against manifest compatibility sets.
    #[serde(default)]
    pub device_properties: BTreeMap<String, String>,
    /// Retry tuning.
    #[serde(default)]
    pub retry: RetrySettings,
}

impl AgentConfig {
    /// Load, overlay environment variables, and validate.
    pub fn load(path: &Path) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&text).map_err(|err| ConfigError::ParseError {
            reason: err.to_string(),
        })?;
        config.apply_env_overrides();
        let warnings = config.validate()?;
        Ok((config, warnings))
    }

    /// Overlay the `DUA_DEVICE_ID` / `DUA_BROKER_HOST` / `DUA_BROKER_PORT`
    /// environment variables when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(device_id) = std::env::var("DUA_DEVICE_ID") {
            self.device_id = device_id;
        }
        if let Ok(host) = std::env::var("DUA_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Ok(port) = std::env::var("DUA_BROKER_PORT") {
            if let Ok(port) = port.parse() {
                self.broker.port = port;
            }
        }
    }

    /// Semantic validation; hard errors fail, soft issues come back as
    /// warnings.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        if self.device_id.trim().is_empty() {
            reasons.push("device-id must not be empty".to_owned());
        }
        if self.broker.host.trim().is_empty() {
            reasons.push("broker.host must not be empty".to_owned());
        }
        if self.retry.initial_delay_ms == 0 {
            reasons.push("retry.initial-delay-ms must be positive".to_owned());
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            reasons.push("retry.max-delay-ms must be >= retry.initial-delay-ms".to_owned());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            reasons.push("retry.jitter must be within [0, 1]".to_owned());
        }
        if self.retry.multiplier < 1.0 {
            reasons.push("retry.multiplier must be >= 1".to_owned());
        }
        if !reasons.is_empty() {
            return Err(ConfigError::ValidationError { reasons });
        }

        let mut warnings = Vec::new();
        if self.device_properties.is_empty() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "device-properties".to_owned(),
                hint: "compatibility checks will match any deployment".to_owned(),
            });
        }
        if self.retry.max_delay_ms > 60 * 60 * 1_000 {
            warnings.push(ConfigWarning::LargeRetryDelay {
                secs: self.retry.max_delay_ms / 1_000,
            });
        }
        if self.sandbox_root.is_relative() {
            warnings.push(ConfigWarning::RelativeSandboxRoot {
                path: self.sandbox_root.display().to_string(),
            });
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
device-id = "dev-1"
sandbox-root = "/var/lib/update-agent/sandbox"
snapshot-path = "/var/lib/update-agent/workflow.json"

[broker]
host = "broker.example"
port = 8883

[device-properties]
manufacturer = "contoso"
model = "toaster"

[retry]
initial-delay-ms = 500
max-delay-ms = 60000
"#;

    fn write_config(text: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("du-config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_sample_config() {
        let (_dir, path) = write_config(SAMPLE);
        let (config, warnings) = AgentConfig::load(&path).unwrap();
        assert_eq!(config.device_id, "dev-1");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.device_properties["model"], "toaster");
        assert_eq!(config.retry.initial_delay(), Duration::from_millis(500));
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = AgentConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let (_dir, path) = write_config("device-id = ");
        let err = AgentConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let (_dir, path) = write_config(&format!("{SAMPLE}\nmystery-knob = 3\n"));
        let err = AgentConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn empty_device_id_fails_validation() {
        let (_dir, path) = write_config(&SAMPLE.replace("\"dev-1\"", "\"  \""));
        let err = AgentConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn inverted_retry_bounds_fail_validation() {
        let (_dir, path) =
            write_config(&SAMPLE.replace("max-delay-ms = 60000", "max-delay-ms = 100"));
        let err = AgentConfig::load(&path).unwrap_err();
        let ConfigError::ValidationError { reasons } = err else {
            panic!("expected validation error");
        };
        assert!(reasons.iter().any(|r| r.contains("max-delay-ms")));
    }

    #[test]
    fn missing_device_properties_is_a_warning() {
        let trimmed = SAMPLE
            .replace("[device-properties]\nmanufacturer = \"contoso\"\nmodel = \"toaster\"\n", "");
        let (_dir, path) = write_config(&trimmed);
        let (_, warnings) = AgentConfig::load(&path).unwrap();
        assert!(warnings.iter().any(|w| matches!(
            w,
            ConfigWarning::MissingOptionalField { field, .. } if field == "device-properties"
        )));
    }

    #[test]
    fn relative_sandbox_root_is_a_warning() {
        let (_dir, path) = write_config(&SAMPLE.replace(
            "\"/var/lib/update-agent/sandbox\"",
            "\"relative/sandbox\"",
        ));
        let (_, warnings) = AgentConfig::load(&path).unwrap();
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::RelativeSandboxRoot { .. })));
    }
}
