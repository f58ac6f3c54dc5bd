use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::{EchoError, EchoResult};

/// What a flush does when one of its echoes panics while dispatching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Drop the rest of the batch and resume the panic in the flush task.
    #[default]
    Abort,
    /// Log the failure and keep draining the batch.
    Continue,
}

impl FromStr for FlushPolicy {
    type Err = EchoError;

    fn from_str(s: &str) -> EchoResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "continue" => Ok(Self::Continue),
            other => Err(EchoError::Config(format!("unknown flush policy: {other}"))),
        }
    }
}

/// Echo context configuration.
///
/// `thunk_mode = None` means "decide from the runtime": producers are used
/// when a Tokio runtime is available to resolve them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EchoConfig {
    #[serde(default)]
    pub thunk_mode: Option<bool>,
    #[serde(default)]
    pub flush_policy: FlushPolicy,
}

impl EchoConfig {
    /// Load from `ECHOS_THUNK_MODE` (`true`, `false` or `auto`) and
    /// `ECHOS_FLUSH_POLICY` (`abort` or `continue`). Reads `.env` if present.
    pub fn from_env() -> EchoResult<Self> {
        dotenvy::dotenv().ok();

        let thunk_mode = match std::env::var("ECHOS_THUNK_MODE") {
            Ok(raw) => parse_thunk_mode(&raw)?,
            Err(_) => None,
        };
        let flush_policy = match std::env::var("ECHOS_FLUSH_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => FlushPolicy::default(),
        };

        Ok(Self {
            thunk_mode,
            flush_policy,
        })
    }

    /// Load from a TOML file. Read and parse failures keep their context.
    pub fn from_file(path: &Path) -> EchoResult<Self> {
        Ok(load_config(path)?)
    }

    pub fn with_thunk_mode(mut self, enabled: bool) -> Self {
        self.thunk_mode = Some(enabled);
        self
    }

    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    /// The explicit flag, or the probed capability when unset.
    pub fn resolved_thunk_mode(&self) -> bool {
        self.thunk_mode.unwrap_or_else(runtime_available)
    }
}

fn parse_thunk_mode(raw: &str) -> EchoResult<Option<bool>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "auto" => Ok(None),
        "true" | "1" | "on" => Ok(Some(true)),
        "false" | "0" | "off" => Ok(Some(false)),
        other => Err(EchoError::Config(format!(
            "ECHOS_THUNK_MODE must be true, false or auto (got {other})"
        ))),
    }
}

/// Producers resolve on a Tokio runtime; without one they never complete.
pub fn runtime_available() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<EchoConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML config text.
pub fn parse_config(content: &str) -> Result<EchoConfig> {
    let config: EchoConfig = toml::from_str(content)?;
    Ok(config)
}
