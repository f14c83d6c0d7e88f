//! Connection configuration for the CloudStack management API.
//!
//! The file format mirrors the one used by the CloudStack cloud
//! controller manager (a `[global]` section with kebab-case keys), so a
//! single config can be shared between the two.

use std::fmt;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("cannot read CloudStack config: {0}")]
  Io(#[from] std::io::Error),

  #[error("cannot parse CloudStack config: {0}")]
  Parse(#[from] toml::de::Error),

  #[error("CloudStack config is missing `{0}`")]
  Missing(&'static str),
}

/// CloudStack connection settings.
#[derive(Clone)]
pub struct CloudStackConfig {
  pub api_url: String,
  pub api_key: String,
  pub secret_key: String,
  /// Skip TLS certificate verification when talking to the API.
  pub ssl_no_verify: bool,
  /// Restrict lookups to a CloudStack project.
  pub project_id: Option<String>,
}

// secret_key stays out of logs
impl fmt::Debug for CloudStackConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CloudStackConfig")
      .field("api_url", &self.api_url)
      .field("api_key", &self.api_key)
      .field("secret_key", &"***")
      .field("ssl_no_verify", &self.ssl_no_verify)
      .field("project_id", &self.project_id)
      .finish()
  }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
  #[serde(default)]
  global: GlobalSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct GlobalSection {
  api_url: Option<String>,
  api_key: Option<String>,
  secret_key: Option<String>,
  ssl_no_verify: bool,
  project_id: Option<String>,
}

impl CloudStackConfig {
  /// Reads the config file, then applies `CLOUDSTACK_*` environment
  /// overrides.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Self::parse(&raw)
  }

  fn parse(raw: &str) -> Result<Self, ConfigError> {
    let file: ConfigFile = toml::from_str(raw)?;
    let global = file.global;

    let api_url = env_or("CLOUDSTACK_API_URL", global.api_url)
      .ok_or(ConfigError::Missing("api-url"))?;
    let api_key = env_or("CLOUDSTACK_API_KEY", global.api_key)
      .ok_or(ConfigError::Missing("api-key"))?;
    let secret_key = env_or("CLOUDSTACK_SECRET_KEY", global.secret_key)
      .ok_or(ConfigError::Missing("secret-key"))?;

    Ok(CloudStackConfig {
      api_url,
      api_key,
      secret_key,
      ssl_no_verify: global.ssl_no_verify,
      project_id: global.project_id,
    })
  }
}

fn env_or(var: &str, fallback: Option<String>) -> Option<String> {
  match std::env::var(var) {
    Ok(v) if !v.is_empty() => Some(v),
    _ => fallback.filter(|v| !v.is_empty()),
  }
}
