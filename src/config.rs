use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{fmt, fs, path::Path, time::Duration};

use crate::error::MissingCredentialsError;
use crate::grid::ChannelSet;

pub const API_KEY_VAR: &str = "API_KEY";
pub const SECRET_KEY_VAR: &str = "SECRET_KEY";

/// Basic-auth pair for the analytics API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    secret_key: String,
}

impl Credentials {
    /// Blank values count as missing.
    pub fn new(
        api_key: Option<String>,
        secret_key: Option<String>,
    ) -> Result<Self, MissingCredentialsError> {
        let api_key = api_key.filter(|s| !s.trim().is_empty());
        let secret_key = secret_key.filter(|s| !s.trim().is_empty());
        match (api_key, secret_key) {
            (Some(api_key), Some(secret_key)) => Ok(Self {
                api_key,
                secret_key,
            }),
            (api_key, secret_key) => {
                let mut missing = Vec::new();
                if api_key.is_none() {
                    missing.push(API_KEY_VAR);
                }
                if secret_key.is_none() {
                    missing.push(SECRET_KEY_VAR);
                }
                Err(MissingCredentialsError { missing })
            }
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Parameters of the segmentation query and of the HTTP client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FetchSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_event_type")]
    pub event_type: String,
    /// Id of the derived user property that holds the marketing channel.
    #[serde(default = "default_channel_property")]
    pub channel_property: String,
    /// Event property whose values become one row each.
    #[serde(default = "default_group_by")]
    pub group_by: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_interval")]
    pub interval: i32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Skip TLS certificate verification. Only for legacy endpoints.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

fn default_endpoint() -> String {
    "https://amplitude.com/api/2/events/segmentation".to_string()
}

fn default_event_type() -> String {
    "payment_confirmation_loaded".to_string()
}

fn default_channel_property() -> String {
    "acce9394-0a0d-4285-95a8-c5c1678ddc86".to_string()
}

fn default_group_by() -> String {
    "pnr".to_string()
}

const fn default_limit() -> usize {
    20_000
}

const fn default_interval() -> i32 {
    1
}

const fn default_timeout_secs() -> u64 {
    30
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            event_type: default_event_type(),
            channel_property: default_channel_property(),
            group_by: default_group_by(),
            limit: default_limit(),
            interval: default_interval(),
            timeout_secs: default_timeout_secs(),
            insecure_skip_tls_verify: false,
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Timeout and row limit must both be non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            bail!("fetch.timeout_secs must be at least 1");
        }
        if self.limit == 0 {
            bail!("fetch.limit must be at least 1");
        }
        Ok(())
    }
}

/// Contents of the optional YAML config file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub channels: ChannelSet,
}

impl ReportConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s).context("parsing report config")?;
        config.fetch.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("in {}", path.display()))
    }
}
