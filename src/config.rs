//! Configuration for the auth session manager

use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::Result;
use crate::error::Error;

/// How often the refresh scheduler polls the session expiry.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// How long before expiry a refresh is attempted proactively.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Pause after rewriting the code verifier, letting the write flush
/// before the exchange is retried.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Auth manager configuration
///
/// Read once at [`SessionProvider`](crate::provider::SessionProvider)
/// construction; not mutated at runtime by this subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Identity backend base URL (e.g. `https://abc.supabase.co/auth/v1`)
    pub base_url: String,

    /// Public (anon) API key sent with every backend request
    pub api_key: String,

    /// Deployment project identifier, used to derive provider-scoped
    /// storage key names
    #[serde(default = "default_project_ref")]
    pub project_ref: String,

    /// Namespace prefix for the legacy storage key aliases
    #[serde(default = "default_namespace")]
    pub storage_namespace: String,

    /// When set, sign-in/up bypass the network entirely via the offline
    /// sentinel credential
    #[serde(default)]
    pub offline_mode: bool,

    /// Server-assisted recovery endpoint (step 3 of OAuth recovery)
    #[serde(default)]
    pub recovery_endpoint: Option<String>,

    /// Scheduler poll cadence
    #[serde(default = "default_poll_interval", with = "duration_secs")]
    pub poll_interval: Duration,

    /// Proactive refresh window before expiry
    #[serde(default = "default_refresh_threshold", with = "duration_secs")]
    pub refresh_threshold: Duration,

    /// Wait between verifier regeneration and the retried exchange
    #[serde(default = "default_settle_delay", with = "duration_millis")]
    pub settle_delay: Duration,
}

fn default_project_ref() -> String {
    "mesa".to_string()
}

fn default_namespace() -> String {
    "mesa".to_string()
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_refresh_threshold() -> Duration {
    DEFAULT_REFRESH_THRESHOLD
}

fn default_settle_delay() -> Duration {
    DEFAULT_SETTLE_DELAY
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            project_ref: default_project_ref(),
            storage_namespace: default_namespace(),
            offline_mode: false,
            recovery_endpoint: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl AuthConfig {
    /// Build configuration from environment variables
    ///
    /// Requires `MESA_AUTH_URL` and `MESA_AUTH_ANON_KEY`; everything else
    /// falls back to defaults.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("MESA_AUTH_URL")
            .map_err(|_| Error::Config("MESA_AUTH_URL is not set".to_string()))?;
        let api_key = std::env::var("MESA_AUTH_ANON_KEY")
            .map_err(|_| Error::Config("MESA_AUTH_ANON_KEY is not set".to_string()))?;

        let mut config = Self {
            base_url,
            api_key,
            ..Self::default()
        };

        if let Ok(project_ref) = std::env::var("MESA_AUTH_PROJECT_REF") {
            config.project_ref = project_ref;
        }
        if let Ok(endpoint) = std::env::var("MESA_AUTH_RECOVERY_URL") {
            config.recovery_endpoint = Some(endpoint);
        }
        config.offline_mode = std::env::var("MESA_AUTH_OFFLINE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(config)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
