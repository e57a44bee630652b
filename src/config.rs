//! Settings for the CLI and registry: store base directory, default CA
//! URL/contacts/agreement, the drive polling schedule, and the HTTP-01
//! responder port. Layered defaults → TOML file → `ACMEMD_`-prefixed
//! environment variables, following the teacher's deleted `config.rs`/
//! `config/defaults.rs` builder pattern.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::drive::DriveSettings;
use crate::error::{AcmeMdError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default = "default_ca_url")]
    pub default_ca_url: String,
    #[serde(default)]
    pub default_contacts: Vec<String>,
    #[serde(default)]
    pub default_agreement: Option<String>,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default = "default_http01_port")]
    pub http01_port: u16,
    #[serde(default = "default_renew_within_days")]
    pub renew_within_days: u32,
    #[serde(default = "default_daemon_interval_secs")]
    pub daemon_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_poll_floor_secs")]
    pub floor_secs: u64,
    #[serde(default = "default_poll_cap_secs")]
    pub cap_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            floor_secs: default_poll_floor_secs(),
            cap_secs: default_poll_cap_secs(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl PollSettings {
    #[must_use]
    pub fn to_drive_settings(&self) -> DriveSettings {
        DriveSettings {
            poll_floor: Duration::from_secs(self.floor_secs),
            poll_cap: Duration::from_secs(self.cap_secs),
            poll_timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/acmemd")
}

fn default_ca_url() -> String {
    "https://acme-v01.api.letsencrypt.org/directory".to_string()
}

fn default_http01_port() -> u16 {
    8080
}

fn default_renew_within_days() -> u32 {
    30
}

fn default_daemon_interval_secs() -> u64 {
    3600
}

fn default_poll_floor_secs() -> u64 {
    1
}

fn default_poll_cap_secs() -> u64 {
    30
}

fn default_poll_timeout_secs() -> u64 {
    300
}

impl Settings {
    /// Loads layered configuration: built-in defaults, then an optional
    /// TOML file at `path`, then `ACMEMD_`-prefixed environment
    /// variables (e.g. `ACMEMD_STORE_DIR`, `ACMEMD_HTTP01_PORT`).
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("store_dir", default_store_dir().to_string_lossy().into_owned())?
            .set_default("default_ca_url", default_ca_url())?
            .set_default("default_contacts", Vec::<String>::new())?
            .set_default("http01_port", i64::from(default_http01_port()))?
            .set_default("renew_within_days", i64::from(default_renew_within_days()))?
            .set_default("daemon_interval_secs", default_daemon_interval_secs() as i64)?
            .set_default("poll.floor_secs", default_poll_floor_secs() as i64)?
            .set_default("poll.cap_secs", default_poll_cap_secs() as i64)?
            .set_default("poll.timeout_secs", default_poll_timeout_secs() as i64)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("ACMEMD").separator("_"));

        let raw = builder.build()?;
        Ok(raw.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ca_url.is_empty() {
            return Err(AcmeMdError::InvalidArgument(
                "default_ca_url must not be empty".to_string(),
            ));
        }
        if self.poll.floor_secs == 0 {
            return Err(AcmeMdError::InvalidArgument(
                "poll.floor_secs must be at least 1".to_string(),
            ));
        }
        if self.poll.cap_secs < self.poll.floor_secs {
            return Err(AcmeMdError::InvalidArgument(
                "poll.cap_secs must be >= poll.floor_secs".to_string(),
            ));
        }
        Ok(())
    }
}
