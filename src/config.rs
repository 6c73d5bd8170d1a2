use serde::Deserialize;
use std::time::Duration;

/// Longest source tag the outbox can store.
pub const MAX_SOURCE_LEN: usize = 16;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    pub local_prefix: Option<String>,
    pub num_to_id_sql: Option<String>,
    pub filter_command: Option<String>,
    #[serde(default = "default_filter_timeout")]
    pub filter_timeout_ms: u64,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,
    #[serde(default = "default_max_device_errors")]
    pub max_device_errors: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_unknown_source_delay")]
    pub unknown_source_delay_ms: u64,
    pub log_file: Option<String>,
    #[serde(default = "default_health_addr")]
    pub health_addr: String,
    pub sentry_dsn: Option<String>,
}

fn default_max_connections() -> u32 {
    5
}

fn default_poll_interval() -> u64 {
    10_000 // Default to 10 seconds
}

fn default_listen() -> Vec<String> {
    vec!["127.0.0.1:11111".to_string()]
}

fn default_spool_dir() -> String {
    "/var/spool/smsd".to_string()
}

fn default_max_device_errors() -> u32 {
    2
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_unknown_source_delay() -> u64 {
    3_000
}

fn default_filter_timeout() -> u64 {
    30_000
}

fn default_health_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();

        let config = envy::from_env::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), envy::Error> {
        if self.database_url.is_none() {
            return Err(envy::Error::MissingValue("DATABASE_URL"));
        }
        if let Some(tag) = self.sources.iter().find(|s| s.is_empty() || s.len() > MAX_SOURCE_LEN) {
            return Err(envy::Error::Custom(format!(
                "source tag '{tag}' must be 1 to {MAX_SOURCE_LEN} characters"
            )));
        }
        Ok(())
    }

    /// Returns the database URL.
    ///
    /// # Panics
    /// Panics if the database_url is not set. This should only be
    /// called after `load()` which validates it.
    pub fn database_url(&self) -> &str {
        self.database_url
            .as_deref()
            .expect("DATABASE_URL is not set")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn unknown_source_delay(&self) -> Duration {
        Duration::from_millis(self.unknown_source_delay_ms)
    }

    pub fn filter_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_timeout_ms)
    }

    /// The filter command with the legacy `|` pipe marker removed.
    pub fn filter_command(&self) -> Option<&str> {
        self.filter_command
            .as_deref()
            .map(|cmd| cmd.strip_prefix('|').unwrap_or(cmd).trim())
            .filter(|cmd| !cmd.is_empty())
    }
}
