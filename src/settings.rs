use serde::Deserialize;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::Context;
use backtrace::Backtrace;
use log::{error, info};

use crate::mail_source::account::{Account, KeyMatch};

// Main configuration struct
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub accounts_file: PathBuf,
    #[serde(default)]
    pub account_lookup: KeyMatch,
}

// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub refresh_interval_seconds: u64,
    pub send_priority: i32,
    pub receive_priority: i32,
    /// Zero disables the cap.
    pub max_send_attempts: u32,
    pub max_backoff_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            refresh_interval_seconds: 5,
            send_priority: 1,
            receive_priority: 1,
            max_send_attempts: 10,
            max_backoff_seconds: 300,
        }
    }
}

impl QueueConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds.max(1))
    }

    /// Delay before the given (1-based) retry attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.refresh_interval().saturating_mul(1u32 << exponent);
        delay.min(Duration::from_secs(self.max_backoff_seconds.max(1)))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

pub fn load_settings(path: &Path) -> anyhow::Result<Config> {
    let file = File::open(path)
        .with_context(|| format!("Cannot find settings at {}", path.display()))?;
    let reader = BufReader::new(file);

    let config: Config = serde_yaml::from_reader(reader)
        .with_context(|| format!("Cannot deserialize settings at {}", path.display()))?;

    Ok(config)
}

/// Loads the account list. A missing or malformed file leaves the gateway
/// running with no accounts.
pub fn load_accounts(path: &Path) -> Vec<Account> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            error!("Cannot open account file {}: {}", path.display(), err);
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            return Vec::new();
        }
    };

    let reader = BufReader::new(file);

    match serde_yaml::from_reader::<_, Vec<Account>>(reader) {
        Ok(accounts) => {
            info!("Loaded {} account(s) from {}", accounts.len(), path.display());
            accounts
        }
        Err(err) => {
            error!("Cannot deserialize account file {}: {}", path.display(), err);
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            Vec::new()
        }
    }
}
