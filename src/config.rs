use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::RowPulseError;
use crate::notify::{desktop, ntfy, slack};
use crate::queue;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const CONFIG_FILE: &str = "config.toml";
const DEFAULT_DB_FILE: &str = "rowpulse.db";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub rowpulse: String,
    /// Also write a rotating log file in the data directory
    pub file: bool,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const ROWPULSE_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            rowpulse: Self::ROWPULSE_LEVEL.to_string(),
            file: false,
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.rowpulse.clone();
        self.rowpulse = self.rowpulse.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.rowpulse.as_str()) {
            eprintln!(
                "Config error: rowpulse log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::ROWPULSE_LEVEL
            );
            self.rowpulse = Self::ROWPULSE_LEVEL.to_owned();
        }
    }

    /// Log specification for the logger, e.g. `rowpulse=debug`
    pub fn log_spec(&self) -> String {
        format!("rowpulse={}", self.rowpulse)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Metadata store file. Empty means `rowpulse.db` in the data directory.
    pub path: String,
    pub pool_size: u32,
}

impl DatabaseConfig {
    const POOL_SIZE: u32 = 4;

    fn default() -> Self {
        DatabaseConfig {
            path: String::new(),
            pool_size: Self::POOL_SIZE,
        }
    }

    fn ensure_valid(&mut self) {
        if self.pool_size == 0 {
            eprintln!(
                "Config error: database pool_size must be at least 1 - using default of {}",
                Self::POOL_SIZE
            );
            self.pool_size = Self::POOL_SIZE;
        }
    }

    pub fn resolve_path(&self, data_dir: &Path) -> PathBuf {
        if self.path.trim().is_empty() {
            data_dir.join(DEFAULT_DB_FILE)
        } else {
            PathBuf::from(self.path.trim())
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub lock_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub claim_limit: u32,
    pub lease_secs: i64,
    pub retry_delay_secs: i64,
    pub max_attempts: u32,
}

impl SchedulerConfig {
    const POLL_INTERVAL_MS: u64 = 1000;
    const LOCK_TIMEOUT_SECS: u64 = 900;
    const SEND_TIMEOUT_SECS: u64 = 30;

    fn default() -> Self {
        SchedulerConfig {
            poll_interval_ms: Self::POLL_INTERVAL_MS,
            lock_timeout_secs: Self::LOCK_TIMEOUT_SECS,
            send_timeout_secs: Self::SEND_TIMEOUT_SECS,
            claim_limit: queue::DEFAULT_CLAIM_LIMIT,
            lease_secs: queue::DEFAULT_LEASE_SECS,
            retry_delay_secs: queue::DEFAULT_RETRY_DELAY_SECS,
            max_attempts: queue::DEFAULT_MAX_ATTEMPTS,
        }
    }

    fn ensure_valid(&mut self) {
        let defaults = Self::default();

        if self.poll_interval_ms == 0 {
            eprintln!(
                "Config error: poll_interval_ms must be positive - using default of {}",
                defaults.poll_interval_ms
            );
            self.poll_interval_ms = defaults.poll_interval_ms;
        }
        if self.lock_timeout_secs == 0 {
            eprintln!(
                "Config error: lock_timeout_secs must be positive - using default of {}",
                defaults.lock_timeout_secs
            );
            self.lock_timeout_secs = defaults.lock_timeout_secs;
        }
        if self.send_timeout_secs == 0 {
            eprintln!(
                "Config error: send_timeout_secs must be positive - using default of {}",
                defaults.send_timeout_secs
            );
            self.send_timeout_secs = defaults.send_timeout_secs;
        }
        if self.claim_limit == 0 {
            eprintln!(
                "Config error: claim_limit must be positive - using default of {}",
                defaults.claim_limit
            );
            self.claim_limit = defaults.claim_limit;
        }
        if self.lease_secs <= 0 {
            eprintln!(
                "Config error: lease_secs of {} is invalid - using default of {}",
                self.lease_secs, defaults.lease_secs
            );
            self.lease_secs = defaults.lease_secs;
        }
        if self.retry_delay_secs < 0 {
            eprintln!(
                "Config error: retry_delay_secs of {} is invalid - using default of {}",
                self.retry_delay_secs, defaults.retry_delay_secs
            );
            self.retry_delay_secs = defaults.retry_delay_secs;
        }
        if self.max_attempts == 0 {
            eprintln!(
                "Config error: max_attempts must be at least 1 - using default of {}",
                defaults.max_attempts
            );
            self.max_attempts = defaults.max_attempts;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotifiersConfig {
    pub enabled: Vec<String>,
}

impl NotifiersConfig {
    const BUILTINS: [&str; 3] = [slack::SLUG, ntfy::SLUG, desktop::SLUG];

    fn default() -> Self {
        NotifiersConfig {
            enabled: Self::BUILTINS.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ensure_valid(&mut self) {
        let mut valid = Vec::with_capacity(self.enabled.len());
        for slug in &self.enabled {
            let normalized = slug.trim().to_ascii_lowercase();
            if Self::BUILTINS.contains(&normalized.as_str()) {
                if !valid.contains(&normalized) {
                    valid.push(normalized);
                }
            } else {
                eprintln!("Config error: unknown notifier '{}' - ignoring", slug);
            }
        }
        self.enabled = valid;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    /// Target databases by name
    #[serde(default)]
    pub sources: BTreeMap<String, PathBuf>,
    pub scheduler: SchedulerConfig,
    pub notifiers: NotifiersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            sources: BTreeMap::new(),
            scheduler: SchedulerConfig::default(),
            notifiers: NotifiersConfig::default(),
        }
    }
}

impl Config {
    pub fn project_dirs() -> Result<ProjectDirs, RowPulseError> {
        ProjectDirs::from("", "", "rowpulse").ok_or_else(|| {
            RowPulseError::Error("Could not determine the project data directory".to_string())
        })
    }

    /// Loads the configuration from `config.toml` in the data directory,
    /// layered over the defaults and under `ROWPULSE_*` environment
    /// variables (`ROWPULSE_SCHEDULER__CLAIM_LIMIT=50`). Writes the defaults
    /// to disk if no file exists. Falls back to defaults if extraction fails.
    pub fn load_config(data_dir: &Path) -> Self {
        let config_path = data_dir.join(CONFIG_FILE);
        let default_config = Config::default();

        if !config_path.exists() {
            Self::write_default(&config_path, &default_config);
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("ROWPULSE_").split("__"));

        let mut config: Config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn write_default(config_path: &Path, default_config: &Config) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(default_config) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(e) => eprintln!("Failed to serialize default config: {}", e),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.database.ensure_valid();
        self.scheduler.ensure_valid();
        self.notifiers.ensure_valid();
    }

    /// Load once and store in [`CONFIG`]. Later calls return the stored value.
    pub fn init(data_dir: &Path) -> &'static Config {
        CONFIG.get_or_init(|| Self::load_config(data_dir))
    }
}
