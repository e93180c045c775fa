use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub cache_dir: String,
    pub write_timeout_ms: u64,
    /// 0 disables the periodic resync loop.
    pub resync_interval_ms: u64,
    pub repair_users: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let cache_dir = env_map
            .get("CACHE_DIR")
            .cloned()
            .unwrap_or_else(|| ".ledger-cache".to_string());

        let write_timeout_ms = parse_millis(&env_map, "WRITE_TIMEOUT_MS", "5000")?;
        if write_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "WRITE_TIMEOUT_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let resync_interval_ms = parse_millis(&env_map, "RESYNC_INTERVAL_MS", "30000")?;
        let repair_users = parse_repair_users_from_map(&env_map)?;

        Ok(Config {
            database_path,
            cache_dir,
            write_timeout_ms,
            resync_interval_ms,
            repair_users,
        })
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_ms > 0).then(|| Duration::from_millis(self.resync_interval_ms))
    }
}

fn parse_millis(
    env_map: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> Result<u64, ConfigError> {
    env_map
        .get(key)
        .map(|s| s.as_str())
        .unwrap_or(default)
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), "must be a valid u64".to_string()))
}

fn parse_repair_users_from_map(
    env_map: &HashMap<String, String>,
) -> Result<Vec<String>, ConfigError> {
    if let Some(users_str) = env_map.get("REPAIR_USERS") {
        Ok(users_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    } else if let Some(file_path) = env_map.get("REPAIR_USERS_FILE") {
        let content = std::fs::read_to_string(file_path).map_err(|_| {
            ConfigError::InvalidValue(
                "REPAIR_USERS_FILE".to_string(),
                "file not found or unreadable".to_string(),
            )
        })?;
        Ok(content
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    } else {
        Ok(Vec::new())
    }
}
