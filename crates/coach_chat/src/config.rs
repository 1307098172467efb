//! Runtime configuration.
//!
//! Values come from `<data_dir>/config.toml` when present, then from
//! environment variables:
//!
//! | field | env |
//! |---|---|
//! | `data_dir` | `COACH_DATA_DIR` |
//! | `producer_idle_timeout_secs` | `COACH_PRODUCER_IDLE_TIMEOUT` |
//! | `turn_timeout_secs` | `COACH_TURN_TIMEOUT` |
//! | `stream_channel_capacity` | `COACH_STREAM_CAPACITY` |
//! | `terminal_send_timeout_ms` | `COACH_TERMINAL_SEND_TIMEOUT_MS` |
//! | `model` | `COACH_LLM_MODEL` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ChatResult;
use crate::turn::TurnConfig;

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoachConfig {
    pub data_dir: PathBuf,
    pub producer_idle_timeout_secs: u64,
    pub turn_timeout_secs: u64,
    pub stream_channel_capacity: usize,
    pub terminal_send_timeout_ms: u64,
    /// Model override for the LLM producer
    pub model: Option<String>,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".coach"),
            producer_idle_timeout_secs: 60,
            turn_timeout_secs: 300,
            stream_channel_capacity: 128,
            terminal_send_timeout_ms: 2000,
            model: None,
        }
    }
}

impl CoachConfig {
    /// Load configuration. An explicit `data_dir` wins over `COACH_DATA_DIR`.
    pub fn load(data_dir: Option<&Path>) -> ChatResult<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        Self::load_with(data_dir, lookup)
    }

    /// Load with a custom environment lookup
    pub fn load_with(
        data_dir: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> ChatResult<Self> {
        let data_dir = data_dir
            .map(Path::to_path_buf)
            .or_else(|| env("COACH_DATA_DIR").filter(|d| !d.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| Self::default().data_dir);

        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            debug!("Loading config from {:?}", path);
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<Self>(&content)?
        } else {
            Self::default()
        };

        config.data_dir = data_dir;
        config.apply_env(env);
        Ok(config)
    }

    /// Apply environment overrides; unparseable values are ignored
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(value) = parse_env(&env, "COACH_PRODUCER_IDLE_TIMEOUT") {
            self.producer_idle_timeout_secs = value;
        }
        if let Some(value) = parse_env(&env, "COACH_TURN_TIMEOUT") {
            self.turn_timeout_secs = value;
        }
        if let Some(value) = parse_env(&env, "COACH_STREAM_CAPACITY") {
            self.stream_channel_capacity = value;
        }
        if let Some(value) = parse_env(&env, "COACH_TERMINAL_SEND_TIMEOUT_MS") {
            self.terminal_send_timeout_ms = value;
        }
        if let Some(model) = env("COACH_LLM_MODEL").filter(|m| !m.is_empty()) {
            self.model = Some(model);
        }
    }

    /// Watchdog and transport settings for the turn processor
    pub fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            producer_idle_timeout: Duration::from_secs(self.producer_idle_timeout_secs.max(1)),
            turn_timeout: Duration::from_secs(self.turn_timeout_secs.max(1)),
            stream_capacity: self.stream_channel_capacity.max(1),
            important_send_timeout: Duration::from_millis(self.terminal_send_timeout_ms),
        }
    }
}

fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid number", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let temp = tempdir().unwrap();
        let config = CoachConfig::load_with(Some(temp.path()), env_from(&[])).unwrap();
        assert_eq!(config.data_dir, temp.path());
        assert_eq!(config.turn_timeout_secs, 300);
        assert_eq!(config.turn_config().producer_idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_file_then_env() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("config.toml"),
            "turn_timeout_secs = 30\nstream_channel_capacity = 16\nmodel = \"from-file\"\n",
        )
        .unwrap();

        let config = CoachConfig::load_with(
            Some(temp.path()),
            env_from(&[
                ("COACH_STREAM_CAPACITY", "8"),
                ("COACH_PRODUCER_IDLE_TIMEOUT", "soon"),
                ("COACH_LLM_MODEL", "from-env"),
            ]),
        )
        .unwrap();

        assert_eq!(config.turn_timeout_secs, 30);
        assert_eq!(config.stream_channel_capacity, 8);
        assert_eq!(config.producer_idle_timeout_secs, 60);
        assert_eq!(config.model.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_data_dir_from_env() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("state");
        let config =
            CoachConfig::load_with(None, env_from(&[("COACH_DATA_DIR", dir.to_str().unwrap())])).unwrap();
        assert_eq!(config.data_dir, dir);
    }

    #[test]
    fn test_invalid_toml() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("config.toml"), "turn_timeout_secs = \"x\"").unwrap();
        let err = CoachConfig::load_with(Some(temp.path()), env_from(&[])).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }
}
