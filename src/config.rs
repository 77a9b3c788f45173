//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Engine-level knobs shared by the worker loop and reporting.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker poll interval when the queue is empty.
    pub poll_interval: Duration,
    /// Output longer than this is delivered as a file attachment instead of
    /// inline chat text.
    pub inline_report_limit: usize,
    /// Provider used when the caller does not name one.
    pub default_provider: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(750),
            inline_report_limit: 3000,
            default_provider: "agent".to_string(),
        }
    }
}

/// Configuration for the local agent provider.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent CLI binary, e.g. `claude`.
    pub command: String,
    /// Fixed arguments placed before the prompt.
    pub args: Vec<String>,
    /// Minimum gap between heartbeat notifications.
    pub heartbeat_interval: Duration,
    /// Cadence at which elapsed time since the last heartbeat is checked.
    pub heartbeat_check: Duration,
    /// Hard wall-clock limit for one job.
    pub timeout: Duration,
    /// Characters of output retained in memory.
    pub tail_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_check: Duration::from_secs(5),
            timeout: Duration::from_secs(3600),
            tail_limit: 14_000,
        }
    }
}

/// Configuration for the tool-loop provider.
#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    /// Maximum model/tool rounds before the job is finalized.
    pub max_rounds: usize,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self { max_rounds: 5 }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_token: SecretString,
    pub allowed_users: Vec<String>,
    pub anthropic_api_key: SecretString,
    pub model: String,
    /// Directory holding the job document and per-job logs.
    pub data_dir: PathBuf,
    /// Directory of repository checkouts selectable per chat.
    pub workspaces_root: PathBuf,
    pub engine: EngineConfig,
    pub agent: AgentConfig,
    pub tool_loop: ToolLoopConfig,
}

impl Config {
    /// Build configuration from `TASKRELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let telegram_token = require_env("TASKRELAY_TELEGRAM_TOKEN")?;
        let anthropic_api_key = require_env("TASKRELAY_ANTHROPIC_API_KEY")?;

        let allowed_users = std::env::var("TASKRELAY_ALLOWED_USERS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let model = std::env::var("TASKRELAY_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

        let data_dir = std::env::var("TASKRELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let workspaces_root = std::env::var("TASKRELAY_WORKSPACES")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./workspaces"));

        let mut agent = AgentConfig::default();
        if let Ok(cmd) = std::env::var("TASKRELAY_AGENT_COMMAND") {
            agent.command = cmd;
        }
        if let Ok(secs) = std::env::var("TASKRELAY_AGENT_TIMEOUT_SECS") {
            agent.timeout = Duration::from_secs(parse_env("TASKRELAY_AGENT_TIMEOUT_SECS", &secs)?);
        }
        if let Ok(secs) = std::env::var("TASKRELAY_HEARTBEAT_SECS") {
            agent.heartbeat_interval =
                Duration::from_secs(parse_env("TASKRELAY_HEARTBEAT_SECS", &secs)?);
        }

        Ok(Self {
            telegram_token: SecretString::from(telegram_token),
            allowed_users,
            anthropic_api_key: SecretString::from(anthropic_api_key),
            model,
            data_dir,
            workspaces_root,
            engine: EngineConfig::default(),
            agent,
            tool_loop: ToolLoopConfig::default(),
        })
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_env(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected an integer, got {value:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_millis(750));
        assert_eq!(cfg.default_provider, "agent");
    }

    #[test]
    fn agent_defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(cfg.timeout, Duration::from_secs(3600));
        assert_eq!(cfg.tail_limit, 14_000);
    }

    #[test]
    fn parse_env_rejects_garbage() {
        assert!(parse_env("X", "12").is_ok());
        assert!(parse_env("X", "twelve").is_err());
    }
}
