use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_LOG_FILTER: &str = "sandbox_orchestrator=info,sandboxctl=info";

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long lifecycle calls wait for a busy sandbox. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    pub state_dir: Option<PathBuf>,
    /// Write sandbox state to `state_dir` instead of keeping it in memory.
    pub persist: bool,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("SANDBOX_LOCK_TIMEOUT_SECS").ok().as_deref(),
            std::env::var("SANDBOX_STATE_DIR").ok().as_deref(),
            std::env::var("SANDBOX_PERSIST").ok().as_deref(),
            std::env::var("SANDBOX_LOG").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        lock_timeout_secs: Option<&str>,
        state_dir: Option<&str>,
        persist: Option<&str>,
        log_filter: Option<&str>,
    ) -> Self {
        let lock_timeout = lock_timeout_secs
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let state_dir = state_dir
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .or_else(default_state_dir);

        let persist = persist
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        let log_filter = log_filter
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Config {
            lock_timeout,
            state_dir,
            persist,
            log_filter,
        }
    }
}

fn default_state_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".sandboxctl"))
}
