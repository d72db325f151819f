use std::env;
use std::path::PathBuf;

/// Process-level configuration.
///
/// Reads the three environment variables the relay understands, falling back
/// to sensible defaults when unset.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Root directory holding `data/`. `PROJECT_DIR` env var.
    pub project_dir: PathBuf,
    /// Path to the external agent binary. `CLAUDE_PATH` env var.
    pub claude_path: String,
    /// Display-only timezone name. `USER_TIMEZONE` env var.
    pub user_timezone: Option<String>,
}

impl RelayConfig {
    /// The default agent binary, found via `$PATH`.
    pub const DEFAULT_AGENT: &str = "claude";

    /// Build a config from the environment.
    ///
    /// `PROJECT_DIR` defaults to the current directory, then to
    /// `~/.relay` when the current directory cannot be determined.
    pub fn from_env() -> Self {
        let project_dir = env::var("PROJECT_DIR")
            .map(PathBuf::from)
            .or_else(|_| env::current_dir())
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".relay")
            });
        let claude_path =
            env::var("CLAUDE_PATH").unwrap_or_else(|_| Self::DEFAULT_AGENT.to_owned());
        let user_timezone = env::var("USER_TIMEZONE").ok();

        Self {
            project_dir,
            claude_path,
            user_timezone,
        }
    }

    /// Build a config rooted at an explicit directory (useful for tests).
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            claude_path: Self::DEFAULT_AGENT.to_owned(),
            user_timezone: None,
        }
    }

    /// The `data/` root under the project directory.
    pub fn data_dir(&self) -> PathBuf {
        self.project_dir.join("data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_root() {
        let cfg = RelayConfig::new("/srv/relay");
        assert_eq!(cfg.project_dir, PathBuf::from("/srv/relay"));
        assert_eq!(cfg.data_dir(), PathBuf::from("/srv/relay/data"));
        assert_eq!(cfg.claude_path, "claude");
    }

    #[test]
    fn default_agent_binary() {
        assert_eq!(RelayConfig::DEFAULT_AGENT, "claude");
    }
}
