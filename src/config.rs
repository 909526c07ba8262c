use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Which AI coding CLI the bridge drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Claude,
    Codex,
}

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    pub github_webhook_secret: String,
    pub provider: ProviderKind,
    pub trigger_keyword: String,
    pub port: u16,
    /// Path of the SQLite task store. Parent directories are created on startup.
    pub taskstore_db_path: PathBuf,
    pub dispatcher: DispatcherConfig,
    /// Permission-check bypass (ALLOW_ALL_USERS=true or PERMISSION_MODE=open).
    pub allow_all_users: bool,
    pub git_name: String,
    pub git_email: String,
    pub claude_model: String,
    pub anthropic_api_key: Option<String>,
    pub codex_model: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_size: usize,
    /// Maximum attempts per task, inclusive of the first try.
    pub max_attempts: u32,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub backoff_multiplier: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 16,
            max_attempts: 3,
            retry_initial: Duration::from_secs(15),
            retry_max: Duration::from_secs(300),
            backoff_multiplier: 2,
        }
    }
}

/// Read a required config value.
///
/// For a key like "GITHUB_PRIVATE_KEY":
/// 1. Check if GITHUB_PRIVATE_KEY_FILE is set - if so, read from that file path
/// 2. Otherwise, check GITHUB_PRIVATE_KEY env var directly
///
/// When reading from env var, `\n` escape sequences are converted to actual newlines
/// for backward compatibility (needed for PEM keys stored as single-line env vars).
fn read_secret(key: &str) -> Result<String> {
    let file_key = format!("{}_FILE", key);

    if let Ok(path) = env::var(&file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from file: {}", key, path))?;
        // Trim trailing whitespace (files often have trailing newlines)
        Ok(contents.trim_end().to_string())
    } else {
        let value = env::var(key)
            .with_context(|| format!("{} or {} environment variable is required", key, file_key))?;
        Ok(value.replace("\\n", "\n"))
    }
}

/// Read an optional config value, with the same `_FILE` indirection as
/// `read_secret`. Returns `None` when unset or empty/whitespace-only.
fn read_secret_optional(key: &str) -> Result<Option<String>> {
    let file_key = format!("{}_FILE", key);

    let value = if let Ok(path) = env::var(&file_key) {
        // _FILE is explicitly set - error if we can't read it
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from file: {}", key, path))?;
        Some(contents)
    } else {
        env::var(key).ok()
    };

    Ok(value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number (got {:?})", key, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = read_secret("GITHUB_APP_ID")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = read_secret("GITHUB_PRIVATE_KEY")?;

        let github_webhook_secret = read_secret("GITHUB_WEBHOOK_SECRET")?;

        let provider = match env_or("PROVIDER", "claude").to_lowercase().as_str() {
            "claude" => ProviderKind::Claude,
            "codex" => ProviderKind::Codex,
            other => anyhow::bail!("PROVIDER must be 'claude' or 'codex' (got {:?})", other),
        };

        let trigger_keyword = env_or("TRIGGER_KEYWORD", "/code");

        let port = env_parse::<u16>("PORT", 8000)?;

        let taskstore_db_path =
            PathBuf::from(env_or("TASKSTORE_DB_PATH", "./data/tasks.db"));

        let dispatcher = DispatcherConfig {
            workers: env_parse("DISPATCHER_WORKERS", 4usize)?,
            queue_size: env_parse("DISPATCHER_QUEUE_SIZE", 16usize)?,
            max_attempts: env_parse("DISPATCHER_MAX_ATTEMPTS", 3u32)?,
            retry_initial: Duration::from_secs(env_parse("DISPATCHER_RETRY_SECONDS", 15u64)?),
            retry_max: Duration::from_secs(env_parse("DISPATCHER_RETRY_MAX_SECONDS", 300u64)?),
            backoff_multiplier: env_parse("DISPATCHER_BACKOFF_MULTIPLIER", 2u32)?,
        };

        let allow_all_users = env_or("ALLOW_ALL_USERS", "").trim().eq_ignore_ascii_case("true")
            || env_or("PERMISSION_MODE", "").trim().eq_ignore_ascii_case("open");

        let git_name = env_or("SWE_AGENT_GIT_NAME", "swe-agent");
        let git_email = env_or("SWE_AGENT_GIT_EMAIL", "swe-agent[bot]@users.noreply.github.com");

        let claude_model = env_or("CLAUDE_MODEL", "claude-sonnet-4-5");
        let anthropic_api_key = read_secret_optional("ANTHROPIC_API_KEY")?;

        let codex_model = env_or("CODEX_MODEL", "gpt-5-codex");
        let openai_api_key = read_secret_optional("OPENAI_API_KEY")?;
        let openai_base_url = read_secret_optional("OPENAI_BASE_URL")?;

        Ok(Config {
            github_app_id,
            github_private_key,
            github_webhook_secret,
            provider,
            trigger_keyword,
            port,
            taskstore_db_path,
            dispatcher,
            allow_all_users,
            git_name,
            git_email,
            claude_model,
            anthropic_api_key,
            codex_model,
            openai_api_key,
            openai_base_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_secret_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "secret-value").unwrap();

        env::set_var("TEST_BRIDGE_SECRET_FILE", file.path());
        env::remove_var("TEST_BRIDGE_SECRET");

        let result = read_secret("TEST_BRIDGE_SECRET").unwrap();
        assert_eq!(result, "secret-value");

        env::remove_var("TEST_BRIDGE_SECRET_FILE");
    }

    #[test]
    fn test_read_secret_from_env() {
        env::remove_var("TEST_BRIDGE_SECRET2_FILE");
        env::set_var("TEST_BRIDGE_SECRET2", "env-value");

        let result = read_secret("TEST_BRIDGE_SECRET2").unwrap();
        assert_eq!(result, "env-value");

        env::remove_var("TEST_BRIDGE_SECRET2");
    }

    #[test]
    fn test_read_secret_converts_escaped_newlines() {
        // PEM keys stored as single-line env vars use \n escapes
        env::remove_var("TEST_BRIDGE_SECRET_NL_FILE");
        env::set_var("TEST_BRIDGE_SECRET_NL", "line1\\nline2\\nline3");

        let result = read_secret("TEST_BRIDGE_SECRET_NL").unwrap();
        assert_eq!(result, "line1\nline2\nline3");

        env::remove_var("TEST_BRIDGE_SECRET_NL");
    }

    #[test]
    fn test_read_secret_file_takes_precedence() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "file-value").unwrap();

        env::set_var("TEST_BRIDGE_SECRET3_FILE", file.path());
        env::set_var("TEST_BRIDGE_SECRET3", "env-value");

        let result = read_secret("TEST_BRIDGE_SECRET3").unwrap();
        assert_eq!(result, "file-value");

        env::remove_var("TEST_BRIDGE_SECRET3_FILE");
        env::remove_var("TEST_BRIDGE_SECRET3");
    }

    #[test]
    fn test_read_secret_optional_none_when_missing() {
        env::remove_var("TEST_BRIDGE_OPT_FILE");
        env::remove_var("TEST_BRIDGE_OPT");

        let result = read_secret_optional("TEST_BRIDGE_OPT").unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_read_secret_optional_none_when_empty() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "   ").unwrap();

        env::set_var("TEST_BRIDGE_OPT2_FILE", file.path());

        let result = read_secret_optional("TEST_BRIDGE_OPT2").unwrap();
        assert_eq!(result, None);

        env::remove_var("TEST_BRIDGE_OPT2_FILE");
    }

    #[test]
    fn test_read_secret_optional_errors_when_file_unreadable() {
        // If _FILE is explicitly set but the file doesn't exist, that's an error
        // (not a silent fallback to None)
        env::set_var("TEST_BRIDGE_OPT3_FILE", "/nonexistent/path/to/secret");
        env::remove_var("TEST_BRIDGE_OPT3");

        let result = read_secret_optional("TEST_BRIDGE_OPT3");
        assert!(result.is_err());

        env::remove_var("TEST_BRIDGE_OPT3_FILE");
    }

    #[test]
    fn test_dispatcher_defaults() {
        let d = DispatcherConfig::default();
        assert_eq!(d.workers, 4);
        assert_eq!(d.queue_size, 16);
        assert_eq!(d.max_attempts, 3);
        assert_eq!(d.retry_initial, Duration::from_secs(15));
        assert_eq!(d.retry_max, Duration::from_secs(300));
        assert_eq!(d.backoff_multiplier, 2);
    }
}
