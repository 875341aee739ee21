//! Configuration management for Kinship.
//!
//! Loads configuration from ${KINSHIP_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Hosted backend connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the backend project.
    pub url: Option<String>,
    /// Public API key sent as `apikey` on every request.
    pub anon_key: Option<String>,
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub refresh_threshold_secs: u64,
    pub profile_check_attempts: u32,
    pub profile_retry_delay_ms: u64,
    pub sign_out_fallback_delay_ms: u64,
    pub landing_route: String,
    pub login_route: String,
    pub home_route: String,
    pub complete_profile_route: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            refresh_threshold_secs: 300,
            profile_check_attempts: 3,
            profile_retry_delay_ms: 1000,
            sign_out_fallback_delay_ms: 100,
            landing_route: "/".to_string(),
            login_route: "/login".to_string(),
            home_route: "/home".to_string(),
            complete_profile_route: "/complete-profile".to_string(),
        }
    }
}

/// Provider sign-in settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub provider: String,
    /// Origin the redirect target is derived from.
    pub site_origin: String,
    pub callback_path: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            provider: "google".to_string(),
            site_origin: "http://localhost:5173".to_string(),
            callback_path: "/auth/callback".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `KINSHIP_LOG` is unset.
    pub level: String,
    /// Also write a daily log file under ${KINSHIP_HOME}/logs.
    pub log_to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            log_to_file: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub session: SessionSection,
    pub oauth: OAuthConfig,
    pub logging: LoggingConfig,
}

/// The controller's view of the configuration, with durations resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub refresh_threshold_secs: i64,
    pub profile_check_attempts: u32,
    pub profile_retry_delay: Duration,
    pub sign_out_fallback_delay: Duration,
    pub landing_route: String,
    pub login_route: String,
    pub home_route: String,
    pub complete_profile_route: String,
    pub oauth_provider: String,
    pub site_origin: String,
    pub callback_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Config::default().session_config()
    }
}

impl SessionConfig {
    /// Default OAuth redirect target: origin plus the fixed callback path.
    pub fn default_redirect_target(&self) -> String {
        format!(
            "{}{}",
            self.site_origin.trim_end_matches('/'),
            self.callback_path
        )
    }

    /// Redirect target embedded in password-recovery emails.
    pub fn password_reset_target(&self) -> String {
        format!("{}/reset-password", self.site_origin.trim_end_matches('/'))
    }
}

pub mod paths {
    //! Path resolution for Kinship configuration and data.
    //!
    //! KINSHIP_HOME resolution order:
    //! 1. KINSHIP_HOME environment variable (if set)
    //! 2. ~/.config/kinship (default)

    use std::path::{Path, PathBuf};

    /// Returns the Kinship home directory.
    pub fn kinship_home() -> PathBuf {
        if let Ok(home) = std::env::var("KINSHIP_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .map(|h| h.join(".config").join("kinship"))
            .unwrap_or_else(|| PathBuf::from(".kinship"))
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        config_path_in(&kinship_home())
    }

    /// Returns the path to the local key/value storage file.
    pub fn storage_path() -> PathBuf {
        storage_path_in(&kinship_home())
    }

    /// Returns the log directory.
    pub fn logs_dir() -> PathBuf {
        logs_dir_in(&kinship_home())
    }

    pub fn config_path_in(home: &Path) -> PathBuf {
        home.join("config.toml")
    }

    pub fn storage_path_in(home: &Path) -> PathBuf {
        home.join("storage.json")
    }

    pub fn logs_dir_in(home: &Path) -> PathBuf {
        home.join("logs")
    }
}

/// Returns the default config template with comments.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

impl Config {
    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a config file from the commented template.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Resolves the backend URL with precedence: env > config.
    ///
    /// # Errors
    /// Returns an error if no URL is configured or the URL is malformed.
    pub fn backend_url(&self) -> Result<String> {
        let url = resolve_setting(self.backend.url.as_deref(), "KINSHIP_BACKEND_URL")
            .context("No backend URL available. Set KINSHIP_BACKEND_URL or url in [backend].")?;
        url::Url::parse(&url).with_context(|| format!("Invalid backend URL: {url}"))?;
        Ok(url.trim_end_matches('/').to_string())
    }

    /// Resolves the public API key with precedence: env > config.
    ///
    /// # Errors
    /// Returns an error if no key is configured.
    pub fn anon_key(&self) -> Result<String> {
        resolve_setting(self.backend.anon_key.as_deref(), "KINSHIP_ANON_KEY")
            .context("No API key available. Set KINSHIP_ANON_KEY or anon_key in [backend].")
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            refresh_threshold_secs: i64::try_from(s.refresh_threshold_secs).unwrap_or(i64::MAX),
            profile_check_attempts: s.profile_check_attempts.max(1),
            profile_retry_delay: Duration::from_millis(s.profile_retry_delay_ms),
            sign_out_fallback_delay: Duration::from_millis(s.sign_out_fallback_delay_ms),
            landing_route: s.landing_route.clone(),
            login_route: s.login_route.clone(),
            home_route: s.home_route.clone(),
            complete_profile_route: s.complete_profile_route.clone(),
            oauth_provider: self.oauth.provider.clone(),
            site_origin: self.oauth.site_origin.clone(),
            callback_path: self.oauth.callback_path.clone(),
        }
    }

    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

fn resolve_setting(config_value: Option<&str>, env_var: &str) -> Option<String> {
    if let Ok(value) = std::env::var(env_var) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    config_value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config.session.refresh_threshold_secs, 300);
        assert_eq!(config.session.profile_check_attempts, 3);
        assert_eq!(config.oauth.provider, "google");
        assert!(config.backend.url.is_none());
    }

    #[test]
    fn test_load_partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(
            &config_path,
            "[session]\nrefresh_threshold_secs = 60\n\n[backend]\nurl = \"https://b.example\"\n",
        )
        .unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.session.refresh_threshold_secs, 60);
        assert_eq!(config.session.profile_retry_delay_ms, 1000);
        assert_eq!(config.backend.url.as_deref(), Some("https://b.example"));
    }

    #[test]
    fn test_template_parses_to_defaults() {
        let config: Config = toml::from_str(default_config_template()).unwrap();
        assert_eq!(config.session_config(), Config::default().session_config());
    }

    #[test]
    fn test_init_creates_config_and_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("subdir").join("config.toml");

        Config::init(&config_path).unwrap();
        assert!(config_path.exists());
        let contents = fs::read_to_string(&config_path).unwrap();
        assert!(contents.contains("refresh_threshold_secs = 300"));

        let err = Config::init(&config_path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_session_config_durations() {
        let cfg = Config::default().session_config();
        assert_eq!(cfg.profile_retry_delay, Duration::from_secs(1));
        assert_eq!(cfg.sign_out_fallback_delay, Duration::from_millis(100));
        assert_eq!(
            cfg.default_redirect_target(),
            "http://localhost:5173/auth/callback"
        );
        assert_eq!(
            cfg.password_reset_target(),
            "http://localhost:5173/reset-password"
        );
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let mut config = Config::default();
        config.session.profile_check_attempts = 0;
        assert_eq!(config.session_config().profile_check_attempts, 1);
    }
}
