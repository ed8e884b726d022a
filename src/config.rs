use anyhow::{Context, Result};
use keyring::Entry;
use std::path::PathBuf;
use std::time::Duration;

use crate::flow_store::DEFAULT_FLOW_SLOT;

const KEYRING_SERVICE: &str = "coachflow_api_key";
const KEYRING_USER: &str = "dashboard";

const DEFAULT_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_DB_PATH: &str = "coachflow.sqlite";
const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_base_url: String,
    /// `env:VAR`, `keyring`, or `None` for unauthenticated requests.
    pub api_key_ref: Option<String>,
    pub database_path: PathBuf,
    pub store_name: String,
    pub poll_interval: Duration,
    pub max_poll_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        let poll_interval = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS);
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            api_key_ref: None,
            database_path: PathBuf::from(DEFAULT_DB_PATH),
            store_name: DEFAULT_FLOW_SLOT.to_string(),
            poll_interval,
            max_poll_backoff: poll_interval * 10,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

impl AppConfig {
    /// Builds the configuration from `COACHFLOW_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("COACHFLOW_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(key_ref) = std::env::var("COACHFLOW_API_KEY_REF") {
            config.api_key_ref = Some(key_ref).filter(|k| !k.trim().is_empty());
        }
        if let Ok(path) = std::env::var("COACHFLOW_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(name) = std::env::var("COACHFLOW_STORE_NAME") {
            config.store_name = name;
        }
        if let Some(ms) = read_millis("COACHFLOW_POLL_INTERVAL_MS")? {
            config.poll_interval = ms;
            config.max_poll_backoff = ms * 10;
        }
        if let Some(ms) = read_millis("COACHFLOW_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = ms;
        }

        log::debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }
}

fn read_millis(var: &str) -> Result<Option<Duration>> {
    match std::env::var(var) {
        Ok(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("'{}' must be a number of milliseconds, got '{}'", var, raw))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}

// --- API Key Retrieval ---

/// Resolves the backend API key from `api_key_ref`.
pub fn get_api_key(api_key_ref: Option<&str>) -> Result<Option<String>> {
    match api_key_ref {
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).map(Some).context(format!(
                "Failed to get API key from environment variable '{}'",
                env_var_name
            ))
        }
        Some("keyring") => {
            let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
                .context("Failed to create keyring entry")?;
            log::debug!("Retrieving API key from keyring for service: {}", KEYRING_SERVICE);
            entry
                .get_password()
                .map(Some)
                .context("Failed to get API key from keyring. Please set it in settings.")
        }
        Some(other) => Err(anyhow::anyhow!("Unsupported api_key_ref format: {}", other)),
        None => Ok(None),
    }
}

/// Stores the backend API key in the OS keyring.
pub fn set_api_key_in_keyring(api_key: &str) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for service: {}", KEYRING_SERVICE);
    entry
        .set_password(api_key)
        .context("Failed to set API key in keyring")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_reference_reads_variable() {
        std::env::set_var("COACHFLOW_TEST_KEY_A", "secret");
        let key = get_api_key(Some("env:COACHFLOW_TEST_KEY_A")).unwrap();
        assert_eq!(key.as_deref(), Some("secret"));
    }

    #[test]
    fn missing_env_variable_is_an_error() {
        assert!(get_api_key(Some("env:COACHFLOW_TEST_KEY_DOES_NOT_EXIST")).is_err());
    }

    #[test]
    fn no_reference_means_no_key() {
        assert_eq!(get_api_key(None).unwrap(), None);
        assert!(get_api_key(Some("vault:abc")).is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.store_name, DEFAULT_FLOW_SLOT);
        assert!(config.max_poll_backoff > config.poll_interval);
    }
}
