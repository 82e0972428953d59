//! Runtime options for a verdict session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Public gateway of the verdict service.
pub const DEFAULT_URL: &str = "wss://gateway-vaas.gdatasecurity.de";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Runtime options for a verdict session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// WebSocket endpoint of the verdict service.
    pub url: String,
    /// Default deadline for a single verdict request.
    pub request_timeout: Duration,
    /// Deadline for the out-of-band upload of unknown samples.
    pub upload_timeout: Duration,
    pub keep_alive: bool,
    pub keep_alive_interval: Duration,
    /// Forwarded as `use_cache` on every request when set.
    pub use_cache: Option<bool>,
    /// Forwarded as `use_hash_lookup` on every request when set.
    pub use_hash_lookup: Option<bool>,
}

/// TOML form of [`Options`] (`~/.config/verdict/config.toml`). Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionsFile {
    url: Option<String>,
    request_timeout_secs: Option<u64>,
    upload_timeout_secs: Option<u64>,
    keep_alive: Option<bool>,
    keep_alive_interval_secs: Option<u64>,
    use_cache: Option<bool>,
    use_hash_lookup: Option<bool>,
}

impl Options {
    /// Default config file location.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("verdict").join("config.toml"))
    }

    /// Load options from `path`, or from [`Options::default_path`] when `None`.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file at an explicit path is an error.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| eyre::eyre!("failed to read {}: {e}", path.display()))?;

        Self::from_toml(&content).map_err(|e| eyre::eyre!("{}: {e}", path.display()))
    }

    /// Parse options from TOML text, filling unset keys with defaults.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let file: OptionsFile =
            toml::from_str(content).map_err(|e| eyre::eyre!("failed to parse options: {e}"))?;

        let defaults = Self::default();
        let options = Self {
            url: file.url.unwrap_or(defaults.url),
            request_timeout: file
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            upload_timeout: file
                .upload_timeout_secs
                .map_or(defaults.upload_timeout, Duration::from_secs),
            keep_alive: file.keep_alive.unwrap_or(defaults.keep_alive),
            keep_alive_interval: file
                .keep_alive_interval_secs
                .map_or(defaults.keep_alive_interval, Duration::from_secs),
            use_cache: file.use_cache,
            use_hash_lookup: file.use_hash_lookup,
        };
        options.validate()?;
        Ok(options)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(eyre::eyre!("url must use ws:// or wss://, got {}", self.url));
        }
        if self.request_timeout.is_zero() || self.upload_timeout.is_zero() {
            return Err(eyre::eyre!("timeouts must be greater than zero"));
        }
        if self.keep_alive && self.keep_alive_interval.is_zero() {
            return Err(eyre::eyre!("keep_alive_interval must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            keep_alive: true,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            use_cache: None,
            use_hash_lookup: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = Options::default();
        assert_eq!(options.url, DEFAULT_URL);
        assert_eq!(options.request_timeout, Duration::from_secs(120));
        assert!(options.keep_alive);
        assert!(options.use_cache.is_none());
        options.validate().unwrap();
    }

    #[test]
    fn empty_toml_yields_defaults() {
        assert_eq!(Options::from_toml("").unwrap(), Options::default());
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let options = Options::from_toml(
            r#"
            url = "ws://127.0.0.1:9000"
            request_timeout_secs = 5
            keep_alive = false
            use_hash_lookup = true
            "#,
        )
        .unwrap();
        assert_eq!(options.url, "ws://127.0.0.1:9000");
        assert_eq!(options.request_timeout, Duration::from_secs(5));
        assert_eq!(options.upload_timeout, Duration::from_secs(600));
        assert!(!options.keep_alive);
        assert_eq!(options.use_hash_lookup, Some(true));
        assert!(options.use_cache.is_none());
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(Options::from_toml("threshold = 0.5").is_err());
    }

    #[test]
    fn non_websocket_url_is_rejected() {
        assert!(Options::from_toml(r#"url = "https://example.com""#).is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(Options::from_toml("request_timeout_secs = 0").is_err());
    }

    #[test]
    fn largest_timeout_is_accepted() {
        // TOML integers top out at i64::MAX.
        let secs = i64::MAX.unsigned_abs();
        let options = Options::from_toml(&format!(
            "request_timeout_secs = {secs}\nupload_timeout_secs = {secs}"
        ))
        .unwrap();
        assert_eq!(options.request_timeout, Duration::from_secs(secs));
        assert_eq!(options.upload_timeout, Duration::from_secs(secs));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "upload_timeout_secs = 30\n").unwrap();
        let options = Options::load(Some(&path)).unwrap();
        assert_eq!(options.upload_timeout, Duration::from_secs(30));
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Options::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
