use serde::{Deserialize, Serialize};
use url::Url;

use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration for a blockpad host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the block API. `blocks` is resolved relative to it.
    pub endpoint: String,
    /// Meeting the documents belong to. Required before a block can be created.
    pub meeting: Option<i64>,
    /// Quiet period after the last edit before a save is issued.
    pub debounce_ms: u64,
    /// Minimum spacing between preview updates pushed to the UI.
    pub preview_throttle_ms: u64,
    /// Per-request transport timeout. None leaves it to the transport.
    pub request_timeout_ms: Option<u64>,
}

impl Config {
    pub const DEFAULT_ENDPOINT: &'static str = "http://localhost:8000/api/";
    pub const DEFAULT_DEBOUNCE_MS: u64 = 800;
    pub const DEFAULT_PREVIEW_THROTTLE_MS: u64 = 250;

    /// Loads the configuration from the provided loader.
    pub async fn load(loader: &impl Loader) -> Result<Self, ConfigError> {
        loader.load().await
    }

    /// Saves the configuration using the provided saver.
    pub async fn save(&self, saver: &impl Saver) -> Result<(), ConfigError> {
        saver.save(self).await
    }

    /// Apply environment overrides on top of this config.
    ///
    /// - `BLOCKPAD_ENDPOINT`: block API base URL
    /// - `BLOCKPAD_MEETING`: positive meeting id
    /// - `BLOCKPAD_DEBOUNCE_MS`: autosave debounce window
    /// - `BLOCKPAD_REQUEST_TIMEOUT_MS`: transport timeout
    pub fn from_env_overlay(self) -> Result<Self, ConfigError> {
        self.overlay_with(|var| std::env::var(var).ok())
    }

    /// Same as [`Config::from_env_overlay`] with an injectable variable lookup.
    pub fn overlay_with(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(endpoint) = lookup("BLOCKPAD_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(raw) = lookup("BLOCKPAD_MEETING") {
            let meeting = parse_env::<i64>("BLOCKPAD_MEETING", &raw, "a positive integer")?;
            if meeting <= 0 {
                return Err(ConfigError::InvalidEnv {
                    var: "BLOCKPAD_MEETING",
                    value: raw,
                    expected: "a positive integer",
                });
            }
            self.meeting = Some(meeting);
        }
        if let Some(raw) = lookup("BLOCKPAD_DEBOUNCE_MS") {
            self.debounce_ms = parse_env("BLOCKPAD_DEBOUNCE_MS", &raw, "milliseconds")?;
        }
        if let Some(raw) = lookup("BLOCKPAD_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = Some(parse_env(
                "BLOCKPAD_REQUEST_TIMEOUT_MS",
                &raw,
                "milliseconds",
            )?);
        }
        self.endpoint_url()?;
        Ok(self)
    }

    /// The endpoint as a URL with a trailing slash, so relative joins keep
    /// the full base path.
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| ConfigError::UrlParse {
            url: self.endpoint.clone(),
            message: e.to_string(),
        })?;
        if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UrlParse {
                url: self.endpoint.clone(),
                message: "not an http(s) base URL".to_owned(),
            });
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn preview_throttle(&self) -> Duration {
        Duration::from_millis(self.preview_throttle_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: Self::DEFAULT_ENDPOINT.to_owned(),
            meeting: None,
            debounce_ms: Self::DEFAULT_DEBOUNCE_MS,
            preview_throttle_ms: Self::DEFAULT_PREVIEW_THROTTLE_MS,
            request_timeout_ms: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    var: &'static str,
    raw: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_owned(),
        expected,
    })
}

/// The trait for loading configuration data.
pub trait Loader {
    /// Loads the configuration data.
    fn load(&self) -> impl Future<Output = Result<Config, ConfigError>> + Send;
}

/// The trait for saving configuration data.
pub trait Saver {
    /// Saves the configuration data.
    fn save(&self, config: &Config) -> impl Future<Output = Result<(), ConfigError>> + Send;
}

/// An implementation of [`Loader`] and [`Saver`] that reads and writes a configuration file.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a new [`FileStore`] with the given path.
    ///
    /// The file extension picks the format: `.json` or `.toml`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn format_error(&self, message: impl ToString) -> ConfigError {
        ConfigError::Format {
            path: self.path.clone(),
            message: message.to_string(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> ConfigError {
        ConfigError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Loader for FileStore {
    async fn load(&self) -> Result<Config, ConfigError> {
        let format = self.path.extension().and_then(|ext| ext.to_str());
        if !matches!(format, Some("json") | Some("toml")) {
            return Err(ConfigError::UnsupportedFormat {
                path: self.path.clone(),
            });
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        match format {
            Some("json") => serde_json::from_str(&raw).map_err(|e| self.format_error(e)),
            _ => toml::from_str(&raw).map_err(|e| self.format_error(e)),
        }
    }
}

impl Saver for FileStore {
    async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let contents = match self.path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => {
                serde_json::to_string_pretty(config).map_err(|e| self.format_error(e))?
            }
            Some("toml") => toml::to_string_pretty(config).map_err(|e| self.format_error(e))?,
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    path: self.path.clone(),
                });
            }
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        std::fs::write(&self.path, contents).map_err(|e| self.io_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_env_overlay_applies_values() {
        let config = Config::default()
            .overlay_with(env(&[
                ("BLOCKPAD_ENDPOINT", "https://notes.example.com/api"),
                ("BLOCKPAD_MEETING", "42"),
                ("BLOCKPAD_DEBOUNCE_MS", "300"),
            ]))
            .unwrap();

        assert_eq!(config.endpoint, "https://notes.example.com/api");
        assert_eq!(config.meeting, Some(42));
        assert_eq!(config.debounce(), Duration::from_millis(300));
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn test_env_overlay_rejects_non_positive_meeting() {
        let err = Config::default()
            .overlay_with(env(&[("BLOCKPAD_MEETING", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                var: "BLOCKPAD_MEETING",
                ..
            }
        ));
    }

    #[test]
    fn test_env_overlay_rejects_garbage_debounce() {
        let err = Config::default()
            .overlay_with(env(&[("BLOCKPAD_DEBOUNCE_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_endpoint_url_gets_trailing_slash() {
        let config = Config {
            endpoint: "https://notes.example.com/api".into(),
            ..Config::default()
        };
        let url = config.endpoint_url().unwrap();
        assert_eq!(url.as_str(), "https://notes.example.com/api/");
        assert_eq!(
            url.join("blocks").unwrap().as_str(),
            "https://notes.example.com/api/blocks"
        );
    }

    #[test]
    fn test_endpoint_url_rejects_non_http() {
        let config = Config {
            endpoint: "mailto:someone@example.com".into(),
            ..Config::default()
        };
        assert!(matches!(
            config.endpoint_url(),
            Err(ConfigError::UrlParse { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_store_round_trips_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            meeting: Some(7),
            request_timeout_ms: Some(10_000),
            ..Config::default()
        };

        for name in ["blockpad.toml", "blockpad.json"] {
            let store = FileStore::new(dir.path().join(name));
            config.save(&store).await.unwrap();
            assert_eq!(Config::load(&store).await.unwrap(), config);
        }
    }

    #[tokio::test]
    async fn test_file_store_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "meeting = 3\n").unwrap();

        let config = Config::load(&FileStore::new(&path)).await.unwrap();
        assert_eq!(config.meeting, Some(3));
        assert_eq!(config.debounce_ms, Config::DEFAULT_DEBOUNCE_MS);
        assert_eq!(config.endpoint, Config::DEFAULT_ENDPOINT);
    }

    #[tokio::test]
    async fn test_file_store_rejects_unknown_extension() {
        let store = FileStore::new("/tmp/blockpad.yaml");
        assert!(matches!(
            Config::load(&store).await,
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }
}
