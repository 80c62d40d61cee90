use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from `~/.ast-labeler.toml`
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Where the pretrained checkpoint lives and where to fetch it from
    pub checkpoint: CheckpointConfig,
    /// Export pipeline settings
    pub export: ExportConfig,
    /// Labelling service settings
    pub service: ServiceConfig,
    /// Labelling client settings
    pub client: ClientConfig,
    /// Logging settings
    pub telemetry: TelemetryConfig,
}

/// Pretrained checkpoint location
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Download URL, used only when `path` is missing
    pub url: String,
    /// Local checkpoint path
    pub path: String,
    /// Distributed-wrapper prefix stripped from parameter names
    pub prefix: String,
}

/// Export pipeline settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExportConfig {
    /// Artifact output path
    pub output: String,
    /// Run a forward pass on a zero input before writing the artifact
    pub verify: bool,
}

/// Labelling service settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listen address
    pub address: String,
    /// Exported artifact to serve
    pub model_path: String,
    /// Maximum number of requests per inference batch
    pub batch_size: usize,
    /// How long to wait for a batch to fill after its first request
    pub timeout_ms: u64,
}

/// Labelling client settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// Service address
    pub address: String,
    /// Maximum number of files processed concurrently
    pub max_open_files: usize,
}

/// Logging settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Write logs to `log_path` instead of stdout
    pub enabled: bool,
    /// Log file path
    pub log_path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            url: crate::checkpoint::DEFAULT_CHECKPOINT_URL.to_owned(),
            path: crate::checkpoint::DEFAULT_CHECKPOINT_PATH.to_owned(),
            prefix: crate::checkpoint::DEFAULT_PREFIX.to_owned(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output: crate::export::DEFAULT_OUTPUT_PATH.to_owned(),
            verify: true,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8000".to_owned(),
            model_path: crate::export::DEFAULT_OUTPUT_PATH.to_owned(),
            batch_size: 1,
            timeout_ms: 100,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8000".to_owned(),
            max_open_files: 128,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: "~/.ast-labeler/ast-labeler.log".to_owned(),
        }
    }
}

const DEFAULT_CONFIG: &str = r#"[checkpoint]
url = "https://www.dropbox.com/s/cv4knew8mvbrnvq/audioset_0.4593.pth?dl=1"
path = "./pretrained_models/audioset_10_10_0.4593.pth"
prefix = "module."

[export]
output = "./model.safetensors"
verify = true

[service]
address = "0.0.0.0:8000"
model_path = "./model.safetensors"
batch_size = 1
timeout_ms = 100

[client]
address = "127.0.0.1:8000"
max_open_files = 128

[telemetry]
enabled = false
log_path = "~/.ast-labeler/ast-labeler.log"
"#;

impl Config {
    /// Load config from `path`, or from ~/.ast-labeler.toml when no path is given
    ///
    /// The default location is created with default values if missing; an
    /// explicit path must exist.
    ///
    /// # Errors
    /// Returns error if the file can't be read or isn't valid TOML
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default_path = Self::config_path()?;
                if !default_path.exists() {
                    Self::create_default(&default_path)
                        .context("failed to create default config")?;
                }
                default_path
            }
        };

        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file {}", config_path.display()))?;

        Self::parse(&contents)
    }

    /// Parse config from TOML text; missing fields take their defaults
    ///
    /// # Errors
    /// Returns error if the text isn't valid TOML for this schema
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("failed to parse config TOML")
    }

    fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".ast-labeler.toml"))
    }

    fn create_default(path: &Path) -> Result<()> {
        fs::write(path, DEFAULT_CONFIG).context("failed to write default config")?;
        Ok(())
    }

    /// Expand ~ in paths to home directory
    ///
    /// # Errors
    /// Returns error if the path starts with `~/` and HOME is unset
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_text_matches_defaults() {
        let parsed = Config::parse(DEFAULT_CONFIG).unwrap();
        let defaults = Config::default();

        assert_eq!(parsed.checkpoint.url, defaults.checkpoint.url);
        assert_eq!(parsed.checkpoint.path, defaults.checkpoint.path);
        assert_eq!(parsed.checkpoint.prefix, defaults.checkpoint.prefix);
        assert_eq!(parsed.export.output, defaults.export.output);
        assert_eq!(parsed.export.verify, defaults.export.verify);
        assert_eq!(parsed.service.address, defaults.service.address);
        assert_eq!(parsed.service.model_path, defaults.service.model_path);
        assert_eq!(parsed.service.batch_size, defaults.service.batch_size);
        assert_eq!(parsed.service.timeout_ms, defaults.service.timeout_ms);
        assert_eq!(parsed.client.address, defaults.client.address);
        assert_eq!(parsed.client.max_open_files, defaults.client.max_open_files);
        assert_eq!(parsed.telemetry.enabled, defaults.telemetry.enabled);
        assert_eq!(parsed.telemetry.log_path, defaults.telemetry.log_path);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config = Config::parse(
            r#"
[service]
batch_size = 8
"#,
        )
        .unwrap();

        assert_eq!(config.service.batch_size, 8);
        assert_eq!(config.service.timeout_ms, 100);
        assert_eq!(config.checkpoint.prefix, "module.");
        assert!(config.export.verify);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.service.address, "0.0.0.0:8000");
        assert_eq!(config.client.max_open_files, 128);
    }

    #[test]
    fn test_invalid_toml_fails() {
        let result = Config::parse("[service\nbatch_size = ");
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_type_fails() {
        let result = Config::parse("[service]\nbatch_size = \"eight\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[export]\nverify = false\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(!config.export.verify);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(Some(&dir.path().join("missing.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let home = std::env::var("HOME").expect("HOME not set");
        let result = Config::expand_path("~/models/model.safetensors").unwrap();
        assert_eq!(result, PathBuf::from(home).join("models/model.safetensors"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let result = Config::expand_path("./model.safetensors").unwrap();
        assert_eq!(result, PathBuf::from("./model.safetensors"));
    }
}
