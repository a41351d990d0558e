//! Configuration builder for flexible configuration loading

use crate::{Config, ConfigError, ConfigResult};
use config::{ConfigBuilder as ConfigBuilderInner, Environment, File, FileFormat};
use hashsync_types::{BufferSize, ThreadCount};
use std::path::{Path, PathBuf};

/// Configuration builder for loading configuration from multiple sources
#[derive(Debug)]
pub struct ConfigBuilder {
    inner: ConfigBuilderInner<config::builder::DefaultState>,
    sources: Vec<ConfigSource>,
    env_separator: String,
}

#[derive(Debug, Clone)]
enum ConfigSource {
    File { path: PathBuf, format: FileFormat },
    Defaults,
    Environment { prefix: String },
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            inner: config::Config::builder(),
            sources: Vec::new(),
            env_separator: "__".to_string(),
        }
    }

    /// Add default configuration values
    pub fn add_defaults(mut self) -> Self {
        self.sources.push(ConfigSource::Defaults);
        self
    }

    /// Add a configuration file source
    pub fn add_source_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = Self::detect_format(&path);
        self.sources.push(ConfigSource::File { path, format });
        self
    }

    /// Add environment variable source with prefix
    pub fn add_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.sources.push(ConfigSource::Environment {
            prefix: prefix.into(),
        });
        self
    }

    /// Set environment variable separator (default: "__")
    pub fn env_separator<S: Into<String>>(mut self, separator: S) -> Self {
        self.env_separator = separator.into();
        self
    }

    /// Build the configuration
    pub fn build(mut self) -> ConfigResult<Config> {
        // Built-in defaults are always the lowest layer
        let defaults = Config::default();
        let defaults_value = serde_yaml::to_value(&defaults)
            .map_err(|e| ConfigError::other(format!("Failed to serialize defaults: {}", e)))?;
        self.inner = self
            .inner
            .add_source(config::Config::try_from(&defaults_value)?);

        for source in &self.sources {
            match source {
                ConfigSource::File { path, format } => {
                    if path.exists() {
                        self.inner = self
                            .inner
                            .add_source(File::from(path.clone()).format(*format));
                    }
                }
                ConfigSource::Environment { prefix } => {
                    self.inner = self.inner.add_source(
                        Environment::with_prefix(prefix).separator(&self.env_separator),
                    );
                }
                ConfigSource::Defaults => {}
            }
        }

        let config = self.inner.build()?;
        let result: Config = config.try_deserialize()?;

        Self::validate(&result)?;

        Ok(result)
    }

    /// Detect file format from extension
    fn detect_format(path: &Path) -> FileFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("toml") => FileFormat::Toml,
            Some("json") => FileFormat::Json,
            _ => FileFormat::Yaml, // Default to YAML
        }
    }

    /// Validate the configuration
    fn validate(config: &Config) -> ConfigResult<()> {
        BufferSize::new(config.transfer.buffer_size.get()).map_err(ConfigError::validation)?;
        ThreadCount::new(config.transfer.max_parallelism.get()).map_err(ConfigError::validation)?;
        config
            .transfer
            .retry
            .validate()
            .map_err(ConfigError::validation)?;

        if let Some(prefix) = &config.transfer.url_prefix {
            if !(prefix.starts_with("http://") || prefix.starts_with("https://")) {
                return Err(ConfigError::validation(format!(
                    "URL prefix '{}' must start with http:// or https://",
                    prefix
                )));
            }
        }

        if config.progress.sample_interval_ms == 0 || config.progress.refresh_interval_ms == 0 {
            return Err(ConfigError::validation(
                "Progress intervals must be greater than 0",
            ));
        }

        if config.staging.directory.as_os_str().is_empty() {
            return Err(ConfigError::validation("Staging directory must not be empty"));
        }

        if let Some(helper) = &config.commit.elevation_helper {
            if helper.program.trim().is_empty() {
                return Err(ConfigError::validation(
                    "Elevation helper program must not be empty",
                ));
            }
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&config.logging.level.as_str()) {
            return Err(ConfigError::validation(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }

        Ok(())
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheRetention, LogFormat};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_file(contents: &str) -> NamedTempFile {
        let mut temp_file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(temp_file, "{}", contents).unwrap();
        temp_file
    }

    #[test]
    fn test_builder_defaults() {
        let config = ConfigBuilder::new().add_defaults().build().unwrap();
        assert_eq!(config.transfer.retry.max_attempts, 3);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_builder_yaml_file() {
        let temp_file = yaml_file(
            r#"
transfer:
  max_parallelism: 8
  url_prefix: "https://cdn.example.com/game"
staging:
  retention: keep
"#,
        );

        let config = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build()
            .unwrap();

        assert_eq!(config.transfer.max_parallelism.get(), 8);
        assert_eq!(
            config.transfer.url_prefix.as_deref(),
            Some("https://cdn.example.com/game")
        );
        assert_eq!(config.staging.retention, CacheRetention::Keep);
        // Untouched sections keep their defaults
        assert_eq!(config.progress.sample_interval_ms, 1000);
    }

    #[test]
    fn test_builder_env_override() {
        std::env::set_var("HASHSYNCTEST__COMMIT__VERIFY_AFTER_PLACE", "false");
        let config = ConfigBuilder::new()
            .add_defaults()
            .add_env_prefix("HASHSYNCTEST")
            .build()
            .unwrap();
        std::env::remove_var("HASHSYNCTEST__COMMIT__VERIFY_AFTER_PLACE");

        assert!(!config.commit.verify_after_place);
    }

    #[rstest::rstest]
    #[case("transfer:\n  max_parallelism: 0", "below minimum")]
    #[case("transfer:\n  url_prefix: ftp://mirror", "must start with http")]
    #[case("transfer:\n  retry:\n    max_attempts: 0", "at least 1")]
    #[case("progress:\n  sample_interval_ms: 0", "greater than 0")]
    #[case("logging:\n  level: loud", "Log level")]
    fn test_builder_validation(#[case] yaml: &str, #[case] message: &str) {
        let temp_file = yaml_file(yaml);

        let result = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build();

        let error = result.unwrap_err().to_string();
        assert!(error.contains(message), "unexpected error: {}", error);
    }
}
