//! Configuration file loading and validation.
//!
//! The file is TOML. Every command template is checked here, so a bad
//! placeholder fails start-up instead of a stream request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::Deserialize;

use tunerhub_core::{
    render, validate, Channel, ChannelCatalog, FilterSpec, TemplateContext, TunerSpec,
};

use crate::error::ConfigError;
use crate::stream::OverflowPolicy;
use crate::tuner::TunerPoolConfig;

/// Looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "tunerhub.toml";

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
    #[serde(default)]
    pub tuners: Vec<TunerEntry>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub grace_period_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    /// 0 disables stall detection.
    pub stall_timeout_ms: Option<u64>,
    pub chunk_size: Option<usize>,
    pub subscriber_buffer: Option<usize>,
    pub overflow: Option<OverflowPolicy>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelEntry {
    #[serde(flatten)]
    pub channel: Channel,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct TunerEntry {
    #[serde(flatten)]
    pub spec: TunerSpec,
    #[serde(default)]
    pub disabled: bool,
}

/// Logging settings after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub log_dir: Option<PathBuf>,
    pub retention_days: u64,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            retention_days: 7,
            level: "info".to_string(),
        }
    }
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub catalog: ChannelCatalog,
    pub tuners: Vec<TunerSpec>,
    pub filters: Vec<FilterSpec>,
    pub pool: TunerPoolConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Read and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(contents)?;
        file.into_config()
    }

    /// Config file to use: explicit path > `tunerhub.toml` in the working
    /// directory.
    pub fn locate(explicit: Option<PathBuf>) -> Option<PathBuf> {
        explicit.or_else(|| {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            default_path.exists().then_some(default_path)
        })
    }
}

impl ConfigFile {
    /// Apply defaults, drop disabled entries and validate.
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let defaults = TunerPoolConfig::default();
        let server = self.server;
        let pool = TunerPoolConfig {
            grace_period: server
                .grace_period_ms
                .map_or(defaults.grace_period, Duration::from_millis),
            stop_timeout: server
                .stop_timeout_ms
                .map_or(defaults.stop_timeout, Duration::from_millis),
            stall_timeout: match server.stall_timeout_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.stall_timeout,
            },
            chunk_size: server.chunk_size.unwrap_or(defaults.chunk_size),
            subscriber_buffer: server.subscriber_buffer.unwrap_or(defaults.subscriber_buffer),
            overflow: server.overflow.unwrap_or(defaults.overflow),
        };
        if pool.chunk_size == 0 {
            return Err(ConfigError::Invalid("server.chunk_size must be positive".into()));
        }
        if pool.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid(
                "server.subscriber_buffer must be positive".into(),
            ));
        }

        let log_defaults = LoggingConfig::default();
        let logging = LoggingConfig {
            log_dir: self.logging.log_dir.map(PathBuf::from),
            retention_days: self.logging.retention_days.unwrap_or(log_defaults.retention_days),
            level: self.logging.level.unwrap_or(log_defaults.level),
        };

        let channels: Vec<Channel> = self
            .channels
            .into_iter()
            .filter(|entry| {
                if entry.disabled {
                    debug!("Channel {} is disabled", entry.channel.name);
                }
                !entry.disabled
            })
            .map(|entry| entry.channel)
            .collect();
        let catalog = ChannelCatalog::new(channels)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut tuners: Vec<TunerSpec> = Vec::new();
        for entry in self.tuners {
            if entry.disabled {
                debug!("Tuner {} is disabled", entry.spec.name);
                continue;
            }
            let spec = entry.spec;
            if tuners.iter().any(|t| t.name == spec.name) {
                return Err(ConfigError::Invalid(format!("Duplicate tuner: {}", spec.name)));
            }
            if spec.types.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Tuner {} supports no channel types",
                    spec.name
                )));
            }
            tuners.push(spec);
        }

        for spec in &tuners {
            check_template(&format!("tuner {}", spec.name), &spec.command, Some(spec), &catalog)?;
        }
        for (index, filter) in self.filters.iter().enumerate() {
            if let Some(command) = filter.command() {
                check_template(&format!("filter {}", index + 1), command, None, &catalog)?;
            }
        }

        Ok(Config {
            catalog,
            tuners,
            filters: self.filters,
            pool,
            logging,
        })
    }
}

/// Validate `template`, then render it against every channel it can be used
/// with, so that missing channel fields also surface now.
fn check_template(
    owner: &str,
    template: &str,
    tuner: Option<&TunerSpec>,
    catalog: &ChannelCatalog,
) -> Result<(), ConfigError> {
    let invalid = |source| ConfigError::Template {
        owner: owner.to_string(),
        source,
    };
    validate(template).map_err(invalid)?;

    for channel in catalog.channels() {
        let ctx = match tuner {
            Some(spec) if !spec.supports(channel.channel_type) => continue,
            Some(spec) => TemplateContext::new(channel).with_tuner(&spec.name),
            None => TemplateContext::new(channel).with_tuner("-"),
        };
        render(template, &ctx).map_err(invalid)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tunerhub_core::{ChannelType, TemplateError};

    const SAMPLE: &str = r#"
[server]
grace_period_ms = 5000
stall_timeout_ms = 0
overflow = "disconnect"

[logging]
log_dir = "logs"
retention_days = 3

[[channels]]
name = "NHK"
type = "GR"
channel = "27"

[[channels]]
name = "BS1"
type = "satellite"
channel = "BS15_0"
extra_args = "--lnb 15"

[[channels]]
name = "Old"
type = "GR"
channel = "13"
disabled = true

[[tuners]]
name = "tuner0"
types = ["GR", "BS"]
command = "recpt1 --device /dev/px4video0 {{channel}} {{duration}} -"

[[tuners]]
name = "tuner1"
types = ["GR"]
command = "recpt1 {{channel}} - -"
disabled = true

[[filters]]
command = "arib-b25-stream-test"

[[filters]]
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert_eq!(config.catalog.len(), 2);
        let bs1 = config.catalog.resolve("BS1").unwrap();
        assert_eq!(bs1.channel_type, ChannelType::BS);
        assert_eq!(bs1.extra_args, "--lnb 15");
        assert!(config.catalog.resolve("Old").is_err());

        assert_eq!(config.tuners.len(), 1);
        assert_eq!(config.tuners[0].types, vec![ChannelType::Terrestrial, ChannelType::BS]);

        assert_eq!(config.filters.len(), 2);
        assert!(config.filters[1].is_passthrough());

        assert_eq!(config.pool.grace_period, Duration::from_secs(5));
        assert_eq!(config.pool.stall_timeout, None);
        assert_eq!(config.pool.overflow, OverflowPolicy::Disconnect);
        assert_eq!(config.pool.chunk_size, 32 * 1024);

        assert_eq!(config.logging.log_dir, Some(PathBuf::from("logs")));
        assert_eq!(config.logging.retention_days, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert!(config.catalog.is_empty());
        assert!(config.tuners.is_empty());
        assert_eq!(config.pool.stop_timeout, Duration::from_millis(3000));
        assert_eq!(config.pool.stall_timeout, Some(Duration::from_millis(10000)));
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_unknown_placeholder_fails_load() {
        let toml = r#"
[[tuners]]
name = "tuner0"
types = ["GR"]
command = "recpt1 {{chanel}} - -"
"#;
        match Config::from_toml(toml) {
            Err(ConfigError::Template { owner, source }) => {
                assert_eq!(owner, "tuner tuner0");
                assert_eq!(source, TemplateError::UnknownPlaceholder("chanel".into()));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bad_filter_template_fails_load() {
        let toml = r#"
[[filters]]
command = "decoder {{channel"
"#;
        assert!(matches!(
            Config::from_toml(toml),
            Err(ConfigError::Template { owner, .. }) if owner == "filter 1"
        ));
    }

    #[test]
    fn test_missing_channel_field_fails_load() {
        let toml = r#"
[[channels]]
name = "Blank"
type = "GR"
channel = ""

[[tuners]]
name = "tuner0"
types = ["GR"]
command = "recpt1 {{channel}} - -"
"#;
        assert!(matches!(
            Config::from_toml(toml),
            Err(ConfigError::Template {
                source: TemplateError::MissingField("channel"),
                ..
            })
        ));
    }

    #[test]
    fn test_duplicates_rejected() {
        let channels = r#"
[[channels]]
name = "NHK"
type = "GR"
channel = "27"

[[channels]]
name = "NHK"
type = "GR"
channel = "26"
"#;
        assert!(matches!(Config::from_toml(channels), Err(ConfigError::Invalid(_))));

        let tuners = r#"
[[tuners]]
name = "tuner0"
types = ["GR"]
command = "cat"

[[tuners]]
name = "tuner0"
types = ["BS"]
command = "cat"
"#;
        assert!(matches!(Config::from_toml(tuners), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_tuner_without_types_rejected() {
        let toml = r#"
[[tuners]]
name = "tuner0"
types = []
command = "cat"
"#;
        assert!(matches!(Config::from_toml(toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let toml = "[server]\nsubscriber_buffer = 0\n";
        assert!(matches!(Config::from_toml(toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.tuners[0].name, "tuner0");

        assert!(matches!(
            Config::load(Path::new("/nonexistent/tunerhub.toml")),
            Err(ConfigError::Io(_))
        ));
        assert!(matches!(
            Config::from_toml("[server\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
