use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use wirekit::{HostOptions, PolicyOverrides, RetryPolicy, StartMode, DEFAULT_TIMEOUT};

/// Main application configuration: orchestration policy, logging and
/// per-component overrides.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Base directory for relative log file paths.
    #[serde(default = "default_home_dir")]
    pub home_dir: String,
    /// Host-wide orchestration policy.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Per-component policy overrides: component name → overrides.
    #[serde(default)]
    pub components: HashMap<String, ComponentConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub start_mode: StartMode,
    /// Per-attempt handler bound, unless a component declares its own.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,
    #[serde(default)]
    pub default_retries: u32,
    #[serde(default, with = "humantime_serde")]
    pub default_retry_backoff: Duration,
    /// Overall bound for one health sweep.
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub health_timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub startup_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub shutdown_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub retry_backoff: Option<Duration>,
    pub priority: Option<i32>,
}

/// Logging configuration - maps subsystem (target prefix) names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/api.log"; empty disables the file sink
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

fn default_home_dir() -> String {
    ".".to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            start_mode: StartMode::default(),
            default_timeout: default_timeout(),
            default_retries: 0,
            default_retry_backoff: Duration::ZERO,
            health_timeout: default_health_timeout(),
            startup_timeout: None,
            shutdown_timeout: None,
        }
    }
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/wirekit.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            runtime: RuntimeConfig::default(),
            logging: Some(default_logging_config()),
            components: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let path = config_path.as_ref();
        if !path.exists() {
            anyhow::bail!("config file not found: {}", path.display());
        }

        // Optional sections stay None unless YAML/ENV provide them.
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(path))
            // Example: WIREKIT__RUNTIME__DEFAULT_RETRIES=3 maps to runtime.default_retries
            .merge(Env::prefixed("WIREKIT__").split("__"));

        figment
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))
    }

    /// Load configuration from file or create with default values.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => Ok(Self::default()),
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        // Set logging level based on verbose flags for "default" section.
        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            default_section.console_level = match args.verbose {
                0 => default_section.console_level.clone(), // keep
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }

    /// Host options derived from the `runtime` and `components` sections.
    pub fn host_options(&self) -> HostOptions {
        HostOptions {
            start_mode: self.runtime.start_mode,
            defaults: RetryPolicy {
                timeout: self.runtime.default_timeout,
                retries: self.runtime.default_retries,
                backoff: self.runtime.default_retry_backoff,
            },
            overrides: self
                .components
                .iter()
                .map(|(name, c)| (name.clone(), c.to_overrides()))
                .collect(),
        }
    }
}

impl ComponentConfig {
    pub fn to_overrides(&self) -> PolicyOverrides {
        PolicyOverrides {
            timeout: self.timeout,
            retries: self.retries,
            retry_backoff: self.retry_backoff,
            priority: self.priority,
        }
    }
}

/// Command line arguments structure.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_structure() {
        let config = AppConfig::default();

        assert_eq!(config.home_dir, ".");
        assert_eq!(config.runtime.start_mode, StartMode::Sequential);
        assert_eq!(config.runtime.default_timeout, Duration::from_secs(30));
        assert_eq!(config.runtime.health_timeout, Duration::from_secs(5));
        assert!(config.runtime.startup_timeout.is_none());

        let logging = config.logging.as_ref().unwrap();
        let default_section = &logging["default"];
        assert_eq!(default_section.console_level, "info");
        assert_eq!(default_section.file, "logs/wirekit.log");

        assert!(config.components.is_empty());
    }

    #[test]
    fn test_layered_yaml_config() {
        let tmp = tempdir().unwrap();
        let cfg_path = tmp.path().join("cfg.yaml");

        let yaml = r#"
home_dir: "/var/lib/wirekit"
runtime:
  start_mode: waves
  default_timeout: 2s
  default_retry_backoff: 250ms
  shutdown_timeout: 1m
components:
  database:
    timeout: 10s
    retries: 3
  cache:
    priority: -1
logging:
  default:
    console_level: debug
    file: "logs/default.log"
"#;
        fs::write(&cfg_path, yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();

        assert_eq!(config.home_dir, "/var/lib/wirekit");
        assert_eq!(config.runtime.start_mode, StartMode::Waves);
        assert_eq!(config.runtime.default_timeout, Duration::from_secs(2));
        assert_eq!(
            config.runtime.default_retry_backoff,
            Duration::from_millis(250)
        );
        assert_eq!(config.runtime.shutdown_timeout, Some(Duration::from_secs(60)));
        // untouched defaults survive the merge
        assert_eq!(config.runtime.health_timeout, Duration::from_secs(5));

        let db = &config.components["database"];
        assert_eq!(db.timeout, Some(Duration::from_secs(10)));
        assert_eq!(db.retries, Some(3));
        assert_eq!(config.components["cache"].priority, Some(-1));

        let logging = config.logging.as_ref().unwrap();
        assert_eq!(logging["default"].console_level, "debug");
    }

    #[test]
    fn test_minimal_yaml_config() {
        let tmp = tempdir().unwrap();
        let cfg_path = tmp.path().join("cfg.yaml");
        fs::write(&cfg_path, "home_dir: /tmp/wk\n").unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();

        assert_eq!(config.home_dir, "/tmp/wk");
        assert_eq!(config.runtime.default_timeout, Duration::from_secs(30));
        // Optional sections default to None
        assert!(config.logging.is_none());
        assert!(config.components.is_empty());
    }

    #[test]
    fn test_env_overrides_yaml() {
        let tmp = tempdir().unwrap();
        let cfg_path = tmp.path().join("cfg.yaml");
        fs::write(&cfg_path, "runtime:\n  default_retries: 1\n").unwrap();

        std::env::set_var("WIREKIT__RUNTIME__DEFAULT_RETRIES", "7");
        let loaded = AppConfig::load_layered(&cfg_path);
        std::env::remove_var("WIREKIT__RUNTIME__DEFAULT_RETRIES");

        assert_eq!(loaded.unwrap().runtime.default_retries, 7);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let tmp = tempdir().unwrap();
        let cfg_path = tmp.path().join("cfg.yaml");
        fs::write(&cfg_path, "components:\n  db:\n    retires: 2\n").unwrap();

        let err = AppConfig::load_layered(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("retires"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let tmp = tempdir().unwrap();
        let err = AppConfig::load_layered(tmp.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config = AppConfig::load_or_default(None::<&str>).unwrap();
        assert!(config.logging.is_some());
    }

    #[test]
    fn test_cli_verbose_levels_matrix() {
        for (verbose_level, expected_log_level) in [
            (0, "info"), // unchanged from default
            (1, "debug"),
            (2, "trace"),
            (3, "trace"), // cap at trace
        ] {
            let mut config = AppConfig::default();
            let args = CliArgs {
                verbose: verbose_level,
                ..CliArgs::default()
            };
            config.apply_cli_overrides(&args);
            let logging = config.logging.as_ref().unwrap();
            assert_eq!(
                logging["default"].console_level, expected_log_level,
                "verbose level {verbose_level}"
            );
        }
    }

    #[test]
    fn test_host_options_mapping() {
        let mut config = AppConfig::default();
        config.runtime.start_mode = StartMode::Waves;
        config.runtime.default_retries = 2;
        config.components.insert(
            "db".to_string(),
            ComponentConfig {
                timeout: Some(Duration::from_secs(1)),
                priority: Some(5),
                ..ComponentConfig::default()
            },
        );

        let options = config.host_options();
        assert_eq!(options.start_mode, StartMode::Waves);
        assert_eq!(options.defaults.retries, 2);
        assert_eq!(options.defaults.timeout, Duration::from_secs(30));
        let db = options.overrides["db"];
        assert_eq!(db.timeout, Some(Duration::from_secs(1)));
        assert_eq!(db.priority, Some(5));
        assert!(db.retries.is_none());
    }

    #[test]
    fn test_to_yaml_roundtrip_basic() {
        let mut config = AppConfig::default();
        config.runtime.startup_timeout = Some(Duration::from_secs(90));
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("startup_timeout: 1m 30s"));

        let back: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.runtime.startup_timeout, Some(Duration::from_secs(90)));
    }
}
