// Required external crates for configuration management and serialization
use serde::Deserialize;
use std::path::{Path, PathBuf};
use config::{Config, ConfigError, Environment, File};

/// Which serial channel the firmware talks to
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// Process stdin/stdout
    Stdio,
    /// A character device such as /dev/ttyACM0
    Device,
}

/// How tokens that are not integers are treated
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// atoi-style conversion, garbage becomes 0
    #[default]
    Permissive,
    /// Reject the whole command on the first bad token
    Strict,
}

/// Configuration for the serial link
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Channel to open
    pub port: PortKind,
    /// Device path when `port = "device"`
    pub device: Option<PathBuf>,
    /// Line speed. The host does not program the UART; this is logged only.
    pub baud_rate: u32,
    /// Echo each received byte back to the sender
    pub echo: bool,
    /// Line buffer capacity, terminator slot included
    pub line_capacity: usize,
    /// Sleep between empty polls, 0 busy-waits
    pub idle_backoff_us: u64,
}

/// Configuration for the model artifact and its working memory
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// External artifact; the embedded one is used when absent
    pub path: Option<PathBuf>,
    /// Registered runtime name, "native" or "fake"
    pub engine: String,
    /// Size of the working arena in bytes
    pub arena_size: usize,
}

/// Configuration for the integer list parser
#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    pub mode: ParseMode,
    /// Token separator
    pub delimiter: char,
}

/// Configuration for the startup sequence
#[derive(Debug, Deserialize, Clone)]
pub struct StartupConfig {
    /// First line written to the serial channel
    pub banner: String,
    /// Delay before the banner, in milliseconds
    pub delay_ms: u64,
}

/// Configuration for application logging
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Directory for the rolling log file
    pub directory: PathBuf,
    /// Emit JSON lines instead of plain text
    pub json: bool,
}

/// Main settings struct that contains all configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub serial: SerialConfig,
    pub model: ModelConfig,
    pub parser: ParserConfig,
    pub startup: StartupConfig,
    pub logging: LoggingConfig,
}

impl Default for Settings {
    /// Same values as the shipped `config/default.toml`
    fn default() -> Self {
        Self {
            serial: SerialConfig {
                port: PortKind::Stdio,
                device: None,
                baud_rate: 115_200,
                echo: true,
                line_capacity: 64,
                idle_backoff_us: 0,
            },
            model: ModelConfig {
                path: None,
                engine: "native".to_string(),
                arena_size: 2 * 1024,
            },
            parser: ParserConfig {
                mode: ParseMode::Permissive,
                delimiter: ',',
            },
            startup: StartupConfig {
                banner: "Test Project waking up".to_string(),
                delay_ms: 0,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                directory: PathBuf::from("logs"),
                json: false,
            },
        }
    }
}

/// Implementation for loading and parsing configuration
impl Settings {
    /// Creates a new Settings instance by loading config from multiple sources
    /// in the following order of precedence (highest to lowest):
    /// 1. Environment variables prefixed with SEPTET__
    /// 2. Local config file (local.toml) if present
    /// 3. Default config file (default.toml)
    pub fn from_dir(config_dir: &Path) -> Result<Self, ConfigError> {
        if !config_dir.exists() {
            return Err(ConfigError::Message(
                format!("Config directory not found at: {}", config_dir.display())
            ));
        }

        let default_config = config_dir.join("default.toml");
        if !default_config.exists() {
            return Err(ConfigError::Message(
                format!("Default configuration file not found at: {}", default_config.display())
            ));
        }

        let local_config = config_dir.join("local.toml");

        // Convert paths to strings and keep them alive
        let default_config_path = default_config.to_string_lossy();
        let local_config_path = local_config.to_string_lossy();

        let settings = Config::builder()
            .add_source(File::with_name(&default_config_path))
            .add_source(File::with_name(&local_config_path).required(false))
            .add_source(
                Environment::with_prefix("SEPTET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Settings>()?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        // One content byte plus the terminator slot at minimum
        if self.serial.line_capacity < 2 {
            return Err(ConfigError::Message(
                format!("line_capacity must be at least 2, got: {}", self.serial.line_capacity)
            ));
        }

        if self.serial.port == PortKind::Device && self.serial.device.is_none() {
            return Err(ConfigError::Message(
                "serial.device must be set when serial.port = \"device\"".to_string()
            ));
        }

        if self.model.arena_size == 0 {
            return Err(ConfigError::Message(
                "arena_size must be greater than 0".to_string()
            ));
        }

        if crate::engine::get_engine_by_name(&self.model.engine).is_none() {
            return Err(ConfigError::Message(
                format!("Unknown engine: {}. Must be one of: {}",
                    self.model.engine, crate::engine::engine_names().join(", "))
            ));
        }

        let delimiter = self.parser.delimiter;
        if !delimiter.is_ascii() || delimiter == '\r' || delimiter.is_ascii_digit() {
            return Err(ConfigError::Message(
                format!("Invalid delimiter {:?}: must be ASCII, not a digit and not CR", delimiter)
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            _ => Err(ConfigError::Message(
                format!("Invalid logging level: {}. Must be one of: error, warn, info, debug, trace",
                    self.logging.level)
            )),
        }?;

        Ok(())
    }
}
