//! Client settings.
//!
//! A value set on the command line (or through its `TASKLANE_*` variable)
//! beats `~/.config/tasklane/config.toml`, which beats the built-in
//! default. The default file may be absent; a file named with `--config`
//! must exist.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use tasklane_proto::registry::EncryptionConfig;
use tasklane_proto::task::MAX_TASK_TEXT_LENGTH;

use crate::confirm::DEFAULT_CONFIRM_TIMEOUT;
use crate::crypto::stub::STUB_METHOD;
use crate::registry::{DEFAULT_OPEN_MAX_WAIT, DEFAULT_OPEN_POLL_INTERVAL, RegistrySettings};
use crate::store::memory::{DEFAULT_CHANGE_BUFFER, MemoryProvider};

/// Why settings could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file exists but could not be read, or was named
    /// explicitly and is missing.
    #[error("cannot read settings file {path}: {source}")]
    ReadFile {
        /// File that was read.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for this schema.
    #[error("malformed settings file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value parsed but is not usable.
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        /// Dotted name of the offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

// Every file setting is optional; unset ones fall through to the default.

/// Shape of `config.toml`.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    identity: IdentityFileConfig,
    delegation: DelegationFileConfig,
    registry: RegistryFileConfig,
    migration: MigrationFileConfig,
    store: StoreFileConfig,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    id: Option<String>,
}

/// `[delegation]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DelegationFileConfig {
    confirm_timeout_secs: Option<u64>,
    max_task_text_len: Option<usize>,
}

/// `[registry]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RegistryFileConfig {
    open_poll_interval_ms: Option<u64>,
    open_max_wait_ms: Option<u64>,
}

/// `[migration]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MigrationFileConfig {
    default_method: Option<String>,
}

/// `[store]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreFileConfig {
    change_buffer: Option<usize>,
}

/// Settings after merging every layer.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Identity --
    /// Identity to act as, when not supplied by an identity provider.
    pub identity_id: Option<String>,

    // -- Delegation --
    /// Time allowed for the re-authentication gesture.
    pub confirm_timeout: Duration,
    /// Maximum task text length in characters.
    pub max_task_text_len: usize,

    // -- Registry --
    /// Interval between checks while another registry open is in flight.
    pub open_poll_interval: Duration,
    /// Time to wait for another registry open before proceeding anyway.
    pub open_max_wait: Duration,

    // -- Migration --
    /// Method used when migrating a list to an encrypted configuration.
    pub default_encryption_method: String,

    // -- Store --
    /// Capacity of each database's change broadcast.
    pub change_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity_id: None,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            max_task_text_len: MAX_TASK_TEXT_LENGTH,
            open_poll_interval: DEFAULT_OPEN_POLL_INTERVAL,
            open_max_wait: DEFAULT_OPEN_MAX_WAIT,
            default_encryption_method: STUB_METHOD.to_string(),
            change_buffer: DEFAULT_CHANGE_BUFFER,
        }
    }
}

impl ClientConfig {
    /// Merges `cli` over the settings file and checks the result.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ReadFile`] or [`ConfigError::ParseToml`] for file
    /// problems, [`ConfigError::InvalidValue`] for unusable values.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            identity_id: cli
                .identity
                .clone()
                .or_else(|| file.identity.id.clone()),
            confirm_timeout: file
                .delegation
                .confirm_timeout_secs
                .map_or(defaults.confirm_timeout, Duration::from_secs),
            max_task_text_len: file
                .delegation
                .max_task_text_len
                .unwrap_or(defaults.max_task_text_len),
            open_poll_interval: file
                .registry
                .open_poll_interval_ms
                .map_or(defaults.open_poll_interval, Duration::from_millis),
            open_max_wait: file
                .registry
                .open_max_wait_ms
                .map_or(defaults.open_max_wait, Duration::from_millis),
            default_encryption_method: file
                .migration
                .default_method
                .clone()
                .unwrap_or(defaults.default_encryption_method),
            change_buffer: file.store.change_buffer.unwrap_or(defaults.change_buffer),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_task_text_len == 0 {
            return Err(ConfigError::InvalidValue {
                field: "delegation.max_task_text_len",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.change_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.change_buffer",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.open_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "registry.open_poll_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        crate::crypto::cipher_for(Some(&self.default_encryption_method), "")
            .map(|_| ())
            .map_err(|e| ConfigError::InvalidValue {
                field: "migration.default_method",
                reason: e.to_string(),
            })
    }

    /// Registry tuning derived from this configuration.
    #[must_use]
    pub const fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            open_poll_interval: self.open_poll_interval,
            open_max_wait: self.open_max_wait,
        }
    }

    /// Encrypted configuration using the default method.
    #[must_use]
    pub fn default_encryption(&self) -> EncryptionConfig {
        EncryptionConfig::encrypted(self.default_encryption_method.clone())
    }

    /// In-process provider whose databases buffer `change_buffer` changes.
    #[must_use]
    pub fn memory_provider(&self) -> MemoryProvider {
        MemoryProvider::with_change_buffer(self.change_buffer)
    }
}

/// Command line of the `tasklane` binary.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Inspect Tasklane list and registry log dumps")]
pub struct CliArgs {
    /// Identity to act as.
    #[arg(long, global = true, env = "TASKLANE_IDENTITY")]
    pub identity: Option<String>,

    /// Settings file to use instead of `~/.config/tasklane/config.toml`.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Tracing filter, e.g. `debug` or `tasklane::security=warn`.
    #[arg(long, global = true, default_value = "info", env = "TASKLANE_LOG")]
    pub log_level: String,

    /// Where to write logs. Defaults to `$TMPDIR/tasklane.log`.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// What to do.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Inspection commands. Each reads an exported dump: a JSON array of
/// `{"key": ..., "value": ...}` objects.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the reduced task list of a list dump as JSON.
    Reduce {
        /// List log dump.
        #[arg(long)]
        entries: PathBuf,
        /// Evaluate delegations at this instant (RFC 3339). Defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Print what the identity (`--identity` or config) may write on one
    /// task.
    Access {
        /// List log dump.
        #[arg(long)]
        entries: PathBuf,
        /// Task key.
        #[arg(long)]
        task: String,
        /// Evaluate delegations at this instant (RFC 3339). Defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Print the breadcrumb of a list from a registry dump.
    Path {
        /// Registry log dump.
        #[arg(long)]
        registry: PathBuf,
        /// Display name of the list.
        name: String,
    },
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tasklane").join("config.toml"))
}

/// Reads the settings file. Only the default location may be missing.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let (path, required) = match explicit_path {
        Some(path) => (path.to_path_buf(), true),
        None => match default_config_path() {
            Some(path) => (path, false),
            None => return Ok(ConfigFile::default()),
        },
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(source) if !required && source.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ConfigFile::default());
        }
        Err(source) => return Err(ConfigError::ReadFile { path, source }),
    };
    Ok(toml::from_str(&contents)?)
}
