use crate::tree::reader::ReadOptions;
use crate::services::catalog::backend::Credentials;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where connection settings come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Read `~/.irods/irods_environment.json`
    System,
    /// Use the fields of `ConnectionOptions` as given
    #[default]
    UserDefined,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default)]
    pub environment: Environment,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub zone: String,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: String,

    /// Upper bound on concurrently open sessions
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_stat_cache_capacity")]
    pub stat_cache_capacity: usize,

    /// Map unrecognized ACL access strings to `null` instead of failing
    #[serde(default = "default_false")]
    pub lenient_access_levels: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1247
}

fn default_pool_size() -> usize {
    4
}

fn default_stat_cache_capacity() -> usize {
    256
}

fn default_false() -> bool {
    false
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            host: default_host(),
            port: default_port(),
            zone: String::new(),
            username: String::new(),
            password: String::new(),
            pool_size: default_pool_size(),
            stat_cache_capacity: default_stat_cache_capacity(),
            lenient_access_levels: false,
        }
    }
}

/// Subset of the iRODS client environment file we understand
#[derive(Debug, Deserialize)]
struct EnvironmentFile {
    irods_host: Option<String>,
    irods_port: Option<u16>,
    irods_zone_name: Option<String>,
    irods_user_name: Option<String>,
}

impl ConnectionOptions {
    pub fn new(username: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            zone: zone.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let options: ConnectionOptions =
            serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Ok(options)
    }

    /// Save configuration to a JSON file
    ///
    /// The password is never written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Default location of the client environment file
    pub fn system_environment_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".irods").join("irods_environment.json"))
    }

    /// Fill host, port, zone and user from an iRODS environment file
    pub fn apply_environment_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        let env: EnvironmentFile =
            serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(host) = env.irods_host {
            self.host = host;
        }
        if let Some(port) = env.irods_port {
            self.port = port;
        }
        if let Some(zone) = env.irods_zone_name {
            self.zone = zone;
        }
        if let Some(user) = env.irods_user_name {
            self.username = user;
        }
        Ok(())
    }

    /// Resolve `Environment::System` into concrete fields
    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        if self.environment == Environment::System {
            let path = Self::system_environment_path().ok_or_else(|| {
                ConfigError::ValidationError("cannot locate home directory".to_string())
            })?;
            self.apply_environment_file(path)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::ValidationError("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "port must be greater than 0".to_string(),
            ));
        }
        if self.zone.is_empty() {
            return Err(ConfigError::ValidationError("zone cannot be empty".to_string()));
        }
        if self.username.is_empty() {
            return Err(ConfigError::ValidationError(
                "username cannot be empty".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        let mut credentials = Credentials::new(self.username.clone(), self.zone.clone())
            .with_password(self.password.clone());
        credentials.host = self.host.clone();
        credentials.port = self.port;
        credentials
    }
}

/// How to open a collection
#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    pub path: String,
    /// Initialize the whole subtree eagerly
    pub recursive: bool,
    /// List one row per replica instead of one per data object
    pub fetch_replicas: bool,
    /// Bypass the connection's stat cache
    pub skip_cache: bool,
    pub read: ReadOptions,
}

impl CollectionOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn fetch_replicas(mut self, fetch: bool) -> Self {
        self.fetch_replicas = fetch;
        self
    }

    pub fn skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }

    pub fn read_options(mut self, read: ReadOptions) -> Self {
        self.read = read;
        self
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(msg) => write!(f, "IO error: {msg}"),
            ConfigError::ParseError(msg) => write!(f, "Parse error: {msg}"),
            ConfigError::SerializeError(msg) => write!(f, "Serialize error: {msg}"),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
