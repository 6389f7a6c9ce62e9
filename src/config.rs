use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::inference::SamplingDefaults;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_DATABASE_PATH: &str = "requests.db";
const DEFAULT_POOL_SIZE: u32 = 5;
const DEFAULT_MODEL_ID: &str = "microsoft/Phi-3-mini-4k-instruct";
const DEFAULT_MODEL_REVISION: &str = "main";
const DEFAULT_MAX_LENGTH_LIMIT: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Everything the server needs at startup, read once from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database: DatabaseConfig,
    pub model: ModelConfig,
    pub sampling: SamplingDefaults,
    pub max_length_limit: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:`.
    pub path: String,
    pub pool_size: u32,
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self {
            path: ":memory:".to_string(),
            pool_size: 1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelBackend {
    Candle,
    Echo,
}

impl FromStr for ModelBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "candle" => Ok(Self::Candle),
            "echo" => Ok(Self::Echo),
            other => Err(format!("unknown backend '{other}' (expected candle or echo)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
}

impl FromStr for DeviceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "cpu" {
            return Ok(Self::Cpu);
        }
        if s == "cuda" {
            return Ok(Self::Cuda(0));
        }
        match s.strip_prefix("cuda:") {
            Some(id) => id
                .parse()
                .map(Self::Cuda)
                .map_err(|e| format!("bad cuda ordinal '{id}': {e}")),
            None => Err(format!("unknown device '{s}' (expected cpu or cuda:<n>)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub backend: ModelBackend,
    pub model_id: String,
    pub revision: String,
    /// Local snapshot with `config.json`, `tokenizer.json` and safetensors.
    /// Takes precedence over the Hub when set.
    pub local_dir: Option<PathBuf>,
    pub device: DeviceSpec,
    pub seed: Option<u64>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = SamplingDefaults::default();

        Self {
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            database: DatabaseConfig {
                path: get("DATABASE_PATH").unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
                pool_size: parse_or(&get, "DATABASE_POOL_SIZE", DEFAULT_POOL_SIZE)?,
            },
            model: ModelConfig {
                backend: parse_or(&get, "MODEL_BACKEND", ModelBackend::Candle)?,
                model_id: get("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
                revision: get("MODEL_REVISION")
                    .unwrap_or_else(|| DEFAULT_MODEL_REVISION.to_string()),
                local_dir: get("MODEL_DIR").map(PathBuf::from),
                device: parse_or(&get, "MODEL_DEVICE", DeviceSpec::Cpu)?,
                seed: get("GENERATION_SEED")
                    .map(|v| parse_value("GENERATION_SEED", &v))
                    .transpose()?,
            },
            sampling: SamplingDefaults {
                max_length: parse_or(&get, "DEFAULT_MAX_LENGTH", defaults.max_length)?,
                temperature: parse_or(&get, "DEFAULT_TEMPERATURE", defaults.temperature)?,
                top_p: parse_or(&get, "DEFAULT_TOP_P", defaults.top_p)?,
            },
            max_length_limit: parse_or(&get, "MAX_LENGTH_LIMIT", DEFAULT_MAX_LENGTH_LIMIT)?,
        }
        .checked()
    }

    /// Resolve `HOST:PORT` to the first listening address. Hostnames and
    /// bare IPv6 literals are accepted.
    pub async fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let invalid_host = |message: String| ConfigError::InvalidValue {
            key: "HOST".to_string(),
            message,
        };
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| invalid_host(format!("cannot resolve '{}': {e}", self.host)))?
            .next()
            .ok_or_else(|| invalid_host(format!("'{}' resolved to no address", self.host)))
    }

    fn checked(self) -> Result<Self, ConfigError> {
        if self.database.pool_size == 0 {
            return Err(invalid("DATABASE_POOL_SIZE", "must be at least 1"));
        }
        if self.max_length_limit == 0 {
            return Err(invalid("MAX_LENGTH_LIMIT", "must be at least 1"));
        }
        // Defaults go through the same checks as request parameters.
        self.sampling
            .to_params()
            .validate(self.max_length_limit)
            .map_err(|e| invalid("DEFAULT_*", &e.to_string()))?;
        Ok(self)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| invalid(key, &format!("'{raw}': {e}")))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
