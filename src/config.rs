//! Server settings loaded from a `key:value` text file.
//!
//! ```text
//! # comments and blank lines are skipped
//! port: 1316
//! mode: 3
//! timeout: 60000
//! openLog: true
//! srcDir: ./resources
//! ```
//!
//! All whitespace is removed from each line before it is split at the first
//! `:`. Values are typed the way YAML would read them, then deserialized into
//! [`Config`]. Keys that are absent keep their defaults.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config value: {0}")]
    Invalid(#[from] serde_yaml::Error),
    #[error("trigger mode must be 0..=3, got {0}")]
    Mode(u8),
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub port: u16,
    /// 0: level-triggered everywhere, 1: edge-triggered connections,
    /// 2: edge-triggered listener, 3: both edge-triggered.
    pub mode: u8,
    /// Idle timeout in milliseconds; 0 disables it.
    pub timeout: u64,
    #[serde(deserialize_with = "flag")]
    pub opt_linger: bool,
    pub conn_pool_num: usize,
    pub thread_num: usize,
    #[serde(deserialize_with = "flag")]
    pub open_log: bool,
    /// 0 debug, 1 info, 2 warn, 3 error.
    pub log_level: u8,
    /// Capacity of the asynchronous log queue; 0 writes synchronously.
    pub log_que_size: usize,
    #[serde(deserialize_with = "text")]
    pub db_name: String,
    #[serde(deserialize_with = "path")]
    pub src_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1316,
            mode: 3,
            timeout: 60000,
            opt_linger: false,
            conn_pool_num: 12,
            thread_num: 6,
            open_log: true,
            log_level: 1,
            log_que_size: 1024,
            db_name: "tinyweb".to_owned(),
            src_dir: PathBuf::from("./resources"),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut map = Mapping::new();
        for raw in text.lines() {
            let line: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.is_empty() || value.is_empty() {
                continue;
            }
            map.insert(Value::String(key.to_owned()), scalar(value));
        }

        let config: Config = serde_yaml::from_value(Value::Mapping(map))?;
        config.validate()?;
        Ok(config)
    }

    /// File holding the registered users.
    pub fn user_table_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.yaml", self.db_name))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mode > 3 {
            return Err(ConfigError::Mode(self.mode));
        }
        if self.thread_num == 0 {
            return Err(ConfigError::Zero("threadNum"));
        }
        if self.conn_pool_num == 0 {
            return Err(ConfigError::Zero("connPoolNum"));
        }
        Ok(())
    }
}

/// Types a raw value as a YAML scalar, falling back to a plain string.
fn scalar(raw: &str) -> Value {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => v,
        _ => Value::String(raw.to_owned()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn flag<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    match Scalar::deserialize(de)? {
        Scalar::Bool(b) => Ok(b),
        Scalar::Int(i) => Ok(i != 0),
        Scalar::Float(f) => Err(de::Error::custom(format!("expected a boolean, found `{f}`"))),
        Scalar::Text(s) => Err(de::Error::custom(format!("expected a boolean, found `{s}`"))),
    }
}

fn text<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(match Scalar::deserialize(de)? {
        Scalar::Bool(b) => b.to_string(),
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Text(s) => s,
    })
}

fn path<'de, D: Deserializer<'de>>(de: D) -> Result<PathBuf, D::Error> {
    text(de).map(PathBuf::from)
}
