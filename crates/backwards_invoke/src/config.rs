//! Startup configuration read from the plugin's environment.
//!
//! Values come from the process environment, optionally seeded from a
//! `.env` file. Only [`RuntimeConfig::session_config`] is consumed by the
//! runtime itself; the rest is wiring for the transport and logging.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::info;

use crate::logging::LogSettings;
use crate::session::{DEFAULT_QUEUE_CAPACITY, SessionConfig};

pub const MAX_REQUEST_TIMEOUT: &str = "MAX_REQUEST_TIMEOUT";
pub const MAX_WORKER: &str = "MAX_WORKER";
pub const HEARTBEAT_INTERVAL: &str = "HEARTBEAT_INTERVAL";
pub const INSTALL_METHOD: &str = "INSTALL_METHOD";
pub const REMOTE_INSTALL_HOST: &str = "REMOTE_INSTALL_HOST";
pub const REMOTE_INSTALL_PORT: &str = "REMOTE_INSTALL_PORT";
pub const REMOTE_INSTALL_KEY: &str = "REMOTE_INSTALL_KEY";
pub const DIFY_PLUGIN_DAEMON_URL: &str = "DIFY_PLUGIN_DAEMON_URL";
pub const BACKWARDS_QUEUE_CAPACITY: &str = "BACKWARDS_QUEUE_CAPACITY";
pub const LOG_LEVEL: &str = "LOG_LEVEL";
pub const LOG_DIR: &str = "LOG_DIR";

/// Upper bound for configured timeouts and intervals.
pub const MAX_CONFIGURED_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{var} must be set when INSTALL_METHOD={method}")]
    Missing {
        var: &'static str,
        method: InstallMethod,
    },
    #[error("failed to load env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
}

/// How the plugin reaches its daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum InstallMethod {
    /// Spawned by the daemon; stdin/stdout are the transport.
    #[default]
    Local,
    /// Connects out to the daemon over TCP.
    Remote,
    /// Request/response over HTTP; no duplex transport.
    Serverless,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub max_request_timeout: Duration,
    pub max_worker: usize,
    /// `None` when the heartbeat is disabled.
    pub heartbeat_interval: Option<Duration>,
    pub install_method: InstallMethod,
    pub remote_install_host: String,
    pub remote_install_port: u16,
    pub remote_install_key: Option<String>,
    pub plugin_daemon_url: String,
    pub queue_capacity: usize,
    pub log: LogSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            max_request_timeout: session.request_timeout,
            max_worker: 1000,
            heartbeat_interval: session.heartbeat_interval,
            install_method: InstallMethod::Local,
            remote_install_host: "localhost".into(),
            remote_install_port: 5003,
            remote_install_key: None,
            plugin_daemon_url: "http://localhost:5002".into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            log: LogSettings::default(),
        }
    }
}

impl RuntimeConfig {
    /// Seed the environment from `env_file` (if given) and read it.
    ///
    /// An explicitly named file must exist; variables already set in the
    /// process take precedence over the file.
    pub fn load(env_file: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = env_file {
            dotenvy::from_path(path).map_err(|source| ConfigError::EnvFile {
                path: path.to_path_buf(),
                source,
            })?;
            info!(path = %path.display(), "loaded env file");
        }
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unset or blank variables take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        if let Some(v) = get(MAX_REQUEST_TIMEOUT) {
            let secs: u64 = parse(MAX_REQUEST_TIMEOUT, &v)?;
            if secs == 0 {
                return Err(invalid(MAX_REQUEST_TIMEOUT, &v, "must be positive"));
            }
            cfg.max_request_timeout = bounded(MAX_REQUEST_TIMEOUT, &v, Duration::from_secs(secs))?;
        }
        if let Some(v) = get(MAX_WORKER) {
            cfg.max_worker = parse(MAX_WORKER, &v)?;
        }
        if let Some(v) = get(HEARTBEAT_INTERVAL) {
            let secs: f64 = parse(HEARTBEAT_INTERVAL, &v)?;
            cfg.heartbeat_interval = if secs == 0.0 {
                None
            } else {
                let every = Duration::try_from_secs_f64(secs)
                    .map_err(|e| invalid(HEARTBEAT_INTERVAL, &v, e.to_string()))?;
                Some(bounded(HEARTBEAT_INTERVAL, &v, every)?)
            };
        }
        if let Some(v) = get(INSTALL_METHOD) {
            cfg.install_method = parse(INSTALL_METHOD, &v)?;
        }
        if let Some(v) = get(REMOTE_INSTALL_HOST) {
            cfg.remote_install_host = v;
        }
        if let Some(v) = get(REMOTE_INSTALL_PORT) {
            cfg.remote_install_port = parse(REMOTE_INSTALL_PORT, &v)?;
        }
        cfg.remote_install_key = get(REMOTE_INSTALL_KEY);
        if let Some(v) = get(DIFY_PLUGIN_DAEMON_URL) {
            cfg.plugin_daemon_url = v;
        }
        if let Some(v) = get(BACKWARDS_QUEUE_CAPACITY) {
            let cap: usize = parse(BACKWARDS_QUEUE_CAPACITY, &v)?;
            if cap == 0 {
                return Err(invalid(BACKWARDS_QUEUE_CAPACITY, &v, "must be positive"));
            }
            cfg.queue_capacity = cap;
        }
        if let Some(v) = get(LOG_LEVEL) {
            cfg.log.level = v;
        }
        cfg.log.dir = get(LOG_DIR).map(PathBuf::from);

        if cfg.install_method == InstallMethod::Remote && cfg.remote_install_key.is_none() {
            return Err(ConfigError::Missing {
                var: REMOTE_INSTALL_KEY,
                method: cfg.install_method,
            });
        }
        Ok(cfg)
    }

    /// The part of the configuration the session runtime consumes.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            request_timeout: self.max_request_timeout,
            heartbeat_interval: self.heartbeat_interval,
            queue_capacity: self.queue_capacity,
        }
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| invalid(var, value, e.to_string()))
}

fn bounded(var: &'static str, value: &str, wait: Duration) -> Result<Duration, ConfigError> {
    if wait > MAX_CONFIGURED_WAIT {
        return Err(invalid(
            var,
            value,
            format!("must be at most {} seconds", MAX_CONFIGURED_WAIT.as_secs()),
        ));
    }
    Ok(wait)
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_owned(),
        reason: reason.into(),
    }
}
