use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::driver::libhdfs3::{DEFAULT_LIBRARY, Libhdfs3Driver};
use crate::driver::{ConnectParams, to_cstring};
use crate::error::{Error, Result};

pub const DEFAULT_SERVICE: &str = "default";
pub const DEFAULT_MAX_PATH_LENGTH: usize = 1024;
const HDFS_SITE: &str = "hdfs-site.xml";
const CONF_ENV: &str = "LIBHDFS3_CONF";

/// Where and as whom to connect.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Namenode host or HA nameservice id.
    pub service: String,
    /// 0 lets the library resolve the port.
    pub port: u16,
    pub user: Option<String>,
    #[serde(alias = "authToken")]
    pub auth_token: Option<String>,
    #[serde(alias = "kerbTicketCachePath")]
    pub kerb_ticket_cache_path: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.into(),
            port: 0,
            user: None,
            auth_token: None,
            kerb_ticket_cache_path: None,
        }
    }
}

impl ConnectOptions {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn kerb_ticket_cache_path(mut self, path: impl Into<String>) -> Self {
        self.kerb_ticket_cache_path = Some(path.into());
        self
    }

    /// Empty strings count as unset and leave the library default alone.
    pub(crate) fn params(&self) -> Result<ConnectParams> {
        let optional = |what: &str, value: &Option<String>| {
            value
                .as_deref()
                .filter(|v| !v.is_empty())
                .map(|v| to_cstring(what, v))
                .transpose()
        };
        let service = if self.service.is_empty() {
            DEFAULT_SERVICE
        } else {
            &self.service
        };
        Ok(ConnectParams {
            host: to_cstring("service", service)?,
            port: self.port,
            user: optional("user", &self.user)?,
            auth_token: optional("authToken", &self.auth_token)?,
            kerb_ticket_cache_path: optional("kerbTicketCachePath", &self.kerb_ticket_cache_path)?,
        })
    }
}

/// Sizing of the runtime behind a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Async worker threads; they only forward completions.
    pub worker_threads: usize,
    /// Upper bound on concurrently running blocking calls.
    pub max_blocking_threads: usize,
    pub thread_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            max_blocking_threads: 16,
            thread_name: "hdfs-worker".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub namenode: ConnectOptions,
    /// Explicit hdfs client configuration file.
    pub configuration_path: Option<PathBuf>,
    /// Fall back to `HADOOP_CONF_DIR` / `HADOOP_INSTALL` lookups.
    pub use_hadoop_conf_env: bool,
    pub library_path: Option<PathBuf>,
    pub dispatch: DispatchConfig,
    pub max_path_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namenode: ConnectOptions::default(),
            configuration_path: None,
            use_hadoop_conf_env: true,
            library_path: None,
            dispatch: DispatchConfig::default(),
            max_path_length: DEFAULT_MAX_PATH_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_path_length == 0 {
            return Err(Error::Config("max_path_length must be positive".into()));
        }
        if self.dispatch.max_blocking_threads == 0 {
            return Err(Error::Config(
                "dispatch.max_blocking_threads must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn library_path(&self) -> &Path {
        self.library_path
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_LIBRARY))
    }

    /// The configuration file libhdfs3 should read, if this client has to
    /// point it at one.
    pub fn resolve_conf_path(&self) -> Option<PathBuf> {
        self.resolve_conf_path_with(|key| std::env::var(key).ok())
    }

    /// As [`ClientConfig::resolve_conf_path`], reading the environment
    /// through `env`.
    pub fn resolve_conf_path_with<F>(&self, env: F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.configuration_path {
            return Some(path.clone());
        }
        if !self.use_hadoop_conf_env || env(CONF_ENV).is_some_and(|v| !v.is_empty()) {
            return None;
        }
        let candidates = [
            env("HADOOP_CONF_DIR").map(|dir| Path::new(&dir).join(HDFS_SITE)),
            env("HADOOP_INSTALL").map(|dir| Path::new(&dir).join("hadoop/conf").join(HDFS_SITE)),
        ];
        candidates
            .into_iter()
            .flatten()
            .find(|p| is_readable(p))
    }

    /// Load libhdfs3 with this configuration.
    pub fn libhdfs3(&self) -> Result<Libhdfs3Driver> {
        let conf = self.resolve_conf_path();
        Libhdfs3Driver::load(self.library_path(), conf.as_deref())
    }
}

fn is_readable(path: &Path) -> bool {
    fs::File::open(path).is_ok()
}

pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let content = fs::read_to_string(path)?;
    let cfg: ClientConfig = serde_yaml::from_str(&content)?;
    cfg.validate()?;
    debug!("loaded client config from {}", path.display());
    Ok(cfg)
}
