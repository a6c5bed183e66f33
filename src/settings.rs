use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::proxy::upstream::UpstreamTarget;
use crate::store::StoreMode;

const FALLBACK_LISTEN: &str = "127.0.0.1:6005";
const DEFAULT_CONFIG_FILE: &str = "stashproxy.toml";

fn default_hasher_timeout() -> u64 {
    10
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_max_response_body_size() -> usize {
    256 * 1024 * 1024
}

fn default_seed_path() -> String {
    "/_seed".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Bind address; when unset it comes from `HOST`/`PORT`.
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub upstream_url: String,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub memory_only: bool,
    #[serde(default)]
    pub hasher_command: Option<String>,
    #[serde(default = "default_hasher_timeout")]
    pub hasher_timeout: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_max_response_body_size")]
    pub max_response_body_size: usize,
    #[serde(default = "default_seed_path")]
    pub seed_path: String,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    /// Settings for `upstream_url` with every other value at its default and an in-memory store.
    pub fn for_upstream(upstream_url: impl Into<String>) -> Self {
        Self {
            listen: None,
            upstream_url: upstream_url.into(),
            data_dir: None,
            memory_only: true,
            hasher_command: None,
            hasher_timeout: default_hasher_timeout(),
            log: default_log_format(),
            verbose: false,
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_timeout: default_upstream_timeout(),
            max_header_size: default_max_header_size(),
            max_request_body_size: default_max_request_body_size(),
            max_response_body_size: default_max_response_body_size(),
            seed_path: default_seed_path(),
            metrics_listen: None,
        }
    }

    /// Layers the settings file, `STASHPROXY__*` environment variables, then command-line flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match cli.config_path() {
            Some(path) => builder.add_source(File::from(path.to_path_buf()).required(true)),
            None => builder.add_source(File::from(PathBuf::from(DEFAULT_CONFIG_FILE)).required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix("STASHPROXY")
                .separator("__")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("upstream_url", cli.url.clone())
            .map_err(to_anyhow)?
            .set_override_option(
                "data_dir",
                cli.data.as_ref().map(|path| path.display().to_string()),
            )
            .map_err(to_anyhow)?
            .set_override_option("listen", cli.host.clone())
            .map_err(to_anyhow)?
            .set_override_option("hasher_command", cli.hasher.clone())
            .map_err(to_anyhow)?
            .set_override_option("memory_only", cli.memory.then_some(true))
            .map_err(to_anyhow)?
            .set_override_option("verbose", cli.verbose.then_some(true))
            .map_err(to_anyhow)?
            .set_override_option("log", cli.log.map(|format| format.as_str()))
            .map_err(to_anyhow)?;

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn hasher_timeout(&self) -> Duration {
        Duration::from_secs(self.hasher_timeout)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn store_mode(&self) -> Result<StoreMode> {
        if self.memory_only {
            return Ok(StoreMode::Memory);
        }
        self.data_dir
            .clone()
            .map(StoreMode::Disk)
            .ok_or_else(|| anyhow!("data_dir is required unless memory_only is set"))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let host = std::env::var("HOST").ok();
        let port = std::env::var("PORT").ok();
        resolve_listen(self.listen.as_deref(), host.as_deref(), port.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.upstream_url.trim().is_empty(),
            "upstream_url is required (pass --url or set STASHPROXY__UPSTREAM_URL)"
        );
        UpstreamTarget::parse(&self.upstream_url)?;
        ensure!(
            self.memory_only || self.data_dir.is_some(),
            "data_dir is required unless memory_only is set (pass --data or --memory)"
        );
        if let Some(command) = &self.hasher_command {
            ensure!(
                !command.trim().is_empty(),
                "hasher_command must not be empty when set"
            );
        }
        ensure!(
            self.seed_path.starts_with('/'),
            "seed_path must start with '/' (got '{}')",
            self.seed_path
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.max_response_body_size > 0,
            "max_response_body_size must be greater than 0 (got {})",
            self.max_response_body_size
        );
        ensure!(
            self.hasher_timeout > 0,
            "hasher_timeout must be greater than 0 seconds (got {})",
            self.hasher_timeout
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        self.listen_addr()?;
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// An explicit `listen` wins. Otherwise `HOST` and `PORT` from the environment form the address,
/// the way hosting platforms hand out ports.
fn resolve_listen(listen: Option<&str>, host: Option<&str>, port: Option<&str>) -> Result<SocketAddr> {
    if let Some(listen) = listen.map(str::trim).filter(|value| !value.is_empty()) {
        return listen
            .parse()
            .with_context(|| format!("invalid listen address '{listen}'"));
    }
    let host = host.map(str::trim).filter(|value| !value.is_empty());
    let port = port.map(str::trim).filter(|value| !value.is_empty());
    let addr = match (host, port) {
        (None, None) => FALLBACK_LISTEN.to_string(),
        (Some(host), None) => bail!("HOST is set to '{host}' but PORT is not"),
        (None, Some(port)) => format!("0.0.0.0:{port}"),
        (Some(host), Some(port)) if host.contains(':') => format!("[{host}]:{port}"),
        (Some(host), Some(port)) => format!("{host}:{port}"),
    };
    addr.parse()
        .with_context(|| format!("invalid listen address '{addr}' from HOST/PORT"))
}
