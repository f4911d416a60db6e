use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;

use liblivefeed::poll::default_request_timeout;
use liblivefeed::{PollConfig, TailConfig};

#[derive(Parser, Debug, Default)]
#[command(name = "livefeed", version, about = "Live per-user view of a tailed notes file and a polled task API")]
pub struct Args {
    /// TOML config file. Flags and environment variables override its values.
    #[arg(long, env = "LIVEFEED_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "LIVEFEED_LISTEN")]
    pub listen: Option<SocketAddr>,
    /// Port on all interfaces, used when --listen is not given.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
    /// Source tick interval in milliseconds.
    #[arg(long = "tick-ms", env = "TICK_FREQUENCY")]
    pub tick_ms: Option<u64>,
    /// Notes file to tail.
    #[arg(long, env = "CSV_PATH")]
    pub csv_path: Option<PathBuf>,
    /// Task API endpoint; `?user_id=<id>` is appended per request.
    #[arg(long, env = "EXTERNAL_API_URL")]
    pub api_url: Option<String>,
    /// SQLite database holding the users table.
    #[arg(long, env = "DATABASE_PATH")]
    pub database: Option<PathBuf>,
    #[arg(long, env = "REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,
    /// Maximum number of users with a running task poller.
    #[arg(long, env = "MAX_ACTIVE_USERS")]
    pub max_active_users: Option<usize>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub tick_ms: u64,
    pub csv_path: PathBuf,
    pub api_url: String,
    pub database_path: PathBuf,
    pub request_timeout_ms: Option<u64>,
    pub max_active_users: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            tick_ms: 1000,
            csv_path: PathBuf::from("notes.csv"),
            api_url: "http://127.0.0.1:8081/data".to_string(),
            database_path: PathBuf::from("livefeed.db"),
            request_timeout_ms: None,
            max_active_users: 1000,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Config file (explicit or the default location if present), then
    /// flag/env overrides, then validation.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::load(&path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Some(listen) = args.listen {
            config.listen = listen;
        } else if let Some(port) = args.port {
            config.listen.set_port(port);
        }
        if let Some(tick_ms) = args.tick_ms {
            config.tick_ms = tick_ms;
        }
        if let Some(path) = &args.csv_path {
            config.csv_path = path.clone();
        }
        if let Some(url) = &args.api_url {
            config.api_url = url.clone();
        }
        if let Some(path) = &args.database {
            config.database_path = path.clone();
        }
        if args.request_timeout_ms.is_some() {
            config.request_timeout_ms = args.request_timeout_ms;
        }
        if let Some(max) = args.max_active_users {
            config.max_active_users = max;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            bail!("tick interval must be > 0 ms");
        }
        if let Some(timeout) = self.request_timeout_ms {
            if timeout == 0 || timeout >= self.tick_ms {
                bail!(
                    "request timeout ({timeout} ms) must be > 0 and shorter than the tick ({} ms)",
                    self.tick_ms
                );
            }
        }
        if self.api_url.trim().is_empty() {
            bail!("external API url must not be empty");
        }
        if self.max_active_users == 0 {
            bail!("max active users must be > 0");
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| default_request_timeout(self.tick()))
    }

    pub fn tail_config(&self) -> TailConfig {
        TailConfig::new(&self.csv_path, self.tick())
    }

    pub fn poll_config(&self) -> PollConfig {
        let mut config = PollConfig::new(&self.api_url, self.tick());
        config.request_timeout = self.request_timeout();
        config
    }
}

fn default_config_path() -> PathBuf {
    let base = if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config")
    } else {
        PathBuf::from("/tmp")
    };
    base.join("livefeed").join("config.toml")
}
