//! Relay daemon configuration.
//!
//! Read from the TOML file named by `--config <path>` or the
//! `UPLINK_CONFIG` environment variable. Every field has a default, so a
//! missing file (or an empty one) runs a development relay on localhost.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use uplink_relay_server::ServerConfig;
use uplink_transfer::TransferConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "UPLINK_CONFIG";

/// Daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSection,
    pub sink: SinkSection,
    pub transfer: TransferConfig,
}

/// `[server]`: where the WebSocket listener binds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: IpAddr,
    /// TCP port (0 = auto-assign).
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        }
    }
}

/// `[sink]`: the directory finished objects are written under.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SinkSection {
    pub root: PathBuf,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            root: default_sink_root(),
        }
    }
}

fn default_sink_root() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("uplink")
            .join("objects")
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("LOCALAPPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData\\Local".into());
        PathBuf::from(appdata).join("uplink").join("objects")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp/uplink/objects")
    }
}

impl RelayConfig {
    /// Loads the file at `path`, or the defaults when there is no path or
    /// the file does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            tracing::debug!("no config file given, using defaults");
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration read");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Checks the transfer tuning and the sink root.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.transfer.validate()?;
        if self.sink.root.as_os_str().is_empty() {
            anyhow::bail!("sink root must not be empty");
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.server.bind,
            port: self.server.port,
        }
    }
}

/// Resolves the config path from the command line, falling back to
/// [`CONFIG_ENV`].
pub fn config_path(args: impl IntoIterator<Item = String>) -> anyhow::Result<Option<PathBuf>> {
    resolve_path(args, std::env::var(CONFIG_ENV).ok())
}

fn resolve_path(
    args: impl IntoIterator<Item = String>,
    env: Option<String>,
) -> anyhow::Result<Option<PathBuf>> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return match args.next() {
                Some(p) => Ok(Some(PathBuf::from(p))),
                None => anyhow::bail!("--config needs a path"),
            };
        }
        if let Some(p) = arg.strip_prefix("--config=") {
            return Ok(Some(PathBuf::from(p)));
        }
        anyhow::bail!("unknown argument: {arg}");
    }
    Ok(env.filter(|p| !p.is_empty()).map(PathBuf::from))
}
