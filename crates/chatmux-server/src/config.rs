//! Server configuration: TOML file + CLI overrides.

use crate::session::{ManagerOptions, ReconnectPolicy, SweepPolicy};
use crate::transport::BridgeConfig;
use chatmux_core::{SessionError, SessionResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub sweeper: SweeperSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub mirror: MirrorSection,
}

/// `[manager]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerSection {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    #[serde(default = "default_login_wait_secs")]
    pub login_wait_secs: u64,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            close_grace_ms: default_close_grace_ms(),
            login_wait_secs: default_login_wait_secs(),
        }
    }
}

/// `[sweeper]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_connecting_stall")]
    pub connecting_stall_secs: u64,
    #[serde(default = "default_qr_freshness")]
    pub qr_freshness_secs: u64,
}

impl Default for SweeperSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
            connecting_stall_secs: default_connecting_stall(),
            qr_freshness_secs: default_qr_freshness(),
        }
    }
}

/// `[bridge]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_bridge_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// `[credentials]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsSection {
    #[serde(default = "default_credentials_dir")]
    pub dir: String,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            dir: default_credentials_dir(),
        }
    }
}

/// `[mirror]` section of the config TOML. No URL means log-only.
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_mirror_timeout")]
    pub timeout_secs: u64,
}

impl Default for MirrorSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_mirror_timeout(),
        }
    }
}

fn default_max_reconnect_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    3_000
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_close_grace_ms() -> u64 {
    5_000
}
fn default_login_wait_secs() -> u64 {
    90
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_connecting_stall() -> u64 {
    600
}
fn default_qr_freshness() -> u64 {
    300
}
fn default_bridge_url() -> String {
    "ws://127.0.0.1:8787/session".to_string()
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_request_timeout() -> u64 {
    30
}
fn default_credentials_dir() -> String {
    "~/.chatmux/sessions".to_string()
}
fn default_mirror_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bridge_url: Option<String>,
    pub credentials_dir: Option<String>,
    pub mirror_url: Option<String>,
    pub max_reconnect_attempts: Option<u32>,
    pub disable_sweeper: bool,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub manager: ManagerOptions,
    pub login_wait: Duration,
    pub sweep: Option<SweepPolicy>,
    pub bridge: BridgeConfig,
    pub credentials_dir: PathBuf,
    pub mirror_url: Option<String>,
    pub mirror_timeout: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> SessionResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    fn resolve(file: ConfigFile, cli: &CliOverrides) -> SessionResult<Self> {
        let max_attempts = cli
            .max_reconnect_attempts
            .unwrap_or(file.manager.max_reconnect_attempts);
        if file.manager.backoff_base_ms == 0 || file.manager.backoff_cap_ms < file.manager.backoff_base_ms
        {
            return Err(SessionError::Config(format!(
                "backoff cap ({} ms) must be at least the non-zero base ({} ms)",
                file.manager.backoff_cap_ms, file.manager.backoff_base_ms
            )));
        }
        if file.sweeper.interval_secs == 0 {
            return Err(SessionError::Config("sweeper interval must be non-zero".into()));
        }

        let manager = ManagerOptions {
            policy: ReconnectPolicy {
                max_attempts,
                base_delay: Duration::from_millis(file.manager.backoff_base_ms),
                cap_delay: Duration::from_millis(file.manager.backoff_cap_ms),
            },
            close_grace: Duration::from_millis(file.manager.close_grace_ms),
        };

        let sweep = (file.sweeper.enabled && !cli.disable_sweeper).then(|| SweepPolicy {
            interval: Duration::from_secs(file.sweeper.interval_secs),
            connecting_stall: Duration::from_secs(file.sweeper.connecting_stall_secs),
            qr_freshness: Duration::from_secs(file.sweeper.qr_freshness_secs),
        });

        let bridge = BridgeConfig {
            url: cli.bridge_url.clone().unwrap_or(file.bridge.url),
            connect_timeout: Duration::from_secs(file.bridge.connect_timeout_secs),
            request_timeout: Duration::from_secs(file.bridge.request_timeout_secs),
        };

        let credentials_dir = cli
            .credentials_dir
            .clone()
            .unwrap_or(file.credentials.dir);

        Ok(Self {
            manager,
            login_wait: Duration::from_secs(file.manager.login_wait_secs),
            sweep,
            bridge,
            credentials_dir: expand_tilde_str(&credentials_dir),
            mirror_url: cli.mirror_url.clone().or(file.mirror.url),
            mirror_timeout: Duration::from_secs(file.mirror.timeout_secs),
        })
    }
}

fn parse(content: &str) -> SessionResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| SessionError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
