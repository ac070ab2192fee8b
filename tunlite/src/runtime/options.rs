//! User-facing configuration for a tunnel controller.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TunnelError, TunnelResult};
use crate::runtime::constants::{self, API_PLACEHOLDER, CONFIG_PLACEHOLDER, HOME_ENV};

/// Options for a [`TunnelController`](crate::TunnelController).
///
/// Every field has a default, so a JSON file only needs the keys it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelOptions {
    /// Root for config files, logs and the controller lock.
    pub home_dir: PathBuf,
    pub proxy: ProxyOptions,
    pub relay: RelayOptions,
    pub interface: InterfaceOptions,
    pub probe: ProbeOptions,
    /// Termination grace period before SIGKILL, in milliseconds.
    pub grace_period_ms: u64,
    /// Interval of the health watcher while running; `None` disables it.
    pub health_interval_ms: Option<u64>,
}

/// How to run the proxy and query its counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    pub program: PathBuf,
    /// Arguments; `{config}` becomes the proxy config path.
    pub args: Vec<String>,
    /// Arguments for the stats query; `{api}` becomes `stats_api_addr`.
    pub stats_args: Vec<String>,
    pub stats_api_addr: String,
}

/// How to run the relay and what goes into its config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    pub program: PathBuf,
    /// Arguments; `{config}` becomes the relay config path.
    pub args: Vec<String>,
    /// Descriptor number the TUN device is placed at in the relay.
    pub fd_slot: i32,
    pub task_stack_size: u32,
    pub log_level: String,
    pub udp_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceOptions {
    pub name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub address6: Option<Ipv6Addr>,
    pub prefix_len6: u8,
    pub dns_servers: Vec<IpAddr>,
    pub mtu: u32,
    pub blocking: bool,
    pub route_table: u32,
    pub rule_priority: u32,
    /// UID whose sockets bypass the tunnel; defaults to our effective UID.
    pub exclude_uid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeOptions {
    pub timeout_ms: u64,
    pub interval_ms: u64,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            proxy: ProxyOptions::default(),
            relay: RelayOptions::default(),
            interface: InterfaceOptions::default(),
            probe: ProbeOptions::default(),
            grace_period_ms: constants::process::GRACE_PERIOD.as_millis() as u64,
            health_interval_ms: Some(2_000),
        }
    }
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("xray"),
            args: vec!["run".into(), "-c".into(), CONFIG_PLACEHOLDER.into()],
            stats_args: vec![
                "api".into(),
                "statsquery".into(),
                "-s".into(),
                API_PLACEHOLDER.into(),
            ],
            stats_api_addr: constants::DEFAULT_STATS_API_ADDR.to_string(),
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("hev-socks5-tunnel"),
            args: vec![CONFIG_PLACEHOLDER.into()],
            fd_slot: constants::relay::TUN_FD_SLOT,
            task_stack_size: constants::relay::TASK_STACK_SIZE,
            log_level: constants::relay::LOG_LEVEL.to_string(),
            udp_mode: constants::relay::UDP_MODE.to_string(),
        }
    }
}

impl Default for InterfaceOptions {
    fn default() -> Self {
        Self {
            name: constants::interface::NAME_PATTERN.to_string(),
            address: constants::interface::ADDRESS,
            prefix_len: constants::interface::PREFIX_LEN,
            address6: None,
            prefix_len6: 126,
            dns_servers: constants::interface::DNS_SERVERS.to_vec(),
            mtu: constants::interface::MTU,
            blocking: true,
            route_table: constants::interface::ROUTE_TABLE,
            rule_priority: constants::interface::RULE_PRIORITY,
            exclude_uid: None,
        }
    }
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout_ms: constants::probe::TIMEOUT.as_millis() as u64,
            interval_ms: constants::probe::RETRY_INTERVAL.as_millis() as u64,
        }
    }
}

impl TunnelOptions {
    /// Create options rooted at `home_dir`, everything else default.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            ..Default::default()
        }
    }

    /// Load options from a JSON file.
    pub fn load(path: &Path) -> TunnelResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::Config(format!("failed to read options {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            TunnelError::Config(format!("invalid options {}: {}", path.display(), e))
        })
    }

    /// Validate before any work starts.
    pub fn sanitize(&self) -> TunnelResult<()> {
        if !self.home_dir.is_absolute() {
            return Err(TunnelError::Config(format!(
                "home_dir must be absolute path, got: {}",
                self.home_dir.display()
            )));
        }
        if self.interface.prefix_len > 32 {
            return Err(TunnelError::Config(format!(
                "invalid IPv4 prefix length {}",
                self.interface.prefix_len
            )));
        }
        if self.interface.address6.is_some() && self.interface.prefix_len6 > 128 {
            return Err(TunnelError::Config(format!(
                "invalid IPv6 prefix length {}",
                self.interface.prefix_len6
            )));
        }
        if !(576..=65535).contains(&self.interface.mtu) {
            return Err(TunnelError::Config(format!(
                "MTU {} out of range",
                self.interface.mtu
            )));
        }
        if self.relay.fd_slot < 3 {
            return Err(TunnelError::Config(format!(
                "relay fd slot {} collides with stdio",
                self.relay.fd_slot
            )));
        }
        if self.probe.interval_ms == 0 {
            return Err(TunnelError::Config("probe interval must be non-zero".into()));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        self.health_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl ProbeOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// `$TUNLITE_HOME`, else `<data_local_dir>/tunlite`, else `/tmp/tunlite`.
pub fn default_home_dir() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV)
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }
    dirs::data_local_dir()
        .map(|d| d.join("tunlite"))
        .unwrap_or_else(|| std::env::temp_dir().join("tunlite"))
}
