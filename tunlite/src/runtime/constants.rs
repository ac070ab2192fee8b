//! Default values and well-known names.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Default local port the proxy binds its SOCKS5 inbound on.
pub const DEFAULT_SOCKS_PORT: u16 = 10808;

/// Address the proxy's local endpoints listen on.
pub const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Proxy administrative endpoint used for traffic counters.
pub const DEFAULT_STATS_API_ADDR: &str = "127.0.0.1:10085";

pub mod probe {
    use super::Duration;

    pub const TIMEOUT: Duration = Duration::from_secs(10);
    pub const RETRY_INTERVAL: Duration = Duration::from_millis(200);
}

pub mod interface {
    use std::net::{IpAddr, Ipv4Addr};

    pub const ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    pub const PREFIX_LEN: u8 = 30;
    pub const MTU: u32 = 1500;
    pub const NAME_PATTERN: &str = "tunlite%d";
    pub const DNS_SERVERS: [IpAddr; 2] = [
        IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    ];
    /// Policy routing table holding the tunnel's default routes.
    pub const ROUTE_TABLE: u32 = 7227;
    /// Priority of the exclusion rule; the capture rule sits 10 after it.
    pub const RULE_PRIORITY: u32 = 7200;
}

pub mod relay {
    /// Descriptor number the relay sees the TUN device at.
    pub const TUN_FD_SLOT: i32 = 3;
    pub const TASK_STACK_SIZE: u32 = 81920;
    pub const LOG_LEVEL: &str = "info";
    pub const UDP_MODE: &str = "udp";
}

pub mod process {
    use super::Duration;

    /// How long a terminated process gets before SIGKILL.
    pub const GRACE_PERIOD: Duration = Duration::from_secs(1);
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const STATS_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
}

pub mod filenames {
    pub const PROXY_CONFIG: &str = "proxy_config.json";
    pub const RELAY_CONFIG: &str = "relay_config.yml";
    pub const LOG_FILE: &str = "tunlite.log";
    pub const PROXY_LOG: &str = "proxy.log";
    pub const RELAY_LOG: &str = "relay.log";
    pub const LOCK_FILE: &str = "tunlite.lock";
}

pub mod dirs {
    pub const RUN: &str = "run";
    pub const LOGS: &str = "logs";
}

/// Placeholder substituted with a config file path in command templates.
pub const CONFIG_PLACEHOLDER: &str = "{config}";
/// Placeholder substituted with the stats API address in command templates.
pub const API_PLACEHOLDER: &str = "{api}";

/// Environment variable overriding the default home directory.
pub const HOME_ENV: &str = "TUNLITE_HOME";
