//! tunlite: bring a system-wide TUN tunnel up and down.
//!
//! A [`TunnelController`] starts a local SOCKS proxy, waits for its port,
//! creates a TUN interface that captures the host's traffic (except the
//! proxy's own), and hands the TUN descriptor to a relay process that
//! bridges packets into the proxy.

pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod pipeline;
pub mod probe;
pub mod process;
pub mod runtime;
pub mod stats;
pub mod tunnel;

pub use config::{ProxyConfig, RelayConfig};
pub use error::{TunnelError, TunnelResult};
pub use net::{InterfaceHandle, InterfaceParams, InterfaceProvider};
pub use probe::{Readiness, wait_until_listening};
pub use runtime::TunnelOptions;
pub use stats::TrafficStats;
pub use tunnel::{StartMetrics, TunnelController, TunnelInfo, TunnelState, TunnelStatus};
