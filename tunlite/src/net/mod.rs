//! Virtual interface management.
//!
//! An [`InterfaceProvider`] creates a TUN interface and routes the host's
//! traffic into it, except traffic from sockets owned by the excluded UID.
//! The returned [`InterfaceHandle`] owns the device descriptor; closing it
//! rolls the routing back and destroys the device.

mod routing;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
mod tun;

pub use routing::{CommandRunner, IpCommand, RoutingPlan, SystemCommandRunner};

#[cfg(target_os = "linux")]
pub use linux::LinuxInterfaceProvider;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{BorrowedFd, RawFd};

use crate::error::TunnelResult;
use crate::runtime::InterfaceOptions;

/// Sockets owned by this UID bypass the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgressExclusion {
    pub uid: u32,
}

impl EgressExclusion {
    /// Exclude the current process's effective UID, which children inherit.
    pub fn current_process() -> Self {
        Self {
            uid: unsafe { libc::geteuid() },
        }
    }
}

/// An address block, rendered as `addr/prefix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Cidr {
    pub fn new(addr: impl Into<IpAddr>, prefix_len: u8) -> Self {
        Self {
            addr: addr.into(),
            prefix_len,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Everything needed to bring up the tunnel interface.
#[derive(Debug, Clone)]
pub struct InterfaceParams {
    /// Kernel name pattern, e.g. `tunlite%d`.
    pub name: String,
    pub address: Cidr,
    pub address6: Option<Cidr>,
    /// Destinations routed into the tunnel table.
    pub routes: Vec<Cidr>,
    pub dns_servers: Vec<IpAddr>,
    pub mtu: u32,
    pub blocking: bool,
    pub route_table: u32,
    /// Priority of the exclusion rule. The capture rule uses `rule_priority + 10`.
    pub rule_priority: u32,
    pub exclusion: EgressExclusion,
}

impl InterfaceParams {
    pub fn from_options(options: &InterfaceOptions) -> Self {
        let address6 = options
            .address6
            .map(|addr| Cidr::new(addr, options.prefix_len6));

        let mut routes = vec![Cidr::new(Ipv4Addr::UNSPECIFIED, 0)];
        if address6.is_some() {
            routes.push(Cidr::new(Ipv6Addr::UNSPECIFIED, 0));
        }

        let exclusion = match options.exclude_uid {
            Some(uid) => EgressExclusion { uid },
            None => EgressExclusion::current_process(),
        };

        Self {
            name: options.name.clone(),
            address: Cidr::new(options.address, options.prefix_len),
            address6,
            routes,
            dns_servers: options.dns_servers.clone(),
            mtu: options.mtu,
            blocking: options.blocking,
            route_table: options.route_table,
            rule_priority: options.rule_priority,
            exclusion,
        }
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        match self.address.addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl Default for InterfaceParams {
    fn default() -> Self {
        Self::from_options(&InterfaceOptions::default())
    }
}

/// Creates configured tunnel interfaces.
pub trait InterfaceProvider: Send + Sync {
    fn establish(&self, params: &InterfaceParams) -> TunnelResult<Box<dyn InterfaceHandle>>;
}

/// An established interface. Owns the device descriptor.
pub trait InterfaceHandle: Send + Sync + fmt::Debug {
    /// Kernel-assigned interface name.
    fn name(&self) -> &str;

    /// The device descriptor, or `None` once closed.
    fn descriptor(&self) -> Option<BorrowedFd<'_>>;

    fn raw_descriptor(&self) -> Option<RawFd>;

    /// The routing applied for this interface, if any.
    fn routing(&self) -> Option<&RoutingPlan>;

    /// Whether the device still exists on the host.
    fn is_present(&self) -> bool;

    /// Roll back routing and release the descriptor. Safe to call twice.
    fn close(&mut self) -> TunnelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = InterfaceParams::default();
        assert_eq!(params.address.to_string(), "10.0.0.2/30");
        assert_eq!(params.routes, vec![Cidr::new(Ipv4Addr::UNSPECIFIED, 0)]);
        assert_eq!(params.mtu, 1500);
        assert!(params.blocking);
        assert_eq!(params.exclusion, EgressExclusion::current_process());
    }

    #[test]
    fn test_ipv6_adds_default_route() {
        let options = InterfaceOptions {
            address6: Some("fd00::2".parse().unwrap()),
            exclude_uid: Some(1234),
            ..Default::default()
        };
        let params = InterfaceParams::from_options(&options);
        assert_eq!(params.address6.unwrap().to_string(), "fd00::2/126");
        assert_eq!(params.routes.len(), 2);
        assert_eq!(params.routes[1].to_string(), "::/0");
        assert_eq!(params.exclusion.uid, 1234);
    }
}
