//! Relay configuration document.

use std::fmt::Write;
use std::net::Ipv4Addr;

use crate::runtime::RelayOptions;
use crate::runtime::constants::{LOOPBACK, interface};

/// Values rendered into the relay's YAML config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Descriptor number the relay reads packets from.
    pub fd: i32,
    pub mtu: u32,
    pub ipv4: Ipv4Addr,
    pub socks_port: u16,
    pub socks_address: Ipv4Addr,
    pub udp_mode: String,
    pub task_stack_size: u32,
    pub log_level: String,
}

impl RelayConfig {
    pub fn new(fd: i32, socks_port: u16) -> Self {
        Self::from_options(&RelayOptions::default(), fd, socks_port)
    }

    pub fn from_options(options: &RelayOptions, fd: i32, socks_port: u16) -> Self {
        Self {
            fd,
            mtu: interface::MTU,
            ipv4: interface::ADDRESS,
            socks_port,
            socks_address: LOOPBACK,
            udp_mode: options.udp_mode.clone(),
            task_stack_size: options.task_stack_size,
            log_level: options.log_level.clone(),
        }
    }

    pub fn with_interface(mut self, ipv4: Ipv4Addr, mtu: u32) -> Self {
        self.ipv4 = ipv4;
        self.mtu = mtu;
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(256);
        // Writing to a String cannot fail.
        let _ = writeln!(out, "tunnel:");
        let _ = writeln!(out, "  fd: {}", self.fd);
        let _ = writeln!(out, "  mtu: {}", self.mtu);
        let _ = writeln!(out, "  multi-queue: false");
        let _ = writeln!(out, "  ipv4: {}", self.ipv4);
        let _ = writeln!(out, "socks5:");
        let _ = writeln!(out, "  port: {}", self.socks_port);
        let _ = writeln!(out, "  address: {}", self.socks_address);
        let _ = writeln!(out, "  udp: '{}'", self.udp_mode);
        let _ = writeln!(out, "misc:");
        let _ = writeln!(out, "  task-stack-size: {}", self.task_stack_size);
        let _ = writeln!(out, "  log-level: {}", self.log_level);
        out
    }
}
