//! Linux TUN interface provider.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use super::tun::open_tun;
use super::{
    CommandRunner, InterfaceHandle, InterfaceParams, InterfaceProvider, RoutingPlan,
    SystemCommandRunner,
};
use crate::error::{TunnelError, TunnelResult};

/// Creates TUN interfaces through `/dev/net/tun` and `ip`.
pub struct LinuxInterfaceProvider {
    runner: Arc<dyn CommandRunner>,
}

impl LinuxInterfaceProvider {
    pub fn new() -> Self {
        Self {
            runner: Arc::new(SystemCommandRunner),
        }
    }
}

impl Default for LinuxInterfaceProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn has_cap_net_admin() -> bool {
    caps::has_cap(
        None,
        caps::CapSet::Effective,
        caps::Capability::CAP_NET_ADMIN,
    )
    .unwrap_or(false)
}

impl InterfaceProvider for LinuxInterfaceProvider {
    fn establish(&self, params: &InterfaceParams) -> TunnelResult<Box<dyn InterfaceHandle>> {
        if !has_cap_net_admin() {
            return Err(TunnelError::InterfaceEstablishFailed(
                "permission denied: CAP_NET_ADMIN is required to create a TUN interface".into(),
            ));
        }

        let (fd, name) = open_tun(&params.name, params.blocking).map_err(|e| {
            TunnelError::InterfaceEstablishFailed(format!(
                "failed to create TUN device {}: {}",
                params.name, e
            ))
        })?;
        tracing::debug!(interface = %name, fd = fd.as_raw_fd(), "TUN device created");

        let plan = RoutingPlan::build(&name, params);
        // On error the plan has rolled itself back; dropping fd removes the device.
        plan.apply(self.runner.as_ref())?;
        plan.apply_dns(self.runner.as_ref());

        tracing::info!(
            interface = %name,
            address = %params.address,
            mtu = params.mtu,
            excluded_uid = params.exclusion.uid,
            "Tunnel interface established"
        );

        Ok(Box::new(LinuxInterface {
            name,
            fd: Some(fd),
            plan,
            runner: Arc::clone(&self.runner),
        }))
    }
}

/// A live TUN interface with its routing.
pub struct LinuxInterface {
    name: String,
    fd: Option<OwnedFd>,
    plan: RoutingPlan,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for LinuxInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxInterface")
            .field("name", &self.name)
            .field("fd", &self.raw_descriptor())
            .finish()
    }
}

impl InterfaceHandle for LinuxInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn raw_descriptor(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn routing(&self) -> Option<&RoutingPlan> {
        Some(&self.plan)
    }

    fn is_present(&self) -> bool {
        Path::new("/sys/class/net").join(&self.name).exists()
    }

    fn close(&mut self) -> TunnelResult<()> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        self.plan.rollback(self.runner.as_ref());
        drop(fd);
        tracing::info!(interface = %self.name, "Tunnel interface closed");
        Ok(())
    }
}

impl Drop for LinuxInterface {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(interface = %self.name, error = %e, "Failed to close interface on drop");
        }
    }
}
