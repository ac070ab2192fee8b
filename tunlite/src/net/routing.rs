//! Policy routing for the tunnel interface.
//!
//! Two rules decide where a packet goes:
//!
//! ```text
//! priority P     uidrange U-U lookup main   (proxy traffic leaves normally)
//! priority P+10  lookup T                   (everything else enters the tunnel)
//! table T:       default dev <tun>
//! ```
//!
//! Lower priority numbers are evaluated first, so sockets owned by the
//! excluded UID never reach the capture rule. Without that ordering the
//! proxy's own upstream connections would loop back into the tunnel.

use std::process::Command;

use crate::error::{TunnelError, TunnelResult};
use crate::net::InterfaceParams;

/// Offset between the exclusion rule and the capture rule.
const CAPTURE_PRIORITY_OFFSET: u32 = 10;

/// Runs an external configuration tool.
pub trait CommandRunner: Send + Sync {
    /// Run `program args...`; a non-zero exit is an error carrying stderr.
    fn run(&self, program: &str, args: &[String]) -> TunnelResult<()>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> TunnelResult<()> {
        let output = Command::new(program).args(args).output().map_err(|e| {
            TunnelError::InterfaceEstablishFailed(format!("failed to execute {}: {}", program, e))
        })?;
        if output.status.success() {
            return Ok(());
        }
        Err(TunnelError::InterfaceEstablishFailed(format!(
            "`{} {}` failed ({}): {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// One invocation of a configuration tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl IpCommand {
    fn ip(family6: bool, args: &[&str]) -> Self {
        let mut full = Vec::with_capacity(args.len() + 1);
        if family6 {
            full.push("-6".to_string());
        }
        full.extend(args.iter().map(|a| a.to_string()));
        Self {
            program: "ip",
            args: full,
        }
    }

    fn resolvectl(args: &[&str]) -> Self {
        Self {
            program: "resolvectl",
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Whether this command adds a policy rule.
    pub fn is_rule_add(&self) -> bool {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        matches!(args.as_slice(), ["rule", "add", ..] | ["-6", "rule", "add", ..])
    }

    /// Value of the `priority` argument, if present.
    pub fn priority(&self) -> Option<u32> {
        self.args
            .windows(2)
            .find(|pair| pair[0] == "priority")
            .and_then(|pair| pair[1].parse().ok())
    }

    pub fn has_arg(&self, name: &str) -> bool {
        self.args.iter().any(|a| a == name)
    }

    fn execute(&self, runner: &dyn CommandRunner) -> TunnelResult<()> {
        runner.run(self.program, &self.args)
    }
}

impl std::fmt::Display for IpCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// The complete set of host changes for one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPlan {
    interface: String,
    setup: Vec<IpCommand>,
    dns: Vec<IpCommand>,
    rollback: Vec<IpCommand>,
}

impl RoutingPlan {
    /// Build the plan for `interface`. Pure: nothing is executed.
    pub fn build(interface: &str, params: &InterfaceParams) -> Self {
        let table = params.route_table.to_string();
        let exclude_priority = params.rule_priority.to_string();
        let capture_priority = (params.rule_priority + CAPTURE_PRIORITY_OFFSET).to_string();
        let uid = params.exclusion.uid;
        let uidrange = format!("{}-{}", uid, uid);
        let mtu = params.mtu.to_string();

        let mut setup = Vec::new();
        let mut rollback = Vec::new();

        let address = params.address.to_string();
        setup.push(IpCommand::ip(false, &["addr", "add", &address, "dev", interface]));
        if let Some(address6) = params.address6 {
            let address6 = address6.to_string();
            setup.push(IpCommand::ip(true, &["addr", "add", &address6, "dev", interface]));
        }
        setup.push(IpCommand::ip(
            false,
            &["link", "set", "dev", interface, "mtu", &mtu, "up"],
        ));

        let mut families = vec![false];
        if params.address6.is_some() {
            families.push(true);
        }

        for route in &params.routes {
            let dest = if route.prefix_len == 0 {
                "default".to_string()
            } else {
                route.to_string()
            };
            setup.push(IpCommand::ip(
                route.is_ipv6(),
                &["route", "replace", &dest, "dev", interface, "table", &table],
            ));
        }

        for &v6 in &families {
            setup.push(IpCommand::ip(
                v6,
                &[
                    "rule",
                    "add",
                    "uidrange",
                    &uidrange,
                    "lookup",
                    "main",
                    "priority",
                    &exclude_priority,
                ],
            ));
            setup.push(IpCommand::ip(
                v6,
                &["rule", "add", "lookup", &table, "priority", &capture_priority],
            ));
        }

        // Capture first, so nothing is sent into a table that is being flushed.
        for &v6 in families.iter().rev() {
            rollback.push(IpCommand::ip(
                v6,
                &["rule", "del", "lookup", &table, "priority", &capture_priority],
            ));
            rollback.push(IpCommand::ip(
                v6,
                &[
                    "rule",
                    "del",
                    "uidrange",
                    &uidrange,
                    "lookup",
                    "main",
                    "priority",
                    &exclude_priority,
                ],
            ));
            rollback.push(IpCommand::ip(v6, &["route", "flush", "table", &table]));
        }

        let mut dns = Vec::new();
        if !params.dns_servers.is_empty() {
            let servers: Vec<String> = params.dns_servers.iter().map(|s| s.to_string()).collect();
            let mut args = vec!["dns", interface];
            args.extend(servers.iter().map(String::as_str));
            dns.push(IpCommand::resolvectl(&args));
            dns.push(IpCommand::resolvectl(&["domain", interface, "~."]));
        }

        Self {
            interface: interface.to_string(),
            setup,
            dns,
            rollback,
        }
    }

    pub fn setup_commands(&self) -> &[IpCommand] {
        &self.setup
    }

    pub fn rollback_commands(&self) -> &[IpCommand] {
        &self.rollback
    }

    pub fn dns_commands(&self) -> &[IpCommand] {
        &self.dns
    }

    /// The IPv4 rule that sends the excluded UID to the main table.
    pub fn exclusion_rule(&self) -> Option<&IpCommand> {
        self.setup
            .iter()
            .find(|c| c.is_rule_add() && c.has_arg("uidrange") && !c.has_arg("-6"))
    }

    /// The IPv4 rule that sends everything else to the tunnel table.
    pub fn capture_rule(&self) -> Option<&IpCommand> {
        self.setup
            .iter()
            .find(|c| c.is_rule_add() && !c.has_arg("uidrange") && !c.has_arg("-6"))
    }

    /// Run the setup commands in order. On failure everything is rolled back.
    pub fn apply(&self, runner: &dyn CommandRunner) -> TunnelResult<()> {
        for command in &self.setup {
            tracing::debug!(interface = %self.interface, command = %command, "Applying routing");
            if let Err(e) = command.execute(runner) {
                tracing::warn!(interface = %self.interface, command = %command, "Routing step failed: {}", e);
                self.rollback(runner);
                return Err(e);
            }
        }
        tracing::info!(
            interface = %self.interface,
            steps = self.setup.len(),
            "Routing applied"
        );
        Ok(())
    }

    /// Point the host resolver at the tunnel. Best-effort.
    pub fn apply_dns(&self, runner: &dyn CommandRunner) {
        for command in &self.dns {
            if let Err(e) = command.execute(runner) {
                tracing::warn!(interface = %self.interface, "DNS setup skipped: {}", e);
                return;
            }
        }
    }

    /// Undo the rules and the table. Missing entries are not an error.
    pub fn rollback(&self, runner: &dyn CommandRunner) {
        for command in &self.rollback {
            if let Err(e) = command.execute(runner) {
                tracing::debug!(interface = %self.interface, command = %command, "Rollback step: {}", e);
            }
        }
        tracing::debug!(interface = %self.interface, "Routing rolled back");
    }
}
