//! Abstraction over Windows Firewall (netsh) operations for testability.
//!
//! [`NetshOps`] covers the `netsh advfirewall firewall` verbs the server
//! uses (add/set/delete/show rule). Production code uses [`RealNetshOps`];
//! tests use a stateful mock. [`FirewallControl`] sits on top and exposes
//! the two intents the rest of the server knows about: replacing the
//! block-everything-but-trusted rule and growing the per-IP block list.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use thiserror::Error;
use tokio::process::Command;

use std::future::Future;
use std::net::Ipv4Addr;
use std::process::Output;

pub const IP_BLOCK_RULE: &str = "Chess-Block-IPs";
pub const SUBNET_BLOCK_RULE: &str = "Chess-Block-Other";

const NO_MATCH_MARKER: &str = "No rules match the specified criteria";

#[derive(Debug, Error)]
pub enum Error {
    #[error("netsh execution failed: {0}")]
    CommandFailed(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// The netsh advfirewall verbs used by the controller.
#[async_trait]
pub trait NetshOps: Send + Sync {
    /// Create an inbound TCP block rule.
    async fn add_block_rule(
        &self,
        name: &str,
        local_ports: &str,
        remote_ips: &str,
    ) -> Result<(), Error>;

    /// Replace the `remoteip` list of an existing rule.
    async fn set_remote_ips(&self, name: &str, remote_ips: &str) -> Result<(), Error>;

    /// Delete a rule by name. Deleting a rule that does not exist is success.
    async fn delete_rule(&self, name: &str) -> Result<(), Error>;

    /// Raw `show rule` output, or `None` when no rule has that name.
    async fn show_rule(&self, name: &str) -> Result<Option<String>, Error>;
}

/// log errors and warnings or suppress them
#[derive(Debug)]
enum Logs {
    Print,
    Suppress,
}

/// Shared output handling for every netsh invocation, so all four verbs
/// classify success, stderr noise and failure the same way.
trait NetshCommandExt {
    fn run(&mut self, logs: Logs) -> impl Future<Output = Result<(), Error>> + Send;
    fn run_stdout(&mut self, logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
}

impl NetshCommandExt for Command {
    async fn run(&mut self, logs: Logs) -> Result<(), Error> {
        self.run_stdout(logs).await.map(|_| ())
    }

    async fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output().await?;
        let cmd_debug = format!("{self:?}");
        stdout_from_output(cmd_debug, output, logs)
    }
}

fn stdout_from_output(cmd: String, output: Output, logs: Logs) -> Result<String, Error> {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    match (stderr.is_empty(), output.status) {
        (true, status) if status.success() => Ok(stdout),
        (false, status) if status.success() => {
            if matches!(logs, Logs::Print) {
                tracing::warn!(cmd, %stderr, "non empty stderr on successful netsh command");
            }
            Ok(stdout)
        }
        (_, status) => {
            if matches!(logs, Logs::Print) {
                tracing::error!(cmd, status_code = ?status.code(), %stdout, %stderr, "error executing netsh command");
            }
            // keep both streams in the error: netsh picks one or the other
            // depending on version
            Err(Error::CommandFailed(match (stdout.is_empty(), stderr.is_empty()) {
                (false, false) => format!("{stdout}; {stderr}"),
                (true, false) => stderr,
                _ => stdout,
            }))
        }
    }
}

/// Production [`NetshOps`] shelling out to `netsh advfirewall firewall`.
pub struct RealNetshOps;

impl RealNetshOps {
    fn command() -> Command {
        let mut cmd = Command::new("netsh");
        cmd.arg("advfirewall").arg("firewall");
        cmd
    }
}

#[async_trait]
impl NetshOps for RealNetshOps {
    async fn add_block_rule(
        &self,
        name: &str,
        local_ports: &str,
        remote_ips: &str,
    ) -> Result<(), Error> {
        Self::command()
            .arg("add")
            .arg("rule")
            .arg(format!("name={name}"))
            .arg("dir=in")
            .arg("action=block")
            .arg("protocol=TCP")
            .arg(format!("localport={local_ports}"))
            .arg(format!("remoteip={remote_ips}"))
            .arg("enable=yes")
            .run(Logs::Print)
            .await
    }

    async fn set_remote_ips(&self, name: &str, remote_ips: &str) -> Result<(), Error> {
        Self::command()
            .arg("set")
            .arg("rule")
            .arg(format!("name={name}"))
            .arg("new")
            .arg(format!("remoteip={remote_ips}"))
            .run(Logs::Print)
            .await
    }

    async fn delete_rule(&self, name: &str) -> Result<(), Error> {
        let result = Self::command()
            .arg("delete")
            .arg("rule")
            .arg(format!("name={name}"))
            .run(Logs::Suppress)
            .await;
        match result {
            Ok(()) => Ok(()),
            // deleting a rule that does not exist is success
            Err(Error::CommandFailed(detail)) if detail.contains(NO_MATCH_MARKER) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn show_rule(&self, name: &str) -> Result<Option<String>, Error> {
        let result = Self::command()
            .arg("show")
            .arg("rule")
            .arg(format!("name={name}"))
            .run_stdout(Logs::Suppress)
            .await;
        match result {
            Ok(stdout) => Ok(Some(stdout)),
            // a failed show means no rule has that name
            Err(Error::CommandFailed(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

/// Firewall intents available to the rest of the server.
///
/// Every operation is non-fatal by contract: failures are logged and
/// swallowed so the server keeps serving without OS-level blocking. The
/// caller may observe the same peer again and simply re-request.
#[async_trait]
pub trait FirewallControl: Send + Sync {
    /// Drop and recreate the block-everything-but-trusted rule.
    async fn replace_subnet_block(&self, local_ports: &str, cidrs: &[Ipv4Net]);

    /// Add one peer to the per-IP block list. Idempotent per IP.
    async fn add_ip_to_block_list(&self, ip: Ipv4Addr, local_ports: &str);
}

pub struct NetshFirewall<O: NetshOps> {
    ops: O,
}

impl NetshFirewall<RealNetshOps> {
    pub fn new() -> Self {
        NetshFirewall { ops: RealNetshOps }
    }
}

impl Default for NetshFirewall<RealNetshOps> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: NetshOps> NetshFirewall<O> {
    pub fn with_ops(ops: O) -> Self {
        NetshFirewall { ops }
    }
}

#[async_trait]
impl<O: NetshOps> FirewallControl for NetshFirewall<O> {
    async fn replace_subnet_block(&self, local_ports: &str, cidrs: &[Ipv4Net]) {
        if let Err(error) = self.ops.delete_rule(SUBNET_BLOCK_RULE).await {
            tracing::warn!(%error, rule = SUBNET_BLOCK_RULE, "failed deleting existing subnet block rule");
        }

        let remote_ips = cidrs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        match self
            .ops
            .add_block_rule(SUBNET_BLOCK_RULE, local_ports, &remote_ips)
            .await
        {
            Ok(_) => {
                tracing::info!(ports = local_ports, subnets = cidrs.len(), "installed subnet block rule");
            }
            Err(error) => {
                tracing::warn!(%error, rule = SUBNET_BLOCK_RULE, "failed installing subnet block rule");
            }
        }
    }

    async fn add_ip_to_block_list(&self, ip: Ipv4Addr, local_ports: &str) {
        if !is_global_unicast(ip) {
            tracing::warn!(peer = %ip, "skipping block of non-global address");
            return;
        }

        let existing = match self.ops.show_rule(IP_BLOCK_RULE).await {
            Ok(rule) => rule,
            Err(error) => {
                tracing::warn!(%error, rule = IP_BLOCK_RULE, "failed querying ip block rule");
                return;
            }
        };

        let ip_str = ip.to_string();
        match existing {
            None => {
                match self.ops.add_block_rule(IP_BLOCK_RULE, local_ports, &ip_str).await {
                    Ok(_) => tracing::info!(peer = %ip, "created ip block rule"),
                    Err(error) => {
                        tracing::warn!(%error, peer = %ip, "failed creating ip block rule");
                    }
                }
            }
            Some(output) => {
                let mut members = parse_remote_ips(&output);
                let already_blocked = members
                    .iter()
                    .any(|m| m == &ip_str || m.strip_suffix("/32") == Some(ip_str.as_str()));
                if already_blocked {
                    tracing::info!(peer = %ip, "already on ip block rule");
                    return;
                }
                members.push(ip_str);
                match self.ops.set_remote_ips(IP_BLOCK_RULE, &members.join(",")).await {
                    Ok(_) => tracing::info!(peer = %ip, "added peer to ip block rule"),
                    Err(error) => {
                        tracing::warn!(%error, peer = %ip, "failed updating ip block rule");
                    }
                }
            }
        }
    }
}

/// Used when firewall integration is disabled or the OS has no netsh.
pub struct NoopFirewall;

#[async_trait]
impl FirewallControl for NoopFirewall {
    async fn replace_subnet_block(&self, _local_ports: &str, _cidrs: &[Ipv4Net]) {
        tracing::debug!("firewall integration disabled, skipping subnet block");
    }

    async fn add_ip_to_block_list(&self, ip: Ipv4Addr, _local_ports: &str) {
        tracing::debug!(peer = %ip, "firewall integration disabled, skipping ip block");
    }
}

/// Extract the `RemoteIP:` members from `show rule` output.
fn parse_remote_ips(output: &str) -> Vec<String> {
    for line in output.lines() {
        let Some(rest) = line.trim_start().strip_prefix("RemoteIP:") else {
            continue;
        };
        return rest
            .split(',')
            .map(|member| member.trim().to_string())
            .filter(|member| !member.is_empty())
            .collect();
    }
    Vec::new()
}

/// Only globally routable unicast peers are worth a firewall entry.
fn is_global_unicast(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        || octets[0] == 0
        || (octets[0] == 100 && octets[1] & 0b1100_0000 == 64) // CGNAT 100.64.0.0/10
        || (octets[0] == 198 && octets[1] & 0xfe == 18) // benchmarking 198.18.0.0/15
        || octets[0] >= 240) // reserved 240.0.0.0/4
}
