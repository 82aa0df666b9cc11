//! Firewall effectors: iptables and an in-memory block list.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::logging::structured::LogContext;
use crate::{log_debug, log_info};

use super::effectors::{BlockAction, FirewallAdapter, FirewallRule, Protocol};

/// Chain holding every rule this control plane installs.
pub const BLOCK_CHAIN: &str = "PANDORA_BLOCK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an external program. Tests substitute a scripted runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> anyhow::Result<CommandOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> anyhow::Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", program))?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpBlock {
    action: BlockAction,
    expires_at: DateTime<Utc>,
}

fn expiry(clock: &dyn Clock, duration: Duration) -> DateTime<Utc> {
    let duration =
        chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500));
    clock.now() + duration
}

/// iptables-backed firewall. All rules live in [`BLOCK_CHAIN`], jumped to
/// from `INPUT`.
pub struct IptablesFirewall {
    runner: Arc<dyn CommandRunner>,
    program: String,
    clock: Arc<dyn Clock>,
    ip_blocks: Mutex<BTreeMap<IpAddr, IpBlock>>,
    port_blocks: Mutex<BTreeMap<(u16, Protocol), DateTime<Utc>>>,
    chain_ready: AtomicBool,
}

impl IptablesFirewall {
    pub fn new(runner: Arc<dyn CommandRunner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            runner,
            program: "iptables".to_string(),
            clock,
            ip_blocks: Mutex::new(BTreeMap::new()),
            port_blocks: Mutex::new(BTreeMap::new()),
            chain_ready: AtomicBool::new(false),
        }
    }

    async fn iptables(&self, args: &[&str]) -> anyhow::Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        log_debug!(
            LogContext::for_task("firewall"),
            "IPTABLES_EXEC",
            args = args.join(" ")
        );
        self.runner.run(&self.program, &args).await
    }

    async fn iptables_ok(&self, args: &[&str]) -> anyhow::Result<()> {
        let output = self.iptables(args).await?;
        if !output.success {
            bail!("iptables {} failed: {}", args.join(" "), output.stderr.trim());
        }
        Ok(())
    }

    /// Create the chain and the `INPUT` jump if either is missing.
    async fn ensure_chain(&self) -> anyhow::Result<()> {
        if self.chain_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.iptables(&["-L", BLOCK_CHAIN, "-n"]).await?.success {
            self.iptables_ok(&["-N", BLOCK_CHAIN]).await?;
        }
        if !self.iptables(&["-C", "INPUT", "-j", BLOCK_CHAIN]).await?.success {
            self.iptables_ok(&["-I", "INPUT", "-j", BLOCK_CHAIN]).await?;
        }
        self.chain_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove blocks whose duration has elapsed. Returns how many were lifted.
    pub async fn release_expired(&self) -> anyhow::Result<usize> {
        let now = self.clock.now();
        let due_ips: Vec<IpAddr> = self
            .ip_blocks
            .lock()
            .iter()
            .filter(|(_, block)| block.expires_at <= now)
            .map(|(ip, _)| *ip)
            .collect();
        let due_ports: Vec<(u16, Protocol)> = self
            .port_blocks
            .lock()
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(key, _)| *key)
            .collect();

        for ip in &due_ips {
            self.unblock_ip(*ip, "block expired").await?;
        }
        for (port, protocol) in &due_ports {
            let port_arg = port.to_string();
            self.iptables_ok(&[
                "-D",
                BLOCK_CHAIN,
                "-p",
                protocol.as_str(),
                "--dport",
                &port_arg,
                "-j",
                "DROP",
            ])
            .await?;
            self.port_blocks.lock().remove(&(*port, *protocol));
        }
        Ok(due_ips.len() + due_ports.len())
    }
}

#[async_trait]
impl FirewallAdapter for IptablesFirewall {
    async fn block_ip(
        &self,
        ip: IpAddr,
        duration: Duration,
        action: BlockAction,
    ) -> anyhow::Result<()> {
        self.ensure_chain().await?;
        let source = ip.to_string();
        let expires_at = expiry(self.clock.as_ref(), duration);
        let existing = self.ip_blocks.lock().get(&ip).copied();
        if existing.map_or(true, |block| block.action != action) {
            if let Some(block) = existing {
                self.iptables_ok(&["-D", BLOCK_CHAIN, "-s", &source, "-j", block.action.target()])
                    .await?;
            }
            self.iptables_ok(&["-A", BLOCK_CHAIN, "-s", &source, "-j", action.target()])
                .await?;
        }
        self.ip_blocks
            .lock()
            .insert(ip, IpBlock { action, expires_at });
        log_info!(
            LogContext::for_task("firewall"),
            "IP_BLOCKED",
            ip = source,
            action = action.target(),
            duration_secs = duration.as_secs()
        );
        Ok(())
    }

    async fn unblock_ip(&self, ip: IpAddr, reason: &str) -> anyhow::Result<()> {
        let Some(block) = self.ip_blocks.lock().get(&ip).copied() else {
            return Ok(());
        };
        let source = ip.to_string();
        self.iptables_ok(&["-D", BLOCK_CHAIN, "-s", &source, "-j", block.action.target()])
            .await?;
        self.ip_blocks.lock().remove(&ip);
        log_info!(
            LogContext::for_task("firewall"),
            "IP_UNBLOCKED",
            ip = source,
            reason = reason
        );
        Ok(())
    }

    async fn block_port(
        &self,
        port: u16,
        protocol: Protocol,
        duration: Duration,
    ) -> anyhow::Result<()> {
        self.ensure_chain().await?;
        let expires_at = expiry(self.clock.as_ref(), duration);
        let known = self.port_blocks.lock().contains_key(&(port, protocol));
        if !known {
            let port_arg = port.to_string();
            self.iptables_ok(&[
                "-A",
                BLOCK_CHAIN,
                "-p",
                protocol.as_str(),
                "--dport",
                &port_arg,
                "-j",
                "DROP",
            ])
            .await?;
        }
        self.port_blocks.lock().insert((port, protocol), expires_at);
        log_info!(
            LogContext::for_task("firewall"),
            "PORT_BLOCKED",
            port = port,
            protocol = protocol.as_str()
        );
        Ok(())
    }

    async fn update_firewall(&self, rules: &[FirewallRule]) -> anyhow::Result<()> {
        for rule in rules {
            match rule {
                FirewallRule::BlockIp { ip, action } => {
                    self.block_ip(*ip, Duration::from_secs(86_400), *action).await?
                }
                FirewallRule::BlockPort { port, protocol } => {
                    self.block_port(*port, *protocol, Duration::from_secs(86_400))
                        .await?
                }
            }
        }
        Ok(())
    }

    async fn list_rules(&self) -> anyhow::Result<Vec<String>> {
        let output = self.iptables(&["-S", BLOCK_CHAIN]).await?;
        if !output.success {
            bail!("iptables -S {} failed: {}", BLOCK_CHAIN, output.stderr.trim());
        }
        Ok(output
            .stdout
            .lines()
            .filter(|line| line.starts_with("-A "))
            .map(str::to_string)
            .collect())
    }

    /// Sources blocked in the live chain.
    async fn get_block_list(&self) -> anyhow::Result<Vec<IpAddr>> {
        let mut ips: Vec<IpAddr> = self
            .list_rules()
            .await?
            .iter()
            .filter_map(|line| parse_source(line))
            .collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

/// `-A PANDORA_BLOCK -s 1.2.3.4/32 -j DROP` → `1.2.3.4`.
fn parse_source(rule: &str) -> Option<IpAddr> {
    let mut parts = rule.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "-s" {
            let source = parts.next()?;
            let addr = source.split('/').next()?;
            return addr.parse().ok();
        }
    }
    None
}

/// Block list kept in memory, with failure injection.
pub struct InMemoryFirewall {
    clock: Arc<dyn Clock>,
    ip_blocks: Mutex<BTreeMap<IpAddr, IpBlock>>,
    port_blocks: Mutex<BTreeMap<(u16, Protocol), DateTime<Utc>>>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl InMemoryFirewall {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            ip_blocks: Mutex::new(BTreeMap::new()),
            port_blocks: Mutex::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Make every mutating call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Mutating calls received, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn blocked_ports(&self) -> Vec<(u16, Protocol)> {
        let now = self.clock.now();
        self.port_blocks
            .lock()
            .iter()
            .filter(|(_, expires_at)| **expires_at > now)
            .map(|(key, _)| *key)
            .collect()
    }

    fn admit(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("firewall unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl FirewallAdapter for InMemoryFirewall {
    async fn block_ip(
        &self,
        ip: IpAddr,
        duration: Duration,
        action: BlockAction,
    ) -> anyhow::Result<()> {
        self.admit()?;
        let expires_at = expiry(self.clock.as_ref(), duration);
        self.ip_blocks
            .lock()
            .insert(ip, IpBlock { action, expires_at });
        Ok(())
    }

    async fn unblock_ip(&self, ip: IpAddr, _reason: &str) -> anyhow::Result<()> {
        self.admit()?;
        self.ip_blocks.lock().remove(&ip);
        Ok(())
    }

    async fn block_port(
        &self,
        port: u16,
        protocol: Protocol,
        duration: Duration,
    ) -> anyhow::Result<()> {
        self.admit()?;
        let expires_at = expiry(self.clock.as_ref(), duration);
        self.port_blocks.lock().insert((port, protocol), expires_at);
        Ok(())
    }

    async fn update_firewall(&self, rules: &[FirewallRule]) -> anyhow::Result<()> {
        self.admit()?;
        let expires_at = expiry(self.clock.as_ref(), Duration::from_secs(86_400));
        for rule in rules {
            match rule {
                FirewallRule::BlockIp { ip, action } => {
                    self.ip_blocks.lock().insert(
                        *ip,
                        IpBlock {
                            action: *action,
                            expires_at,
                        },
                    );
                }
                FirewallRule::BlockPort { port, protocol } => {
                    self.port_blocks
                        .lock()
                        .insert((*port, *protocol), expires_at);
                }
            }
        }
        Ok(())
    }

    async fn list_rules(&self) -> anyhow::Result<Vec<String>> {
        let now = self.clock.now();
        let mut rules: Vec<String> = self
            .ip_blocks
            .lock()
            .iter()
            .filter(|(_, block)| block.expires_at > now)
            .map(|(ip, block)| format!("-A {} -s {} -j {}", BLOCK_CHAIN, ip, block.action.target()))
            .collect();
        rules.extend(self.blocked_ports().into_iter().map(|(port, protocol)| {
            format!(
                "-A {} -p {} --dport {} -j DROP",
                BLOCK_CHAIN,
                protocol.as_str(),
                port
            )
        }));
        Ok(rules)
    }

    /// Sources whose block has not yet expired.
    async fn get_block_list(&self) -> anyhow::Result<Vec<IpAddr>> {
        let now = self.clock.now();
        Ok(self
            .ip_blocks
            .lock()
            .iter()
            .filter(|(_, block)| block.expires_at > now)
            .map(|(ip, _)| *ip)
            .collect())
    }
}
