//! Device and firewall backends for netd.
//!
//! [`IpBackend`] shells out to `ip` and `iptables`; arguments are built from
//! derived device names and pool addresses only. [`MemoryNetBackend`] keeps
//! the same bookkeeping in process and is used on development hosts and in
//! tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::NetdError;

/// Bound on a single `ip`/`iptables` invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Firewall rules installed for one lab, tagged with a comment so they can be
/// found again without parsing rule listings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabRules {
    pub bridge: String,
    pub subnet: String,
    pub pool_cidr: String,
    pub comment: String,
}

impl LabRules {
    /// `(table, chain, match spec)` for every rule, in install order.
    fn specs(&self) -> Vec<(&'static str, &'static str, Vec<String>)> {
        let comment = ["-m", "comment", "--comment", self.comment.as_str()];
        let mut masquerade: Vec<String> = ["-s", self.subnet.as_str(), "!", "-o", self.bridge.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        masquerade.extend(comment.iter().map(|s| s.to_string()));
        masquerade.extend(["-j".to_string(), "MASQUERADE".to_string()]);

        // Labs never reach one another, only the outside world.
        let mut isolate: Vec<String> = ["-i", self.bridge.as_str(), "-d", self.pool_cidr.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        isolate.extend(comment.iter().map(|s| s.to_string()));
        isolate.extend(["-j".to_string(), "DROP".to_string()]);

        vec![("nat", "POSTROUTING", masquerade), ("filter", "FORWARD", isolate)]
    }
}

#[async_trait]
pub trait NetBackend: Send + Sync + 'static {
    async fn link_exists(&self, name: &str) -> Result<bool, NetdError>;

    /// Create the bridge with the gateway address and bring it up. Tolerates
    /// pieces that already exist.
    async fn add_bridge(&self, bridge: &str, gateway_cidr: &str) -> Result<(), NetdError>;

    /// Create the TAP device and enslave it to `bridge`.
    async fn add_tap(&self, tap: &str, bridge: &str) -> Result<(), NetdError>;

    /// Remove a link. Succeeds when it is already gone.
    async fn delete_link(&self, name: &str) -> Result<(), NetdError>;

    async fn rules_present(&self, rules: &LabRules) -> Result<bool, NetdError>;

    async fn add_rules(&self, rules: &LabRules) -> Result<(), NetdError>;

    /// Remove the lab's rules. Succeeds when they are already gone.
    async fn remove_rules(&self, rules: &LabRules) -> Result<(), NetdError>;
}

// ---------------------------------------------------------------------------
// ip / iptables
// ---------------------------------------------------------------------------

pub struct IpBackend {
    ip_bin: PathBuf,
    iptables_bin: PathBuf,
    tap_user: Option<String>,
}

struct CommandOutput {
    success: bool,
    stderr: String,
}

impl IpBackend {
    pub fn new(ip_bin: PathBuf, iptables_bin: PathBuf, tap_user: Option<String>) -> Self {
        Self {
            ip_bin,
            iptables_bin,
            tap_user,
        }
    }

    async fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput, NetdError> {
        debug!(program = %program.display(), ?args, "running network command");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| NetdError::os(format!("{} timed out", program.display())))?
            .map_err(|e| NetdError::os(format!("spawn {}: {e}", program.display())))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run and require success, treating "already exists" as success.
    async fn run_tolerant(&self, program: &Path, args: &[&str]) -> Result<(), NetdError> {
        let out = self.run(program, args).await?;
        if out.success || out.stderr.contains("File exists") {
            return Ok(());
        }
        Err(NetdError::os(format!(
            "`{} {}` failed: {}",
            program.display(),
            args.join(" "),
            out.stderr
        )))
    }

    async fn iptables(
        &self,
        table: &str,
        action: &str,
        chain: &str,
        spec: &[String],
    ) -> Result<CommandOutput, NetdError> {
        let mut args: Vec<&str> = vec!["-w", "-t", table, action, chain];
        args.extend(spec.iter().map(String::as_str));
        self.run(&self.iptables_bin, &args).await
    }
}

#[async_trait]
impl NetBackend for IpBackend {
    async fn link_exists(&self, name: &str) -> Result<bool, NetdError> {
        let out = self.run(&self.ip_bin, &["link", "show", "dev", name]).await?;
        Ok(out.success)
    }

    async fn add_bridge(&self, bridge: &str, gateway_cidr: &str) -> Result<(), NetdError> {
        self.run_tolerant(&self.ip_bin, &["link", "add", "name", bridge, "type", "bridge"])
            .await?;
        self.run_tolerant(&self.ip_bin, &["addr", "add", gateway_cidr, "dev", bridge])
            .await?;
        self.run_tolerant(&self.ip_bin, &["link", "set", "dev", bridge, "up"])
            .await
    }

    async fn add_tap(&self, tap: &str, bridge: &str) -> Result<(), NetdError> {
        let mut args = vec!["tuntap", "add", "dev", tap, "mode", "tap"];
        if let Some(user) = &self.tap_user {
            args.extend(["user", user.as_str()]);
        }
        self.run_tolerant(&self.ip_bin, &args).await?;
        self.run_tolerant(&self.ip_bin, &["link", "set", "dev", tap, "master", bridge])
            .await?;
        self.run_tolerant(&self.ip_bin, &["link", "set", "dev", tap, "up"])
            .await
    }

    async fn delete_link(&self, name: &str) -> Result<(), NetdError> {
        if !self.link_exists(name).await? {
            return Ok(());
        }
        let out = self.run(&self.ip_bin, &["link", "delete", "dev", name]).await?;
        if out.success || out.stderr.contains("Cannot find device") {
            Ok(())
        } else {
            Err(NetdError::os(format!("delete {name}: {}", out.stderr)))
        }
    }

    async fn rules_present(&self, rules: &LabRules) -> Result<bool, NetdError> {
        for (table, chain, spec) in rules.specs() {
            if !self.iptables(table, "-C", chain, &spec).await?.success {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn add_rules(&self, rules: &LabRules) -> Result<(), NetdError> {
        for (table, chain, spec) in rules.specs() {
            if self.iptables(table, "-C", chain, &spec).await?.success {
                continue;
            }
            // FORWARD drops must precede any distro-level accept rules.
            let action = if chain == "FORWARD" { "-I" } else { "-A" };
            let out = self.iptables(table, action, chain, &spec).await?;
            if !out.success {
                return Err(NetdError::os(format!("iptables {table}/{chain}: {}", out.stderr)));
            }
        }
        Ok(())
    }

    async fn remove_rules(&self, rules: &LabRules) -> Result<(), NetdError> {
        for (table, chain, spec) in rules.specs() {
            // Delete every duplicate, stop once the rule no longer matches.
            while self.iptables(table, "-C", chain, &spec).await?.success {
                let out = self.iptables(table, "-D", chain, &spec).await?;
                if !out.success {
                    return Err(NetdError::os(format!("iptables -D {table}/{chain}: {}", out.stderr)));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryNetBackend {
    links: Mutex<HashSet<String>>,
    rules: Mutex<HashSet<LabRules>>,
    fail_creates: AtomicBool,
}

impl MemoryNetBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent create call fail with `os_error`.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn links(&self) -> Vec<String> {
        let mut links: Vec<String> = self
            .links
            .lock()
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default();
        links.sort();
        links
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn check_fail(&self, what: &str) -> Result<(), NetdError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(NetdError::os(format!("simulated failure creating {what}")));
        }
        Ok(())
    }

    fn with_links<T>(&self, f: impl FnOnce(&mut HashSet<String>) -> T) -> Result<T, NetdError> {
        let mut links = self
            .links
            .lock()
            .map_err(|_| NetdError::os("link table poisoned"))?;
        Ok(f(&mut links))
    }

    fn with_rules<T>(&self, f: impl FnOnce(&mut HashSet<LabRules>) -> T) -> Result<T, NetdError> {
        let mut rules = self
            .rules
            .lock()
            .map_err(|_| NetdError::os("rule table poisoned"))?;
        Ok(f(&mut rules))
    }
}

#[async_trait]
impl NetBackend for MemoryNetBackend {
    async fn link_exists(&self, name: &str) -> Result<bool, NetdError> {
        self.with_links(|links| links.contains(name))
    }

    async fn add_bridge(&self, bridge: &str, _gateway_cidr: &str) -> Result<(), NetdError> {
        self.check_fail(bridge)?;
        self.with_links(|links| {
            links.insert(bridge.to_string());
        })
    }

    async fn add_tap(&self, tap: &str, bridge: &str) -> Result<(), NetdError> {
        self.check_fail(tap)?;
        self.with_links(|links| {
            if links.contains(bridge) {
                links.insert(tap.to_string());
                Ok(())
            } else {
                Err(NetdError::os(format!("bridge {bridge} does not exist")))
            }
        })?
    }

    async fn delete_link(&self, name: &str) -> Result<(), NetdError> {
        self.with_links(|links| {
            links.remove(name);
        })
    }

    async fn rules_present(&self, rules: &LabRules) -> Result<bool, NetdError> {
        self.with_rules(|r| r.contains(rules))
    }

    async fn add_rules(&self, rules: &LabRules) -> Result<(), NetdError> {
        self.check_fail("rules")?;
        self.with_rules(|r| {
            r.insert(rules.clone());
        })
    }

    async fn remove_rules(&self, rules: &LabRules) -> Result<(), NetdError> {
        self.with_rules(|r| {
            r.remove(rules);
        })
    }
}
