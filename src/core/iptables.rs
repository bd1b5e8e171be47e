//! iptables command adapter
//!
//! Single point of contact with the external packet-filter tool. Every
//! mutation is an isolated `iptables -t <table> ...` invocation; no caller
//! above this module constructs tool syntax except through
//! [`build_rule_args`].
//!
//! # Failure semantics
//!
//! Mutating calls either return a typed [`Error::Iptables`] (stderr is
//! classified into a small category set) or, for the explicitly
//! best-effort operations (existence checks, idempotent removes), a plain
//! `bool` success flag. Idempotent operations never fail on
//! already-exists / already-absent conditions; that property is what makes
//! bootstrap safe to re-run.
//!
//! # Mock mode
//!
//! With [`Iptables::mock`] the adapter applies every command to an
//! in-memory chain table instead of the system, logging the would-be
//! invocation at debug level. Existence checks, jump idempotence and
//! chain listings behave faithfully, so the bootstrap and apply protocols
//! can be exercised without privileges. The binary itself can also be
//! redirected with `REWALL_IPTABLES_COMMAND` for script-based fakes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::error::{Error, IptablesErrorKind, IptablesErrorPattern, Result};
use crate::core::model::{Action, Protocol, Rule, Table};
use crate::validators;

/// Operation selector for [`build_rule_args`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    /// `-A`: append to the end of the chain
    Append,
    /// `-D`: delete by exact specification match
    Delete,
}

impl RuleOp {
    const fn flag(self) -> &'static str {
        match self {
            RuleOp::Append => "-A",
            RuleOp::Delete => "-D",
        }
    }
}

/// Translates a rule's fields into iptables arguments, targeting `chain`.
///
/// Pure function: the only caller-visible contract of the adapter's
/// command syntax. `comment` overrides the rule's own comment when given
/// (apply uses this to tag live rules with the rule id).
///
/// Target-specific trailing parameters are emitted only when the action
/// matches: `--to-destination` for DNAT, `--to-source` for SNAT,
/// `--to-ports` for REDIRECT/MASQUERADE, `--log-prefix`/`--log-level` for
/// LOG, `--reject-with` for REJECT. Port matches use multiport syntax for
/// comma lists and `--dport` otherwise, and only for TCP/UDP.
pub fn build_rule_args(chain: &str, rule: &Rule, comment: Option<&str>, op: RuleOp) -> Vec<String> {
    let mut args: Vec<String> = vec![op.flag().to_string(), chain.to_string()];

    if let Some(protocol) = rule.protocol {
        args.push("-p".into());
        args.push(protocol.as_str().into());
    }

    if let Some(source) = rule.source {
        args.push("-s".into());
        args.push(source.to_string());
    }

    if let Some(destination) = rule.destination {
        args.push("-d".into());
        args.push(destination.to_string());
    }

    if let Some(ref iface) = rule.in_interface {
        args.push("-i".into());
        args.push(iface.clone());
    }

    if let Some(ref iface) = rule.out_interface {
        args.push("-o".into());
        args.push(iface.clone());
    }

    if let Some(ref state) = rule.state {
        args.push("-m".into());
        args.push("state".into());
        args.push("--state".into());
        args.push(state.clone());
    }

    if let Some(ref port) = rule.port {
        if rule.protocol.is_some_and(Protocol::supports_ports) {
            if port.contains(',') {
                args.push("-m".into());
                args.push("multiport".into());
                args.push("--dports".into());
                args.push(port.clone());
            } else {
                args.push("--dport".into());
                args.push(port.clone());
            }
        }
    }

    if let Some(ref rate) = rule.limit_rate {
        args.push("-m".into());
        args.push("limit".into());
        args.push("--limit".into());
        args.push(rate.clone());
        if let Some(burst) = rule.limit_burst {
            args.push("--limit-burst".into());
            args.push(burst.to_string());
        }
    }

    let comment = comment.or(rule.comment.as_deref());
    if let Some(comment) = comment {
        let safe = validators::sanitize_comment(comment);
        if !safe.is_empty() {
            args.push("-m".into());
            args.push("comment".into());
            args.push("--comment".into());
            args.push(safe);
        }
    }

    args.push("-j".into());
    args.push(rule.action.as_str().into());

    match rule.action {
        Action::Dnat => {
            if let Some(ref to) = rule.to_destination {
                args.push("--to-destination".into());
                args.push(to.clone());
            }
        }
        Action::Snat => {
            if let Some(ref to) = rule.to_source {
                args.push("--to-source".into());
                args.push(to.clone());
            }
        }
        Action::Redirect | Action::Masquerade => {
            if let Some(ref ports) = rule.to_ports {
                args.push("--to-ports".into());
                args.push(ports.clone());
            }
        }
        Action::Log => {
            if let Some(ref prefix) = rule.log_prefix {
                let safe = validators::sanitize_log_prefix(prefix);
                if !safe.is_empty() {
                    args.push("--log-prefix".into());
                    args.push(safe);
                }
            }
            if let Some(ref level) = rule.log_level {
                args.push("--log-level".into());
                args.push(level.clone());
            }
        }
        Action::Reject => {
            if let Some(ref reject_with) = rule.reject_with {
                args.push("--reject-with".into());
                args.push(reject_with.clone());
            }
        }
        _ => {}
    }

    args
}

/// In-memory stand-in for the kernel chain tables, used in mock mode.
#[derive(Debug, Default)]
struct MockState {
    /// (table, chain) → rule lines, in chain order
    chains: HashMap<(Table, String), Vec<String>>,
}

impl MockState {
    /// Seeds the built-in chains every table ships with.
    fn with_builtins() -> Self {
        let mut state = MockState::default();
        use strum::IntoEnumIterator;
        for table in Table::iter() {
            for hook in table.hooks() {
                state
                    .chains
                    .insert((table, hook.as_str().to_string()), Vec::new());
            }
        }
        state
    }

    /// Interprets one iptables invocation against the in-memory tables.
    /// Error strings mirror the real tool so the classifier sees the same
    /// text in both modes.
    fn execute(&mut self, table: Table, args: &[String]) -> std::result::Result<String, String> {
        let op = args.first().map(String::as_str).unwrap_or_default();
        let chain = args.get(1).cloned().unwrap_or_default();
        let key = (table, chain.clone());

        match op {
            "-L" => match self.chains.get(&key) {
                Some(rules) => Ok(format!("Chain {chain}\n{}", rules.join("\n"))),
                None => Err("iptables: No chain/target/match by that name.".to_string()),
            },
            "-N" => {
                if self.chains.contains_key(&key) {
                    return Err("iptables: Chain already exists.".to_string());
                }
                self.chains.insert(key, Vec::new());
                Ok(String::new())
            }
            "-F" => match self.chains.get_mut(&key) {
                Some(rules) => {
                    rules.clear();
                    Ok(String::new())
                }
                None => Err("iptables: No chain/target/match by that name.".to_string()),
            },
            "-X" => match self.chains.get(&key) {
                Some(rules) if rules.is_empty() => {
                    self.chains.remove(&key);
                    Ok(String::new())
                }
                Some(_) => Err("iptables: Directory not empty.".to_string()),
                None => Err("iptables: No chain/target/match by that name.".to_string()),
            },
            "-A" => match self.chains.get_mut(&key) {
                Some(rules) => {
                    rules.push(args[2..].join(" "));
                    Ok(String::new())
                }
                None => Err("iptables: No chain/target/match by that name.".to_string()),
            },
            "-I" => {
                // Optional 1-based position before the rule body
                let (position, body_start) = match args.get(2).and_then(|a| a.parse::<usize>().ok())
                {
                    Some(pos) => (pos, 3),
                    None => (1, 2),
                };
                match self.chains.get_mut(&key) {
                    Some(rules) => {
                        if position == 0 || position > rules.len() + 1 {
                            return Err("iptables: Index of insertion too big.".to_string());
                        }
                        rules.insert(position - 1, args[body_start..].join(" "));
                        Ok(String::new())
                    }
                    None => Err("iptables: No chain/target/match by that name.".to_string()),
                }
            }
            "-D" => {
                let spec = args[2..].join(" ");
                match self.chains.get_mut(&key) {
                    Some(rules) => match rules.iter().position(|r| *r == spec) {
                        Some(idx) => {
                            rules.remove(idx);
                            Ok(String::new())
                        }
                        None => Err(
                            "iptables: Bad rule (does a matching rule exist in that chain?)."
                                .to_string(),
                        ),
                    },
                    None => Err("iptables: No chain/target/match by that name.".to_string()),
                }
            }
            other => Err(format!("iptables: unknown option \"{other}\"")),
        }
    }
}

enum Backend {
    /// Shell out to the real binary (or an env-provided substitute).
    System { binary: String },
    /// Log commands and apply them to the in-memory chain table.
    Mock(Mutex<MockState>),
}

/// The command adapter. Cheap to share behind the orchestrator; all
/// methods take `&self`.
pub struct Iptables {
    backend: Backend,
    save_command: Option<String>,
}

impl Iptables {
    /// Adapter that mutates live kernel state. The binary defaults to
    /// `iptables` and can be overridden with `REWALL_IPTABLES_COMMAND`
    /// (used by script-based test fakes).
    pub fn system(save_command: Option<String>) -> Self {
        let binary =
            std::env::var("REWALL_IPTABLES_COMMAND").unwrap_or_else(|_| "iptables".to_string());
        Self {
            backend: Backend::System { binary },
            save_command,
        }
    }

    /// Adapter for non-privileged and test contexts: nothing touches the
    /// system.
    pub fn mock() -> Self {
        Self {
            backend: Backend::Mock(Mutex::new(MockState::with_builtins())),
            save_command: None,
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self.backend, Backend::Mock(_))
    }

    /// Executes one invocation. With `suppress` the failure is folded into
    /// the returned flag instead of an error; used for existence checks and
    /// best-effort removes.
    async fn run(&self, table: Table, args: &[String], suppress: bool) -> Result<(bool, String)> {
        match &self.backend {
            Backend::Mock(state) => {
                debug!("[mock] iptables -t {} {}", table, args.join(" "));
                let outcome = state
                    .lock()
                    .map_err(|e| Error::Internal(format!("mock state poisoned: {e}")))?
                    .execute(table, args);
                match outcome {
                    Ok(output) => Ok((true, output)),
                    Err(stderr) if suppress => Ok((false, stderr)),
                    Err(stderr) => {
                        let (kind, message) = IptablesErrorPattern::classify(&stderr);
                        Err(Error::Iptables {
                            kind,
                            message,
                            stderr: Some(stderr),
                            exit_code: Some(1),
                        })
                    }
                }
            }
            Backend::System { binary } => {
                let output = Command::new(binary)
                    .arg("-t")
                    .arg(table.as_str())
                    .args(args)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .output()
                    .await;

                let output = match output {
                    Ok(output) => output,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        if suppress {
                            return Ok((false, "iptables not found".to_string()));
                        }
                        return Err(Error::Iptables {
                            kind: IptablesErrorKind::ToolMissing,
                            message: "iptables binary not found on this system".to_string(),
                            stderr: None,
                            exit_code: None,
                        });
                    }
                    Err(e) => return Err(Error::Io(e)),
                };

                if output.status.success() {
                    Ok((true, String::from_utf8_lossy(&output.stdout).to_string()))
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                    if suppress {
                        return Ok((false, stderr));
                    }
                    warn!(
                        "iptables command failed: -t {} {}: {}",
                        table,
                        args.join(" "),
                        stderr.trim()
                    );
                    let (kind, message) = IptablesErrorPattern::classify(&stderr);
                    Err(Error::Iptables {
                        kind,
                        message,
                        stderr: Some(stderr),
                        exit_code: output.status.code(),
                    })
                }
            }
        }
    }

    fn str_args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    /// Checks whether a chain exists in the given table.
    pub async fn chain_exists(&self, chain: &str, table: Table) -> bool {
        self.run(table, &Self::str_args(&["-L", chain, "-n"]), true)
            .await
            .map(|(ok, _)| ok)
            .unwrap_or(false)
    }

    /// Creates a chain if it does not already exist. Never fails for
    /// "already exists".
    pub async fn create_chain(&self, chain: &str, table: Table) -> Result<()> {
        if self.chain_exists(chain, table).await {
            return Ok(());
        }
        self.run(table, &Self::str_args(&["-N", chain]), false).await?;
        info!("created chain {} in table {}", chain, table);
        Ok(())
    }

    /// Removes every rule from a chain.
    pub async fn flush_chain(&self, chain: &str, table: Table) -> Result<()> {
        self.run(table, &Self::str_args(&["-F", chain]), false).await?;
        debug!("flushed chain {} in table {}", chain, table);
        Ok(())
    }

    /// Deletes a chain, flushing it first (the tool refuses to delete a
    /// non-empty chain). Best-effort: returns whether the delete took.
    pub async fn delete_chain(&self, chain: &str, table: Table) -> bool {
        if let Err(e) = self.flush_chain(chain, table).await {
            debug!("flush before delete of {chain} failed: {e}");
        }
        self.run(table, &Self::str_args(&["-X", chain]), true)
            .await
            .map(|(ok, _)| ok)
            .unwrap_or(false)
    }

    /// Resets a chain to empty: creates it when absent, flushes it when
    /// present. Used to reset an owned chain before repopulation.
    pub async fn create_or_flush_chain(&self, chain: &str, table: Table) -> Result<()> {
        if self.chain_exists(chain, table).await {
            self.flush_chain(chain, table).await
        } else {
            self.create_chain(chain, table).await
        }
    }

    /// Lists the rules of a chain as raw text lines.
    pub async fn list_chain_rules(&self, chain: &str, table: Table) -> Result<Vec<String>> {
        let (_, output) = self
            .run(table, &Self::str_args(&["-L", chain, "-n"]), false)
            .await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Ensures a jump from `parent` to `target` exists.
    ///
    /// Idempotent: if the parent's listing already references the target,
    /// nothing is inserted and `Ok(false)` is returned. Otherwise the jump
    /// is inserted at `position` (1-based) when given, else appended, and
    /// `Ok(true)` is returned.
    pub async fn ensure_jump(
        &self,
        parent: &str,
        target: &str,
        table: Table,
        position: Option<usize>,
    ) -> Result<bool> {
        let (ok, listing) = self
            .run(table, &Self::str_args(&["-L", parent, "-n"]), true)
            .await?;
        if ok && listing.contains(target) {
            debug!("jump to {target} already present in {parent} ({table})");
            return Ok(false);
        }

        let args = match position {
            Some(pos) => vec![
                "-I".to_string(),
                parent.to_string(),
                pos.to_string(),
                "-j".to_string(),
                target.to_string(),
            ],
            None => vec![
                "-A".to_string(),
                parent.to_string(),
                "-j".to_string(),
                target.to_string(),
            ],
        };
        self.run(table, &args, false).await?;
        info!("added jump {parent} -> {target} in table {table}");
        Ok(true)
    }

    /// Removes the jump from `parent` to `target`. Best-effort: absent
    /// jumps are not an error.
    pub async fn remove_jump(&self, parent: &str, target: &str, table: Table) -> bool {
        let args = Self::str_args(&["-D", parent, "-j", target]);
        self.run(table, &args, true)
            .await
            .map(|(ok, _)| ok)
            .unwrap_or(false)
    }

    /// Appends a built rule into `chain`. `comment` overrides the rule's
    /// own comment (apply tags rules with their id here).
    pub async fn add_rule(
        &self,
        table: Table,
        chain: &str,
        rule: &Rule,
        comment: Option<&str>,
    ) -> Result<()> {
        let args = build_rule_args(chain, rule, comment, RuleOp::Append);
        self.run(table, &args, false).await?;
        Ok(())
    }

    /// Deletes a rule by exact argument match. The tool has no stable rule
    /// handle, so a spec that no longer matches a live rule fails silently;
    /// callers remove rules via full apply replay, this primitive exists
    /// for interface symmetry.
    pub async fn delete_rule_by_spec(
        &self,
        table: Table,
        chain: &str,
        rule: &Rule,
        comment: Option<&str>,
    ) -> bool {
        let args = build_rule_args(chain, rule, comment, RuleOp::Delete);
        self.run(table, &args, true)
            .await
            .map(|(ok, _)| ok)
            .unwrap_or(false)
    }

    /// Persists the live ruleset across reboots.
    ///
    /// Runs the configured save command when one is set; otherwise falls
    /// back to `iptables-save` redirected into the distribution's rules
    /// file. Triggered explicitly, never as part of apply.
    pub async fn save_rules(&self) -> Result<()> {
        if self.is_mock() {
            debug!("[mock] would save iptables rules");
            return Ok(());
        }

        if let Some(ref command) = self.save_command {
            let status = Command::new(command).status().await;
            match status {
                Ok(status) if status.success() => {
                    info!("iptables rules saved via {command}");
                    return Ok(());
                }
                Ok(status) => {
                    return Err(Error::Internal(format!(
                        "save command {command} exited with {status}"
                    )));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("save command {command} not found, falling back to iptables-save");
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let output = Command::new("iptables-save")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let (kind, message) = IptablesErrorPattern::classify(&stderr);
            return Err(Error::Iptables {
                kind,
                message,
                stderr: Some(stderr),
                exit_code: output.status.code(),
            });
        }
        tokio::fs::write("/etc/iptables/rules.v4", &output.stdout).await?;
        info!("iptables rules saved to /etc/iptables/rules.v4");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ChainHook, Protocol, RuleDraft};

    fn rule(action: Action) -> Rule {
        RuleDraft {
            table: Table::Filter,
            chain: ChainHook::Input,
            action,
            protocol: None,
            source: None,
            destination: None,
            port: None,
            in_interface: None,
            out_interface: None,
            state: None,
            limit_rate: None,
            limit_burst: None,
            to_destination: None,
            to_source: None,
            to_ports: None,
            log_prefix: None,
            log_level: None,
            reject_with: None,
            comment: None,
            enabled: true,
        }
        .into_rule(0)
    }

    #[test]
    fn test_build_args_minimal_accept() {
        let r = rule(Action::Accept);
        let args = build_rule_args("REWALL_INPUT", &r, None, RuleOp::Append);
        assert_eq!(args, vec!["-A", "REWALL_INPUT", "-j", "ACCEPT"]);
    }

    #[test]
    fn test_build_args_tcp_port_and_comment() {
        let mut r = rule(Action::Accept);
        r.protocol = Some(Protocol::Tcp);
        r.port = Some("22".to_string());
        let args = build_rule_args("REWALL_INPUT", &r, Some("ID_abc"), RuleOp::Append);
        assert_eq!(
            args,
            vec![
                "-A",
                "REWALL_INPUT",
                "-p",
                "tcp",
                "--dport",
                "22",
                "-m",
                "comment",
                "--comment",
                "ID_abc",
                "-j",
                "ACCEPT"
            ]
        );
    }

    #[test]
    fn test_build_args_multiport_for_comma_list() {
        let mut r = rule(Action::Accept);
        r.protocol = Some(Protocol::Udp);
        r.port = Some("53,123".to_string());
        let args = build_rule_args("REWALL_INPUT", &r, None, RuleOp::Append);
        let joined = args.join(" ");
        assert!(joined.contains("-m multiport --dports 53,123"));
        assert!(!joined.contains("--dport 53,123"));
    }

    #[test]
    fn test_build_args_port_ignored_without_port_protocol() {
        let mut r = rule(Action::Accept);
        r.protocol = Some(Protocol::Icmp);
        r.port = Some("22".to_string());
        let args = build_rule_args("REWALL_INPUT", &r, None, RuleOp::Append);
        assert!(!args.join(" ").contains("dport"));
    }

    #[test]
    fn test_build_args_limit_with_burst() {
        let mut r = rule(Action::Accept);
        r.limit_rate = Some("10/second".to_string());
        r.limit_burst = Some(20);
        let joined = build_rule_args("REWALL_INPUT", &r, None, RuleOp::Append).join(" ");
        assert!(joined.contains("-m limit --limit 10/second --limit-burst 20"));
    }

    #[test]
    fn test_build_args_dnat_target_params() {
        let mut r = rule(Action::Dnat);
        r.table = Table::Nat;
        r.chain = ChainHook::Prerouting;
        r.to_destination = Some("10.0.0.5:8080".to_string());
        // SNAT parameter must not leak onto a DNAT rule
        r.to_source = Some("1.2.3.4".to_string());
        let joined = build_rule_args("REWALL_PREROUTING", &r, None, RuleOp::Append).join(" ");
        assert!(joined.ends_with("-j DNAT --to-destination 10.0.0.5:8080"));
        assert!(!joined.contains("--to-source"));
    }

    #[test]
    fn test_build_args_log_prefix_sanitized() {
        let mut r = rule(Action::Log);
        r.log_prefix = Some("[FW] bad\"chars\nhere and far too long to fit".to_string());
        r.log_level = Some("4".to_string());
        let joined = build_rule_args("REWALL_INPUT", &r, None, RuleOp::Append).join(" ");
        assert!(joined.contains("--log-prefix"));
        assert!(joined.contains("--log-level 4"));
        assert!(!joined.contains('"'));
    }

    #[test]
    fn test_build_args_reject_with() {
        let mut r = rule(Action::Reject);
        r.reject_with = Some("icmp-port-unreachable".to_string());
        let joined = build_rule_args("REWALL_INPUT", &r, None, RuleOp::Append).join(" ");
        assert!(joined.ends_with("-j REJECT --reject-with icmp-port-unreachable"));
    }

    #[test]
    fn test_build_args_delete_mirrors_append() {
        let mut r = rule(Action::Accept);
        r.protocol = Some(Protocol::Tcp);
        r.port = Some("443".to_string());
        let add = build_rule_args("REWALL_INPUT", &r, Some("x"), RuleOp::Append);
        let del = build_rule_args("REWALL_INPUT", &r, Some("x"), RuleOp::Delete);
        assert_eq!(add[0], "-A");
        assert_eq!(del[0], "-D");
        assert_eq!(add[1..], del[1..]);
    }

    #[tokio::test]
    async fn test_mock_chain_lifecycle() {
        let ipt = Iptables::mock();

        assert!(!ipt.chain_exists("REWALL_INPUT", Table::Filter).await);
        ipt.create_chain("REWALL_INPUT", Table::Filter).await.unwrap();
        assert!(ipt.chain_exists("REWALL_INPUT", Table::Filter).await);

        // Creating again is a no-op, not an error
        ipt.create_chain("REWALL_INPUT", Table::Filter).await.unwrap();

        let r = rule(Action::Accept);
        ipt.add_rule(Table::Filter, "REWALL_INPUT", &r, None)
            .await
            .unwrap();
        ipt.flush_chain("REWALL_INPUT", Table::Filter).await.unwrap();
        assert!(ipt.delete_chain("REWALL_INPUT", Table::Filter).await);
        assert!(!ipt.chain_exists("REWALL_INPUT", Table::Filter).await);
    }

    #[tokio::test]
    async fn test_mock_builtin_chains_preexist() {
        let ipt = Iptables::mock();
        assert!(ipt.chain_exists("INPUT", Table::Filter).await);
        assert!(ipt.chain_exists("PREROUTING", Table::Nat).await);
        // raw has no FORWARD hook
        assert!(!ipt.chain_exists("FORWARD", Table::Raw).await);
    }

    #[tokio::test]
    async fn test_ensure_jump_is_idempotent() {
        let ipt = Iptables::mock();
        ipt.create_chain("REWALL_INPUT", Table::Filter).await.unwrap();

        let inserted = ipt
            .ensure_jump("INPUT", "REWALL_INPUT", Table::Filter, Some(1))
            .await
            .unwrap();
        assert!(inserted);

        let inserted_again = ipt
            .ensure_jump("INPUT", "REWALL_INPUT", Table::Filter, Some(1))
            .await
            .unwrap();
        assert!(!inserted_again);

        let listing = ipt.list_chain_rules("INPUT", Table::Filter).await.unwrap();
        let jumps = listing
            .iter()
            .filter(|l| l.contains("REWALL_INPUT"))
            .count();
        assert_eq!(jumps, 1);
    }

    #[tokio::test]
    async fn test_remove_jump_absent_is_not_an_error() {
        let ipt = Iptables::mock();
        assert!(!ipt.remove_jump("INPUT", "NO_SUCH_CHAIN", Table::Filter).await);
    }

    #[tokio::test]
    async fn test_delete_rule_by_spec_exact_match_only() {
        let ipt = Iptables::mock();
        ipt.create_chain("REWALL_INPUT", Table::Filter).await.unwrap();

        let mut r = rule(Action::Accept);
        r.protocol = Some(Protocol::Tcp);
        r.port = Some("22".to_string());
        ipt.add_rule(Table::Filter, "REWALL_INPUT", &r, None)
            .await
            .unwrap();

        // Different spec: silently fails
        let mut other = r.clone();
        other.port = Some("23".to_string());
        assert!(
            !ipt.delete_rule_by_spec(Table::Filter, "REWALL_INPUT", &other, None)
                .await
        );

        // Exact spec: removed
        assert!(
            ipt.delete_rule_by_spec(Table::Filter, "REWALL_INPUT", &r, None)
                .await
        );
    }

    #[tokio::test]
    async fn test_mock_flush_missing_chain_is_typed_error() {
        let ipt = Iptables::mock();
        let err = ipt.flush_chain("NOPE", Table::Filter).await.unwrap_err();
        match err {
            Error::Iptables { kind, .. } => {
                assert_eq!(kind, IptablesErrorKind::UnknownChainOrTarget);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
