//! Firewall policy data model
//!
//! This module defines the two persisted entities of the engine:
//!
//! - [`Rule`]: a single user-authored filtering directive, routed into an
//!   engine-owned chain based on its table and logical parent chain
//! - [`ExtensionChain`]: a chain registered by an external extension,
//!   jumped to from a parent chain in priority order
//!
//! plus the enums constraining them. Each iptables table permits a fixed
//! set of parent chains and a fixed set of actions; [`RuleDraft::validate`]
//! rejects combinations outside those sets before anything touches the
//! live firewall.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{Error, Result};
use crate::validators;

/// Default priority for newly registered extension chains; lower values
/// are evaluated earlier.
pub const DEFAULT_EXTENSION_PRIORITY: i64 = 50;

/// iptables rule namespace
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    #[default]
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "mangle")]
    Mangle,
    #[strum(serialize = "raw")]
    Raw,
}

impl Table {
    /// Returns the table name as passed to `iptables -t`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
        }
    }

    /// Logical parent chains this table exposes.
    pub const fn hooks(self) -> &'static [ChainHook] {
        match self {
            Table::Filter => &[ChainHook::Input, ChainHook::Output, ChainHook::Forward],
            Table::Nat => &[ChainHook::Prerouting, ChainHook::Output, ChainHook::Postrouting],
            Table::Mangle => &[
                ChainHook::Prerouting,
                ChainHook::Input,
                ChainHook::Forward,
                ChainHook::Output,
                ChainHook::Postrouting,
            ],
            Table::Raw => &[ChainHook::Prerouting, ChainHook::Output],
        }
    }

    /// Actions this table accepts.
    pub const fn actions(self) -> &'static [Action] {
        match self {
            Table::Filter => &[
                Action::Accept,
                Action::Drop,
                Action::Reject,
                Action::Log,
                Action::Return,
            ],
            Table::Nat => &[
                Action::Snat,
                Action::Dnat,
                Action::Masquerade,
                Action::Redirect,
                Action::Accept,
                Action::Return,
            ],
            Table::Mangle => &[
                Action::Mark,
                Action::Tos,
                Action::Ttl,
                Action::Accept,
                Action::Return,
            ],
            Table::Raw => &[Action::Notrack, Action::Accept, Action::Return],
        }
    }

    pub fn permits_hook(self, hook: ChainHook) -> bool {
        self.hooks().contains(&hook)
    }

    pub fn permits_action(self, action: Action) -> bool {
        self.actions().contains(&action)
    }
}

/// Standard netfilter hook point within a table (logical parent chain)
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChainHook {
    #[strum(serialize = "INPUT")]
    Input,
    #[strum(serialize = "OUTPUT")]
    Output,
    #[strum(serialize = "FORWARD")]
    Forward,
    #[strum(serialize = "PREROUTING")]
    Prerouting,
    #[strum(serialize = "POSTROUTING")]
    Postrouting,
}

impl ChainHook {
    /// Returns the built-in chain name as iptables knows it.
    pub const fn as_str(self) -> &'static str {
        match self {
            ChainHook::Input => "INPUT",
            ChainHook::Output => "OUTPUT",
            ChainHook::Forward => "FORWARD",
            ChainHook::Prerouting => "PREROUTING",
            ChainHook::Postrouting => "POSTROUTING",
        }
    }
}

/// Rule target (`-j` argument)
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
    #[strum(serialize = "REJECT")]
    Reject,
    #[strum(serialize = "LOG")]
    Log,
    #[strum(serialize = "RETURN")]
    Return,
    #[strum(serialize = "SNAT")]
    Snat,
    #[strum(serialize = "DNAT")]
    Dnat,
    #[strum(serialize = "MASQUERADE")]
    Masquerade,
    #[strum(serialize = "REDIRECT")]
    Redirect,
    #[strum(serialize = "MARK")]
    Mark,
    #[strum(serialize = "TOS")]
    Tos,
    #[strum(serialize = "TTL")]
    Ttl,
    #[strum(serialize = "NOTRACK")]
    Notrack,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
            Action::Reject => "REJECT",
            Action::Log => "LOG",
            Action::Return => "RETURN",
            Action::Snat => "SNAT",
            Action::Dnat => "DNAT",
            Action::Masquerade => "MASQUERADE",
            Action::Redirect => "REDIRECT",
            Action::Mark => "MARK",
            Action::Tos => "TOS",
            Action::Ttl => "TTL",
            Action::Notrack => "NOTRACK",
        }
    }
}

/// Match protocol (`-p` argument)
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "icmp")]
    Icmp,
    #[strum(serialize = "all")]
    All,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "all",
        }
    }

    /// Only TCP and UDP carry destination ports.
    pub const fn supports_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

/// One user-authored filtering directive.
///
/// `order` is dense and zero-based within the rule's (table, chain) group;
/// lower orders apply first. The orchestrator maintains that invariant on
/// every create/delete/reorder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: Uuid,
    pub table: Table,
    pub chain: ChainHook,
    pub action: Action,

    pub protocol: Option<Protocol>,
    /// Source IP or CIDR
    pub source: Option<IpNetwork>,
    /// Destination IP or CIDR
    pub destination: Option<IpNetwork>,
    /// Destination port: single (`"80"`), range (`"80:443"`) or
    /// comma-separated list (`"80,443,8080"`)
    pub port: Option<String>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    /// Connection-state set, e.g. `"NEW,ESTABLISHED"`
    pub state: Option<String>,

    /// Rate limit, e.g. `"10/second"`, `"100/minute"`
    pub limit_rate: Option<String>,
    pub limit_burst: Option<u32>,

    /// DNAT target address[:port]
    pub to_destination: Option<String>,
    /// SNAT source address
    pub to_source: Option<String>,
    /// REDIRECT/MASQUERADE port (range)
    pub to_ports: Option<String>,
    pub log_prefix: Option<String>,
    pub log_level: Option<String>,
    /// REJECT type, e.g. `icmp-port-unreachable`
    pub reject_with: Option<String>,

    pub comment: Option<String>,
    pub order: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a rule; `order` and timestamps are assigned by the
/// engine. Field names match [`Rule`] so exported rules import unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    #[serde(default)]
    pub table: Table,
    pub chain: ChainHook,
    pub action: Action,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub source: Option<IpNetwork>,
    #[serde(default)]
    pub destination: Option<IpNetwork>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub in_interface: Option<String>,
    #[serde(default)]
    pub out_interface: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub limit_rate: Option<String>,
    #[serde(default)]
    pub limit_burst: Option<u32>,
    #[serde(default)]
    pub to_destination: Option<String>,
    #[serde(default)]
    pub to_source: Option<String>,
    #[serde(default)]
    pub to_ports: Option<String>,
    #[serde(default)]
    pub log_prefix: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub reject_with: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RuleDraft {
    /// Validates the draft against the permitted sets for its table plus
    /// field formats, before any external call is made.
    pub fn validate(&self) -> Result<()> {
        if !self.table.permits_hook(self.chain) {
            return Err(Error::validation(
                "chain",
                format!(
                    "chain {} is not valid for table {} (valid: {})",
                    self.chain,
                    self.table,
                    join_hooks(self.table.hooks())
                ),
            ));
        }

        if !self.table.permits_action(self.action) {
            return Err(Error::validation(
                "action",
                format!(
                    "action {} is not valid for table {} (valid: {})",
                    self.action,
                    self.table,
                    join_actions(self.table.actions())
                ),
            ));
        }

        if let Some(ref port) = self.port {
            validators::validate_port_spec(port).map_err(|e| Error::validation("port", e))?;
        }

        if let Some(ref rate) = self.limit_rate {
            validators::validate_rate_spec(rate).map_err(|e| Error::validation("limit_rate", e))?;
        }

        if let Some(ref iface) = self.in_interface {
            validators::validate_interface(iface)
                .map_err(|e| Error::validation("in_interface", e))?;
        }

        if let Some(ref iface) = self.out_interface {
            validators::validate_interface(iface)
                .map_err(|e| Error::validation("out_interface", e))?;
        }

        if let Some(ref state) = self.state {
            validators::validate_state_set(state).map_err(|e| Error::validation("state", e))?;
        }

        Ok(())
    }

    /// Materializes the draft into a [`Rule`] at the given position.
    pub fn into_rule(self, order: i64) -> Rule {
        let now = Utc::now();
        Rule {
            id: Uuid::new_v4(),
            table: self.table,
            chain: self.chain,
            action: self.action,
            protocol: self.protocol,
            source: self.source,
            destination: self.destination,
            port: self.port,
            in_interface: self.in_interface,
            out_interface: self.out_interface,
            state: self.state,
            limit_rate: self.limit_rate,
            limit_burst: self.limit_burst,
            to_destination: self.to_destination,
            to_source: self.to_source,
            to_ports: self.to_ports,
            log_prefix: self.log_prefix,
            log_level: self.log_level,
            reject_with: self.reject_with,
            comment: self.comment,
            order,
            enabled: self.enabled,
            created_at: now,
            updated_at: now,
        }
    }
}

impl From<&Rule> for RuleDraft {
    /// Re-validation view of a stored rule (used after patch merges).
    fn from(rule: &Rule) -> Self {
        RuleDraft {
            table: rule.table,
            chain: rule.chain,
            action: rule.action,
            protocol: rule.protocol,
            source: rule.source,
            destination: rule.destination,
            port: rule.port.clone(),
            in_interface: rule.in_interface.clone(),
            out_interface: rule.out_interface.clone(),
            state: rule.state.clone(),
            limit_rate: rule.limit_rate.clone(),
            limit_burst: rule.limit_burst,
            to_destination: rule.to_destination.clone(),
            to_source: rule.to_source.clone(),
            to_ports: rule.to_ports.clone(),
            log_prefix: rule.log_prefix.clone(),
            log_level: rule.log_level.clone(),
            reject_with: rule.reject_with.clone(),
            comment: rule.comment.clone(),
            enabled: rule.enabled,
        }
    }
}

/// Partial update for an existing rule. `None` means "leave unchanged",
/// matching the PATCH semantics of the HTTP surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    #[serde(default)]
    pub table: Option<Table>,
    #[serde(default)]
    pub chain: Option<ChainHook>,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub source: Option<IpNetwork>,
    #[serde(default)]
    pub destination: Option<IpNetwork>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub in_interface: Option<String>,
    #[serde(default)]
    pub out_interface: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub limit_rate: Option<String>,
    #[serde(default)]
    pub limit_burst: Option<u32>,
    #[serde(default)]
    pub to_destination: Option<String>,
    #[serde(default)]
    pub to_source: Option<String>,
    #[serde(default)]
    pub to_ports: Option<String>,
    #[serde(default)]
    pub log_prefix: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub reject_with: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl RulePatch {
    pub fn is_empty(&self) -> bool {
        self.table.is_none()
            && self.chain.is_none()
            && self.action.is_none()
            && self.protocol.is_none()
            && self.source.is_none()
            && self.destination.is_none()
            && self.port.is_none()
            && self.in_interface.is_none()
            && self.out_interface.is_none()
            && self.state.is_none()
            && self.limit_rate.is_none()
            && self.limit_burst.is_none()
            && self.to_destination.is_none()
            && self.to_source.is_none()
            && self.to_ports.is_none()
            && self.log_prefix.is_none()
            && self.log_level.is_none()
            && self.reject_with.is_none()
            && self.comment.is_none()
            && self.enabled.is_none()
    }

    /// Merges the provided fields into `rule`, bumping `updated_at`.
    pub fn apply_to(&self, rule: &mut Rule) {
        if let Some(table) = self.table {
            rule.table = table;
        }
        if let Some(chain) = self.chain {
            rule.chain = chain;
        }
        if let Some(action) = self.action {
            rule.action = action;
        }
        if let Some(protocol) = self.protocol {
            rule.protocol = Some(protocol);
        }
        if let Some(source) = self.source {
            rule.source = Some(source);
        }
        if let Some(destination) = self.destination {
            rule.destination = Some(destination);
        }
        if let Some(ref port) = self.port {
            rule.port = Some(port.clone());
        }
        if let Some(ref iface) = self.in_interface {
            rule.in_interface = Some(iface.clone());
        }
        if let Some(ref iface) = self.out_interface {
            rule.out_interface = Some(iface.clone());
        }
        if let Some(ref state) = self.state {
            rule.state = Some(state.clone());
        }
        if let Some(ref rate) = self.limit_rate {
            rule.limit_rate = Some(rate.clone());
        }
        if let Some(burst) = self.limit_burst {
            rule.limit_burst = Some(burst);
        }
        if let Some(ref v) = self.to_destination {
            rule.to_destination = Some(v.clone());
        }
        if let Some(ref v) = self.to_source {
            rule.to_source = Some(v.clone());
        }
        if let Some(ref v) = self.to_ports {
            rule.to_ports = Some(v.clone());
        }
        if let Some(ref v) = self.log_prefix {
            rule.log_prefix = Some(v.clone());
        }
        if let Some(ref v) = self.log_level {
            rule.log_level = Some(v.clone());
        }
        if let Some(ref v) = self.reject_with {
            rule.reject_with = Some(v.clone());
        }
        if let Some(ref v) = self.comment {
            rule.comment = Some(v.clone());
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        rule.updated_at = Utc::now();
    }
}

/// A chain registered by an external extension.
///
/// The chain name is globally unique; many extension chains may hang off
/// the same (parent, table) pair, ordered by ascending priority. The
/// engine-owned chain for that pair always evaluates first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtensionChain {
    pub id: Uuid,
    pub extension_id: String,
    pub chain_name: String,
    pub parent_chain: ChainHook,
    pub table: Table,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

/// Registration payload for an extension chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionChainDraft {
    pub extension_id: String,
    pub chain_name: String,
    pub parent_chain: ChainHook,
    #[serde(default)]
    pub table: Table,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    DEFAULT_EXTENSION_PRIORITY
}

impl ExtensionChainDraft {
    pub fn validate(&self) -> Result<()> {
        validators::validate_chain_name(&self.chain_name)
            .map_err(|e| Error::validation("chain_name", e))?;

        if !self.table.permits_hook(self.parent_chain) {
            return Err(Error::validation(
                "parent_chain",
                format!(
                    "chain {} is not valid for table {}",
                    self.parent_chain, self.table
                ),
            ));
        }

        if self.extension_id.is_empty() {
            return Err(Error::validation("extension_id", "must not be empty"));
        }

        Ok(())
    }
}

fn join_hooks(hooks: &[ChainHook]) -> String {
    hooks
        .iter()
        .map(|h| h.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_actions(actions: &[Action]) -> String {
    actions
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
