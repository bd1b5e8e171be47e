//! Shared test utilities for core module tests
//!
//! Provides common builders so the scenario and property tests don't
//! repeat rule construction. Only compiled in test mode.

use std::sync::Arc;

use crate::core::iptables::Iptables;
use crate::core::model::{Action, ChainHook, ExtensionChainDraft, Protocol, RuleDraft, Table};
use crate::core::orchestrator::Orchestrator;
use crate::store::Store;

/// Orchestrator wired to an in-memory store and the mock adapter: the
/// standard fixture for engine tests. Nothing touches the system.
pub fn mock_orchestrator() -> Orchestrator {
    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
    let iptables = Arc::new(Iptables::mock());
    Orchestrator::new(store, iptables)
}

/// Minimal accept-everything draft for the given group.
pub fn draft(table: Table, chain: ChainHook, action: Action) -> RuleDraft {
    RuleDraft {
        table,
        chain,
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
}

/// TCP rule with a destination port and comment, the workhorse shape.
pub fn tcp_draft(chain: ChainHook, port: u16, comment: &str) -> RuleDraft {
    let mut d = draft(Table::Filter, chain, Action::Accept);
    d.protocol = Some(Protocol::Tcp);
    d.port = Some(port.to_string());
    d.comment = Some(comment.to_string());
    d
}

/// Extension chain registration payload.
pub fn ext_draft(name: &str, parent: ChainHook, priority: i64) -> ExtensionChainDraft {
    ExtensionChainDraft {
        extension_id: "test-extension".to_string(),
        chain_name: name.to_string(),
        parent_chain: parent,
        table: Table::Filter,
        priority,
    }
}
