//! Engine-owned chain map
//!
//! For every (table, parent chain) combination the engine defines exactly
//! one owned chain that it exclusively flushes and repopulates. User rules
//! only ever land in owned chains; the parent chains carry nothing of ours
//! but a single jump, which is what isolates stored policy from manual or
//! extension-inserted rules in the same parent.

use crate::core::model::{ChainHook, Table};

/// (table, parent hook) → owned chain name.
///
/// Names carry the table suffix where the hook name alone would collide
/// across tables (OUTPUT exists in all four).
pub const OWNED_CHAINS: &[(Table, ChainHook, &str)] = &[
    // filter
    (Table::Filter, ChainHook::Input, "REWALL_INPUT"),
    (Table::Filter, ChainHook::Output, "REWALL_OUTPUT"),
    (Table::Filter, ChainHook::Forward, "REWALL_FORWARD"),
    // nat
    (Table::Nat, ChainHook::Prerouting, "REWALL_PREROUTING"),
    (Table::Nat, ChainHook::Output, "REWALL_OUTPUT_NAT"),
    (Table::Nat, ChainHook::Postrouting, "REWALL_POSTROUTING"),
    // mangle
    (Table::Mangle, ChainHook::Prerouting, "REWALL_PREROUTING_MANGLE"),
    (Table::Mangle, ChainHook::Input, "REWALL_INPUT_MANGLE"),
    (Table::Mangle, ChainHook::Forward, "REWALL_FORWARD_MANGLE"),
    (Table::Mangle, ChainHook::Output, "REWALL_OUTPUT_MANGLE"),
    (Table::Mangle, ChainHook::Postrouting, "REWALL_POSTROUTING_MANGLE"),
    // raw
    (Table::Raw, ChainHook::Prerouting, "REWALL_PREROUTING_RAW"),
    (Table::Raw, ChainHook::Output, "REWALL_OUTPUT_RAW"),
];

/// Returns the owned chain for a (table, hook) pair, or `None` when the
/// pair is outside the map (defensive: stored rows may be stale).
pub fn owned_chain(table: Table, hook: ChainHook) -> Option<&'static str> {
    OWNED_CHAINS
        .iter()
        .find(|(t, h, _)| *t == table && *h == hook)
        .map(|(_, _, name)| *name)
}

/// Iterates every (table, hook, owned chain) entry, in bootstrap order.
pub fn all_owned_chains() -> impl Iterator<Item = (Table, ChainHook, &'static str)> {
    OWNED_CHAINS.iter().copied()
}
