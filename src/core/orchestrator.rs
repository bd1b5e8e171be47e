//! Reconciliation orchestrator
//!
//! The stateful heart of the engine. It owns the store and the command
//! adapter and coordinates the four protocols:
//!
//! 1. **Bootstrap**: ensure every owned chain exists and is jumped to from
//!    its parent, as close to position 1 as the tool allows. Idempotent.
//! 2. **Extension registration**: give each extension an isolated chain
//!    plus a deterministic slot in the parent's jump order.
//! 3. **Rule CRUD/reorder**: every mutation keeps `order` dense per
//!    (table, chain) group and triggers a full apply.
//! 4. **Apply**: flush every owned chain, then replay every enabled rule
//!    in (table, chain, order) sequence. Never a diff: the tool has no
//!    transactions and no stable rule handles, so recomputing from stored
//!    intent is the only strategy that cannot drift.
//!
//! Stored mutations commit before apply runs; a failed apply leaves
//! stored intent and live state divergent until the next successful apply,
//! which is accepted rather than fatal.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::chains::{all_owned_chains, owned_chain};
use crate::core::error::{Error, Result};
use crate::core::iptables::Iptables;
use crate::core::model::{
    ExtensionChain, ExtensionChainDraft, Rule, RuleDraft, RulePatch,
};
use crate::store::Store;

/// Outcome of one full apply pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Owned chains successfully reset
    pub flushed: usize,
    /// Owned chains whose flush failed
    pub flush_failures: Vec<String>,
    /// Rules replayed into their owned chains
    pub applied: usize,
    /// Rules skipped because their (table, chain) pair is not in the
    /// owned-chain map (stale rows)
    pub skipped: Vec<Uuid>,
    /// Rules whose replay failed, with the adapter's message
    pub failed: Vec<RuleFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleFailure {
    pub id: Uuid,
    pub error: String,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.flush_failures.is_empty() && self.failed.is_empty()
    }
}

/// Import batch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Add to the existing rule set, assigning fresh orders at group tails
    Append,
    /// Delete every stored rule first
    Replace,
}

/// Outcome of an import batch. Per-record failures do not abort the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub failures: Vec<ImportFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportFailure {
    pub index: usize,
    pub error: String,
}

pub struct Orchestrator {
    store: Arc<Store>,
    iptables: Arc<Iptables>,
    audit: Option<AuditLog>,
    /// Serializes whole flush-then-replay passes so overlapping applies
    /// cannot interleave their tool invocations.
    apply_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, iptables: Arc<Iptables>) -> Self {
        Self {
            store,
            iptables,
            audit: None,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn iptables(&self) -> &Iptables {
        &self.iptables
    }

    async fn record_audit(&self, event: AuditEvent) {
        if let Some(ref audit) = self.audit {
            if let Err(e) = audit.log(event).await {
                warn!("failed to write audit event: {e}");
            }
        }
    }

    // --- Bootstrap ---

    /// Ensures every owned chain exists (create-or-flush) and is reachable
    /// from its parent chain, inserting the jump at position 1 and falling
    /// back to append when the insert is refused. Safe to re-run: neither
    /// jumps nor chains are duplicated.
    pub async fn bootstrap(&self) -> Result<()> {
        info!("initializing owned firewall chains for all tables");
        let mut failures = Vec::new();

        for (table, hook, owned) in all_owned_chains() {
            if let Err(e) = self.iptables.create_or_flush_chain(owned, table).await {
                error!("failed to reset owned chain {owned} in {table}: {e}");
                failures.push(format!("{table}/{owned}: {e}"));
                continue;
            }

            match self
                .iptables
                .ensure_jump(hook.as_str(), owned, table, Some(1))
                .await
            {
                Ok(_) => {}
                Err(insert_err) => {
                    warn!(
                        "insert at position 1 failed for {owned} in {table}, trying append: {insert_err}"
                    );
                    if let Err(e) = self
                        .iptables
                        .ensure_jump(hook.as_str(), owned, table, None)
                        .await
                    {
                        error!("failed to add jump {} -> {owned} in {table}: {e}", hook.as_str());
                        failures.push(format!("{table}/{owned}: {e}"));
                    }
                }
            }
        }

        let success = failures.is_empty();
        self.record_audit(AuditEvent::new(
            EventType::Bootstrap,
            success,
            serde_json::json!({ "chains": all_owned_chains().count() }),
            (!success).then(|| failures.join("; ")),
        ))
        .await;

        if success {
            info!("all owned chains initialized");
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "bootstrap incomplete: {}",
                failures.join("; ")
            )))
        }
    }

    // --- Extension chains ---

    /// Registers (or re-registers) an extension chain.
    ///
    /// Idempotent: when the name is already registered the stored
    /// parent/priority/table are updated if they differ and the physical
    /// chain is re-ensured *without* flushing, so extension-owned rules
    /// survive a restart. New names get a clean (flush-if-exists) chain
    /// and a fresh row. Both paths end with a jump-order rebuild for the
    /// chain's (parent, table) pair.
    pub async fn register_extension_chain(
        &self,
        draft: ExtensionChainDraft,
    ) -> Result<ExtensionChain> {
        draft.validate()?;

        let record = if let Some(mut existing) = self.store.get_extension_chain(&draft.chain_name)?
        {
            let moved_pair = existing.parent_chain != draft.parent_chain
                || existing.table != draft.table;
            let changed = moved_pair
                || existing.priority != draft.priority
                || existing.extension_id != draft.extension_id;

            if moved_pair {
                // The jump under the old parent would otherwise linger
                self.iptables
                    .remove_jump(
                        existing.parent_chain.as_str(),
                        &existing.chain_name,
                        existing.table,
                    )
                    .await;
            }

            if changed {
                existing.extension_id = draft.extension_id;
                existing.parent_chain = draft.parent_chain;
                existing.table = draft.table;
                existing.priority = draft.priority;
                self.store.update_extension_chain(&existing)?;
                info!("updated extension chain {} configuration", existing.chain_name);
            }

            // The row may predate a reboot; the physical chain must exist
            // either way, and must not be flushed.
            self.iptables
                .create_chain(&existing.chain_name, existing.table)
                .await?;
            existing
        } else {
            self.iptables
                .create_or_flush_chain(&draft.chain_name, draft.table)
                .await?;

            let record = ExtensionChain {
                id: Uuid::new_v4(),
                extension_id: draft.extension_id,
                chain_name: draft.chain_name,
                parent_chain: draft.parent_chain,
                table: draft.table,
                priority: draft.priority,
                created_at: chrono::Utc::now(),
            };
            self.store.insert_extension_chain(&record)?;
            info!(
                "registered extension chain {} for extension {}",
                record.chain_name, record.extension_id
            );
            record
        };

        self.rebuild_jumps(record.table, record.parent_chain).await?;

        self.record_audit(AuditEvent::new(
            EventType::RegisterExtensionChain,
            true,
            serde_json::json!({
                "chain": record.chain_name,
                "parent": record.parent_chain,
                "table": record.table,
                "priority": record.priority,
            }),
            None,
        ))
        .await;

        Ok(record)
    }

    /// Unregisters an extension chain: removes its jump, deletes the
    /// physical chain, deletes the record. Returns `false` when the name
    /// was never registered.
    pub async fn unregister_extension_chain(&self, chain_name: &str) -> Result<bool> {
        let Some(chain) = self.store.get_extension_chain(chain_name)? else {
            return Ok(false);
        };

        self.iptables
            .remove_jump(chain.parent_chain.as_str(), chain_name, chain.table)
            .await;
        self.iptables.delete_chain(chain_name, chain.table).await;
        self.store.delete_extension_chain(chain_name)?;

        info!("unregistered extension chain {chain_name}");
        self.record_audit(AuditEvent::new(
            EventType::UnregisterExtensionChain,
            true,
            serde_json::json!({ "chain": chain_name }),
            None,
        ))
        .await;
        Ok(true)
    }

    /// Rebuilds the jump order for one (table, parent) pair.
    ///
    /// All jumps (owned chain and every extension chain for the pair) are
    /// removed, then re-inserted from position 1: owned chain first —
    /// engine policy always evaluates before any extension — then
    /// extension chains in ascending priority.
    pub async fn rebuild_jumps(
        &self,
        table: crate::core::model::Table,
        parent: crate::core::model::ChainHook,
    ) -> Result<()> {
        let extensions = self.store.extension_chains_for(table, parent)?;
        let owned = owned_chain(table, parent);

        for ext in &extensions {
            self.iptables
                .remove_jump(parent.as_str(), &ext.chain_name, table)
                .await;
        }
        if let Some(owned) = owned {
            self.iptables.remove_jump(parent.as_str(), owned, table).await;
        }

        let mut position = 1;
        if let Some(owned) = owned {
            self.iptables
                .ensure_jump(parent.as_str(), owned, table, Some(position))
                .await?;
            position += 1;
        }
        for ext in &extensions {
            self.iptables
                .ensure_jump(parent.as_str(), &ext.chain_name, table, Some(position))
                .await?;
            position += 1;
        }

        Ok(())
    }

    /// Applies a batch of priority updates, then rebuilds jumps once per
    /// distinct (parent, table) pair touched by any registered chain.
    pub async fn set_extension_priorities(&self, updates: &[(Uuid, i64)]) -> Result<usize> {
        let mut updated = 0;
        for (id, priority) in updates {
            if self.store.update_extension_chain_priority(*id, *priority)? {
                updated += 1;
            }
        }

        let mut rebuilt = std::collections::HashSet::new();
        for chain in self.store.list_extension_chains()? {
            let key = (chain.table, chain.parent_chain);
            if rebuilt.insert(key) {
                self.rebuild_jumps(chain.table, chain.parent_chain).await?;
            }
        }
        Ok(updated)
    }

    // --- Rule CRUD ---

    pub fn list_rules(
        &self,
        table: Option<crate::core::model::Table>,
        chain: Option<crate::core::model::ChainHook>,
    ) -> Result<Vec<Rule>> {
        self.store.list_rules(table, chain)
    }

    pub fn get_rule(&self, id: Uuid) -> Result<Rule> {
        self.store
            .get_rule(id)?
            .ok_or_else(|| Error::NotFound(format!("rule {id}")))
    }

    /// Creates a rule at the tail of its (table, chain) group and
    /// reprojects the live state.
    pub async fn create_rule(&self, draft: RuleDraft) -> Result<Rule> {
        draft.validate()?;

        let order = self
            .store
            .max_order(draft.table, draft.chain)?
            .map_or(0, |max| max + 1);
        let rule = draft.into_rule(order);
        self.store.insert_rule(&rule)?;
        info!("created firewall rule {}", rule.id);

        self.apply_after_mutation().await;
        Ok(rule)
    }

    /// Merges a partial update into a stored rule and reprojects.
    ///
    /// When the patch moves the rule to a different (table, chain) group
    /// it is appended at the new group's tail and the old group is
    /// compacted, keeping both groups dense.
    pub async fn update_rule(&self, id: Uuid, patch: RulePatch) -> Result<Rule> {
        if patch.is_empty() {
            return Err(Error::validation("body", "no fields to update"));
        }

        let mut rule = self.get_rule(id)?;
        let old_group = (rule.table, rule.chain);

        patch.apply_to(&mut rule);
        RuleDraft::from(&rule).validate()?;

        let new_group = (rule.table, rule.chain);
        if new_group != old_group {
            rule.order = self
                .store
                .max_order(rule.table, rule.chain)?
                .map_or(0, |max| max + 1);
        }

        self.store.update_rule(&rule)?;
        if new_group != old_group {
            self.store.renumber_group(old_group.0, old_group.1)?;
        }
        info!("updated firewall rule {id}");

        self.apply_after_mutation().await;
        Ok(rule)
    }

    /// Deletes a rule, compacts its group to a dense 0..n-1 sequence and
    /// reprojects. An unknown id is a NotFound and performs no apply.
    pub async fn delete_rule(&self, id: Uuid) -> Result<()> {
        let rule = self.get_rule(id)?;
        self.store.delete_rule(id)?;
        self.store.renumber_group(rule.table, rule.chain)?;
        info!("deleted firewall rule {id}");

        self.apply_after_mutation().await;
        Ok(())
    }

    /// Moves one rule to `new_order` within its group, shifting only the
    /// intervening siblings by one. O(n), preserves the relative order of
    /// untouched rules, and round-trips: moving i→j then j→i restores the
    /// original sequence.
    pub async fn reorder_rule(&self, id: Uuid, new_order: i64) -> Result<()> {
        let rule = self.get_rule(id)?;
        let group = self.store.rules_in_group(rule.table, rule.chain)?;

        let max_order = i64::try_from(group.len()).unwrap_or(i64::MAX) - 1;
        let new_order = new_order.clamp(0, max_order.max(0));
        let old_order = rule.order;
        if new_order == old_order {
            return Ok(());
        }

        let mut assignments: Vec<(Uuid, i64)> = Vec::with_capacity(group.len());
        for sibling in &group {
            if sibling.id == id {
                continue;
            }
            if new_order < old_order {
                // Moving earlier: everything in [new, old) steps later
                if sibling.order >= new_order && sibling.order < old_order {
                    assignments.push((sibling.id, sibling.order + 1));
                }
            } else {
                // Moving later: everything in (old, new] steps earlier
                if sibling.order > old_order && sibling.order <= new_order {
                    assignments.push((sibling.id, sibling.order - 1));
                }
            }
        }
        assignments.push((id, new_order));
        self.store.set_orders(&assignments)?;
        info!("moved rule {id} from position {old_order} to {new_order}");

        self.apply_after_mutation().await;
        Ok(())
    }

    /// Bulk order assignment for drag-and-drop reordering. The caller is
    /// responsible for supplying a valid permutation.
    pub async fn set_rule_orders(&self, assignments: &[(Uuid, i64)]) -> Result<usize> {
        self.store.set_orders(assignments)?;
        self.apply_after_mutation().await;
        Ok(assignments.len())
    }

    // --- Apply ---

    /// Runs apply after a committed mutation, logging instead of failing:
    /// stored intent already changed, and the next successful apply will
    /// converge the live state.
    async fn apply_after_mutation(&self) {
        match self.apply().await {
            Ok(report) if report.is_success() => {}
            Ok(report) => warn!(
                "apply incomplete after mutation: {} flush failures, {} rule failures",
                report.flush_failures.len(),
                report.failed.len()
            ),
            Err(e) => warn!("apply failed after mutation: {e}"),
        }
    }

    /// Full reconciliation: flush every owned chain, then replay every
    /// enabled rule in (table, chain, order) sequence into its owned
    /// chain, tagging each live rule with `ID_<uuid>` so the live-to-
    /// stored correspondence is auditable.
    ///
    /// Extension chains and their contents are untouched. Individual
    /// failures do not abort the pass; the report aggregates them.
    pub async fn apply(&self) -> Result<ApplyReport> {
        let _guard = self.apply_lock.lock().await;
        let mut report = ApplyReport::default();

        for (table, _, owned) in all_owned_chains() {
            match self.iptables.flush_chain(owned, table).await {
                Ok(()) => report.flushed += 1,
                Err(e) => {
                    warn!("failed to flush owned chain {owned} in {table}: {e}");
                    report.flush_failures.push(format!("{table}/{owned}"));
                }
            }
        }

        let rules = self.store.enabled_rules_ordered()?;
        for rule in &rules {
            let Some(target) = owned_chain(rule.table, rule.chain) else {
                warn!(
                    "rule {} references unmapped {}/{}, skipping",
                    rule.id, rule.table, rule.chain
                );
                report.skipped.push(rule.id);
                continue;
            };

            let tag = format!("ID_{}", rule.id);
            match self
                .iptables
                .add_rule(rule.table, target, rule, Some(&tag))
                .await
            {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    error!("failed to apply rule {}: {e}", rule.id);
                    report.failed.push(RuleFailure {
                        id: rule.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.is_success() {
            info!("applied {} firewall rules", report.applied);
        }

        self.record_audit(AuditEvent::new(
            EventType::ApplyRules,
            report.is_success(),
            serde_json::json!({
                "applied": report.applied,
                "skipped": report.skipped.len(),
                "failed": report.failed.len(),
            }),
            (!report.is_success()).then(|| "one or more steps failed".to_string()),
        ))
        .await;

        Ok(report)
    }

    /// Persists the live ruleset to disk (reboot survival). Explicitly
    /// triggered, separate from apply.
    pub async fn save(&self) -> Result<()> {
        let result = self.iptables.save_rules().await;
        self.record_audit(AuditEvent::new(
            EventType::SaveRules,
            result.is_ok(),
            serde_json::Value::Null,
            result.as_ref().err().map(ToString::to_string),
        ))
        .await;
        result
    }

    // --- Export / import ---

    /// All rules in listing order, as a flat re-importable list.
    pub fn export_rules(&self) -> Result<Vec<Rule>> {
        self.store.list_rules(None, None)
    }

    /// Imports a flat list of rule objects.
    ///
    /// Tolerates per-record failures: malformed or invalid entries are
    /// reported by index while the remainder is imported. One apply runs
    /// after the whole batch.
    pub async fn import_rules(
        &self,
        records: Vec<serde_json::Value>,
        mode: ImportMode,
    ) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        let mut parsed: Vec<RuleDraft> = Vec::with_capacity(records.len());

        for (index, record) in records.into_iter().enumerate() {
            match serde_json::from_value::<RuleDraft>(record) {
                Ok(draft) => match draft.validate() {
                    Ok(()) => parsed.push(draft),
                    Err(e) => report.failures.push(ImportFailure {
                        index,
                        error: e.to_string(),
                    }),
                },
                Err(e) => report.failures.push(ImportFailure {
                    index,
                    error: format!("malformed rule object: {e}"),
                }),
            }
        }

        match mode {
            ImportMode::Replace => {
                // Fresh orders per group, dense from zero
                let mut counters: std::collections::HashMap<_, i64> =
                    std::collections::HashMap::new();
                let rules: Vec<Rule> = parsed
                    .into_iter()
                    .map(|draft| {
                        let counter = counters.entry((draft.table, draft.chain)).or_insert(0);
                        let rule = draft.into_rule(*counter);
                        *counter += 1;
                        rule
                    })
                    .collect();
                report.imported = rules.len();
                self.store.replace_all_rules(&rules)?;
            }
            ImportMode::Append => {
                let mut counters: std::collections::HashMap<_, i64> =
                    std::collections::HashMap::new();
                for draft in parsed {
                    let key = (draft.table, draft.chain);
                    let next = match counters.get(&key) {
                        Some(next) => *next,
                        None => self.store.max_order(key.0, key.1)?.map_or(0, |max| max + 1),
                    };
                    let rule = draft.into_rule(next);
                    self.store.insert_rule(&rule)?;
                    counters.insert(key, next + 1);
                    report.imported += 1;
                }
            }
        }

        info!(
            "imported {} rules ({} failures)",
            report.imported,
            report.failures.len()
        );
        self.record_audit(AuditEvent::new(
            EventType::ImportRules,
            report.failures.is_empty(),
            serde_json::json!({
                "imported": report.imported,
                "failed": report.failures.len(),
            }),
            None,
        ))
        .await;

        self.apply_after_mutation().await;
        Ok(report)
    }
}
