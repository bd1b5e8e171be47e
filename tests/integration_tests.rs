//! Integration tests for rewall
//!
//! End-to-end flows through the public crate API: bootstrap, rule CRUD
//! with apply projection, extension chain lifecycle, export/import, and
//! property tests for the ordering invariants.
//!
//! Everything runs against the mock adapter and a temp-file database, so
//! no privileges and no live netfilter state are involved.

use std::sync::Arc;

use rewall::core::iptables::Iptables;
use rewall::core::model::{
    Action, ChainHook, ExtensionChainDraft, Protocol, RuleDraft, Table,
};
use rewall::core::orchestrator::{ImportMode, Orchestrator};
use rewall::store::Store;

fn tcp_draft(chain: ChainHook, port: u16, comment: &str) -> RuleDraft {
    RuleDraft {
        table: Table::Filter,
        chain,
        action: Action::Accept,
        protocol: Some(Protocol::Tcp),
        source: None,
        destination: None,
        port: Some(port.to_string()),
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
        comment: Some(comment.to_string()),
        enabled: true,
    }
}

/// Orchestrator against a temp-file database, as a served deployment
/// would run it (minus privileges).
fn file_backed_orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
    let store = Arc::new(Store::open(&dir.path().join("rewall.db")).unwrap());
    Orchestrator::new(store, Arc::new(Iptables::mock()))
}

#[tokio::test]
async fn test_full_lifecycle_bootstrap_create_apply() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = file_backed_orchestrator(&dir);

    orchestrator.bootstrap().await.unwrap();

    let rule = orchestrator
        .create_rule(tcp_draft(ChainHook::Input, 22, "allow ssh"))
        .await
        .unwrap();
    assert_eq!(rule.order, 0);

    let report = orchestrator.apply().await.unwrap();
    assert!(report.is_success(), "apply failed: {report:?}");
    assert_eq!(report.applied, 1);

    let listing = orchestrator
        .iptables()
        .list_chain_rules("REWALL_INPUT", Table::Filter)
        .await
        .unwrap();
    let line = listing
        .iter()
        .find(|l| l.contains("--dport 22"))
        .expect("ssh rule projected");
    assert!(line.contains("-p tcp"));
    assert!(line.contains("-j ACCEPT"));
    assert!(line.contains(&format!("ID_{}", rule.id)));
}

#[tokio::test]
async fn test_rules_survive_reopen_and_reapply() {
    let dir = tempfile::tempdir().unwrap();

    let created = {
        let orchestrator = file_backed_orchestrator(&dir);
        orchestrator
            .create_rule(tcp_draft(ChainHook::Input, 443, "https"))
            .await
            .unwrap()
    };

    // Fresh process: reopen the same database, new (empty) live state
    let orchestrator = file_backed_orchestrator(&dir);
    orchestrator.bootstrap().await.unwrap();
    let report = orchestrator.apply().await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.applied, 1);

    let loaded = orchestrator.get_rule(created.id).unwrap();
    assert_eq!(loaded.port.as_deref(), Some("443"));
}

#[tokio::test]
async fn test_disable_rule_removes_it_from_live_state() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = file_backed_orchestrator(&dir);
    orchestrator.bootstrap().await.unwrap();

    let rule = orchestrator
        .create_rule(tcp_draft(ChainHook::Input, 8080, "staging"))
        .await
        .unwrap();

    let patch = rewall::core::model::RulePatch {
        enabled: Some(false),
        ..Default::default()
    };
    orchestrator.update_rule(rule.id, patch).await.unwrap();

    let listing = orchestrator
        .iptables()
        .list_chain_rules("REWALL_INPUT", Table::Filter)
        .await
        .unwrap();
    assert!(
        !listing.iter().any(|l| l.contains("--dport 8080")),
        "disabled rule still live: {listing:?}"
    );
}

#[tokio::test]
async fn test_nat_rule_lands_in_nat_owned_chain() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = file_backed_orchestrator(&dir);
    orchestrator.bootstrap().await.unwrap();

    let draft = RuleDraft {
        table: Table::Nat,
        chain: ChainHook::Prerouting,
        action: Action::Dnat,
        protocol: Some(Protocol::Tcp),
        source: None,
        destination: None,
        port: Some("80".to_string()),
        in_interface: None,
        out_interface: None,
        state: None,
        limit_rate: None,
        limit_burst: None,
        to_destination: Some("10.0.0.5:8080".to_string()),
        to_source: None,
        to_ports: None,
        log_prefix: None,
        log_level: None,
        reject_with: None,
        comment: None,
        enabled: true,
    };
    orchestrator.create_rule(draft).await.unwrap();

    let listing = orchestrator
        .iptables()
        .list_chain_rules("REWALL_PREROUTING", Table::Nat)
        .await
        .unwrap();
    let line = listing
        .iter()
        .find(|l| l.contains("-j DNAT"))
        .expect("dnat rule projected into nat owned chain");
    assert!(line.contains("--to-destination 10.0.0.5:8080"));

    // Nothing leaked into the filter table's owned chains
    let filter_listing = orchestrator
        .iptables()
        .list_chain_rules("REWALL_INPUT", Table::Filter)
        .await
        .unwrap();
    assert!(!filter_listing.iter().any(|l| l.contains("DNAT")));
}

#[tokio::test]
async fn test_extension_chain_survives_engine_applies() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = file_backed_orchestrator(&dir);
    orchestrator.bootstrap().await.unwrap();

    orchestrator
        .register_extension_chain(ExtensionChainDraft {
            extension_id: "wireguard".to_string(),
            chain_name: "EXT_WG_FWD".to_string(),
            parent_chain: ChainHook::Forward,
            table: Table::Filter,
            priority: 10,
        })
        .await
        .unwrap();

    // Extension populates its own chain out of band
    let marker = tcp_draft(ChainHook::Forward, 51820, "wg").into_rule(0);
    orchestrator
        .iptables()
        .add_rule(Table::Filter, "EXT_WG_FWD", &marker, None)
        .await
        .unwrap();

    // Engine applies must not touch extension-owned rules
    orchestrator
        .create_rule(tcp_draft(ChainHook::Input, 22, "ssh"))
        .await
        .unwrap();
    orchestrator.apply().await.unwrap();

    let listing = orchestrator
        .iptables()
        .list_chain_rules("EXT_WG_FWD", Table::Filter)
        .await
        .unwrap();
    assert!(
        listing.iter().any(|l| l.contains("--dport 51820")),
        "extension rule was clobbered by apply"
    );
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = file_backed_orchestrator(&dir);

    orchestrator
        .create_rule(tcp_draft(ChainHook::Input, 22, "ssh"))
        .await
        .unwrap();
    orchestrator
        .create_rule(tcp_draft(ChainHook::Output, 53, "dns"))
        .await
        .unwrap();

    let exported = orchestrator.export_rules().unwrap();
    let json = serde_json::to_string(&exported).unwrap();

    // Import the export into a fresh deployment
    let dir2 = tempfile::tempdir().unwrap();
    let second = file_backed_orchestrator(&dir2);
    let records: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
    let report = second
        .import_rules(records, ImportMode::Replace)
        .await
        .unwrap();

    assert_eq!(report.imported, 2);
    assert!(report.failures.is_empty());

    let rules = second.list_rules(None, None).unwrap();
    assert_eq!(rules.len(), 2);
    assert!(rules.iter().any(|r| r.port.as_deref() == Some("22")));
    assert!(rules.iter().any(|r| r.port.as_deref() == Some("53")));
}

#[tokio::test]
async fn test_validation_rejected_before_any_external_call() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = file_backed_orchestrator(&dir);
    orchestrator.bootstrap().await.unwrap();

    // DNAT is not a filter-table action; the draft must be rejected and
    // the live state untouched
    let mut bad = tcp_draft(ChainHook::Input, 80, "bad");
    bad.action = Action::Dnat;
    let err = orchestrator.create_rule(bad).await.unwrap_err();
    assert!(matches!(err, rewall::Error::Validation { .. }));

    let listing = orchestrator
        .iptables()
        .list_chain_rules("REWALL_INPUT", Table::Filter)
        .await
        .unwrap();
    assert!(!listing.iter().any(|l| l.contains("--dport 80")));
}

// --- Property tests: ordering invariants ---

mod ordering_properties {
    use super::*;
    use proptest::prelude::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn mock_orchestrator() -> Orchestrator {
        let store = Arc::new(Store::open_in_memory().unwrap());
        Orchestrator::new(store, Arc::new(Iptables::mock()))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// After any interleaving of creates and deletes, the order values
        /// of a group are exactly {0, .., n-1}.
        #[test]
        fn orders_always_dense(operations in proptest::collection::vec(0u8..4, 1..20)) {
            runtime().block_on(async {
                let orchestrator = mock_orchestrator();
                let mut ids: Vec<uuid::Uuid> = Vec::new();

                for (step, op) in operations.iter().enumerate() {
                    if *op == 0 && !ids.is_empty() {
                        // Delete a pseudo-arbitrary existing rule
                        let victim = ids.remove(step % ids.len());
                        orchestrator.delete_rule(victim).await.unwrap();
                    } else {
                        let port = 1024 + u16::try_from(step).unwrap();
                        let rule = orchestrator
                            .create_rule(tcp_draft(ChainHook::Input, port, "prop"))
                            .await
                            .unwrap();
                        ids.push(rule.id);
                    }

                    let mut orders: Vec<i64> = orchestrator
                        .list_rules(Some(Table::Filter), Some(ChainHook::Input))
                        .unwrap()
                        .iter()
                        .map(|r| r.order)
                        .collect();
                    orders.sort_unstable();
                    let expected: Vec<i64> = (0..i64::try_from(ids.len()).unwrap()).collect();
                    prop_assert_eq!(orders, expected);
                }
                Ok(())
            })?;
        }

        /// Moving a rule i→j and back j→i restores the exact sequence.
        #[test]
        fn reorder_round_trip(size in 2usize..8, from_seed: usize, to_seed: usize) {
            runtime().block_on(async {
                let orchestrator = mock_orchestrator();
                let mut ids = Vec::new();
                for step in 0..size {
                    let port = 2000 + u16::try_from(step).unwrap();
                    let rule = orchestrator
                        .create_rule(tcp_draft(ChainHook::Input, port, "prop"))
                        .await
                        .unwrap();
                    ids.push(rule.id);
                }

                let from = from_seed % size;
                let to = to_seed % size;
                let original: Vec<_> = orchestrator
                    .list_rules(Some(Table::Filter), Some(ChainHook::Input))
                    .unwrap()
                    .iter()
                    .map(|r| r.id)
                    .collect();

                let from_i64 = i64::try_from(from).unwrap();
                let to_i64 = i64::try_from(to).unwrap();
                orchestrator.reorder_rule(ids[from], to_i64).await.unwrap();
                orchestrator.reorder_rule(ids[from], from_i64).await.unwrap();

                let restored: Vec<_> = orchestrator
                    .list_rules(Some(Table::Filter), Some(ChainHook::Input))
                    .unwrap()
                    .iter()
                    .map(|r| r.id)
                    .collect();
                prop_assert_eq!(original, restored);
                Ok(())
            })?;
        }
    }
}
