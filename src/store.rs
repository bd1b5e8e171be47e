//! SQLite persistence for rules and extension chains
//!
//! Stored state is authoritative; the live firewall is a projection that
//! apply re-derives from it. Reads come in two shapes: "all enabled,
//! ordered by (table, chain, order)" for apply, and "all, optionally
//! filtered" for listing.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::core::error::{Error, Result};
use crate::core::model::{ChainHook, ExtensionChain, Rule, Table};

const RULE_COLUMNS: &str = "id, tbl, chain, action, protocol, source, destination, port, \
     in_interface, out_interface, state, limit_rate, limit_burst, \
     to_destination, to_source, to_ports, log_prefix, log_level, reject_with, \
     comment, position, enabled, created_at, updated_at";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and ensures the
    /// schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database, used by the test suite.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                tbl TEXT NOT NULL,
                chain TEXT NOT NULL,
                action TEXT NOT NULL,
                protocol TEXT,
                source TEXT,
                destination TEXT,
                port TEXT,
                in_interface TEXT,
                out_interface TEXT,
                state TEXT,
                limit_rate TEXT,
                limit_burst INTEGER,
                to_destination TEXT,
                to_source TEXT,
                to_ports TEXT,
                log_prefix TEXT,
                log_level TEXT,
                reject_with TEXT,
                comment TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS extension_chains (
                id TEXT PRIMARY KEY,
                extension_id TEXT NOT NULL,
                chain_name TEXT NOT NULL UNIQUE,
                parent_chain TEXT NOT NULL,
                tbl TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 50,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rules_group ON rules(tbl, chain, position);
            CREATE INDEX IF NOT EXISTS idx_ext_chains_parent
                ON extension_chains(tbl, parent_chain, priority);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Internal(format!("store lock poisoned: {e}")))
    }

    // --- Rules ---

    pub fn insert_rule(&self, rule: &Rule) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO rules (id, tbl, chain, action, protocol, source, destination, port,
                in_interface, out_interface, state, limit_rate, limit_burst,
                to_destination, to_source, to_ports, log_prefix, log_level, reject_with,
                comment, position, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                rule.id.to_string(),
                rule.table.as_str(),
                rule.chain.as_str(),
                rule.action.as_str(),
                rule.protocol.map(|p| p.as_str()),
                rule.source.map(|s| s.to_string()),
                rule.destination.map(|d| d.to_string()),
                rule.port,
                rule.in_interface,
                rule.out_interface,
                rule.state,
                rule.limit_rate,
                rule.limit_burst,
                rule.to_destination,
                rule.to_source,
                rule.to_ports,
                rule.log_prefix,
                rule.log_level,
                rule.reject_with,
                rule.comment,
                rule.order,
                rule.enabled,
                rule.created_at.to_rfc3339(),
                rule.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_rule(&self, id: Uuid) -> Result<Option<Rule>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id.to_string()], row_to_rule)?;
        rows.next().transpose().map_err(Error::from)
    }

    /// All rules ordered by (table, chain, position), optionally filtered.
    pub fn list_rules(
        &self,
        table: Option<Table>,
        chain: Option<ChainHook>,
    ) -> Result<Vec<Rule>> {
        let conn = self.lock()?;
        let mut sql = format!("SELECT {RULE_COLUMNS} FROM rules");
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(table) = table {
            args.push(table.as_str().to_string());
            clauses.push(format!("tbl = ?{}", args.len()));
        }
        if let Some(chain) = chain {
            args.push(chain.as_str().to_string());
            clauses.push(format!("chain = ?{}", args.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY tbl, chain, position");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_rule)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// The apply read: every enabled rule in replay order.
    pub fn enabled_rules_ordered(&self) -> Result<Vec<Rule>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE enabled = 1 ORDER BY tbl, chain, position"
        ))?;
        let rows = stmt.query_map([], row_to_rule)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Rules of one (table, chain) group in position order.
    pub fn rules_in_group(&self, table: Table, chain: ChainHook) -> Result<Vec<Rule>> {
        self.list_rules(Some(table), Some(chain))
    }

    /// Highest position in a group, or None for an empty group.
    pub fn max_order(&self, table: Table, chain: ChainHook) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(position) FROM rules WHERE tbl = ?1 AND chain = ?2",
            params![table.as_str(), chain.as_str()],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Rewrites every mutable column of an existing rule.
    pub fn update_rule(&self, rule: &Rule) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE rules SET tbl = ?2, chain = ?3, action = ?4, protocol = ?5, source = ?6,
                destination = ?7, port = ?8, in_interface = ?9, out_interface = ?10,
                state = ?11, limit_rate = ?12, limit_burst = ?13, to_destination = ?14,
                to_source = ?15, to_ports = ?16, log_prefix = ?17, log_level = ?18,
                reject_with = ?19, comment = ?20, position = ?21, enabled = ?22,
                updated_at = ?23
             WHERE id = ?1",
            params![
                rule.id.to_string(),
                rule.table.as_str(),
                rule.chain.as_str(),
                rule.action.as_str(),
                rule.protocol.map(|p| p.as_str()),
                rule.source.map(|s| s.to_string()),
                rule.destination.map(|d| d.to_string()),
                rule.port,
                rule.in_interface,
                rule.out_interface,
                rule.state,
                rule.limit_rate,
                rule.limit_burst,
                rule.to_destination,
                rule.to_source,
                rule.to_ports,
                rule.log_prefix,
                rule.log_level,
                rule.reject_with,
                rule.comment,
                rule.order,
                rule.enabled,
                rule.updated_at.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("rule {}", rule.id)));
        }
        Ok(())
    }

    /// Removes a rule; returns whether a row was deleted.
    pub fn delete_rule(&self, id: Uuid) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM rules WHERE id = ?1", params![id.to_string()])?;
        Ok(changed > 0)
    }

    pub fn count_rules(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Compacts a group's positions to a dense 0..n-1 sequence, keeping
    /// the existing relative order. One transaction so a crash cannot
    /// leave the group half-renumbered.
    pub fn renumber_group(&self, table: Table, chain: ChainHook) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM rules WHERE tbl = ?1 AND chain = ?2 ORDER BY position",
            )?;
            let rows = stmt.query_map(params![table.as_str(), chain.as_str()], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let now = Utc::now().to_rfc3339();
        for (position, id) in ids.iter().enumerate() {
            tx.execute(
                "UPDATE rules SET position = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, position as i64, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Applies a batch of explicit (id, position) assignments in one
    /// transaction. Unknown ids are skipped, matching the bulk-reorder
    /// contract.
    pub fn set_orders(&self, assignments: &[(Uuid, i64)]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for (id, position) in assignments {
            tx.execute(
                "UPDATE rules SET position = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), position, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Replaces the whole rule set in one transaction (import "replace").
    pub fn replace_all_rules(&self, rules: &[Rule]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM rules", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO rules (id, tbl, chain, action, protocol, source, destination, port,
                    in_interface, out_interface, state, limit_rate, limit_burst,
                    to_destination, to_source, to_ports, log_prefix, log_level, reject_with,
                    comment, position, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            )?;
            for rule in rules {
                stmt.execute(params![
                    rule.id.to_string(),
                    rule.table.as_str(),
                    rule.chain.as_str(),
                    rule.action.as_str(),
                    rule.protocol.map(|p| p.as_str()),
                    rule.source.map(|s| s.to_string()),
                    rule.destination.map(|d| d.to_string()),
                    rule.port,
                    rule.in_interface,
                    rule.out_interface,
                    rule.state,
                    rule.limit_rate,
                    rule.limit_burst,
                    rule.to_destination,
                    rule.to_source,
                    rule.to_ports,
                    rule.log_prefix,
                    rule.log_level,
                    rule.reject_with,
                    rule.comment,
                    rule.order,
                    rule.enabled,
                    rule.created_at.to_rfc3339(),
                    rule.updated_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // --- Extension chains ---

    pub fn insert_extension_chain(&self, chain: &ExtensionChain) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO extension_chains
                (id, extension_id, chain_name, parent_chain, tbl, priority, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chain.id.to_string(),
                chain.extension_id,
                chain.chain_name,
                chain.parent_chain.as_str(),
                chain.table.as_str(),
                chain.priority,
                chain.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_extension_chain(&self, chain_name: &str) -> Result<Option<ExtensionChain>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, extension_id, chain_name, parent_chain, tbl, priority, created_at
             FROM extension_chains WHERE chain_name = ?1",
        )?;
        let mut rows = stmt.query_map(params![chain_name], row_to_extension_chain)?;
        rows.next().transpose().map_err(Error::from)
    }

    pub fn update_extension_chain(&self, chain: &ExtensionChain) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE extension_chains
             SET extension_id = ?2, parent_chain = ?3, tbl = ?4, priority = ?5
             WHERE chain_name = ?1",
            params![
                chain.chain_name,
                chain.extension_id,
                chain.parent_chain.as_str(),
                chain.table.as_str(),
                chain.priority,
            ],
        )?;
        Ok(())
    }

    pub fn update_extension_chain_priority(&self, id: Uuid, priority: i64) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE extension_chains SET priority = ?2 WHERE id = ?1",
            params![id.to_string(), priority],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_extension_chain(&self, chain_name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM extension_chains WHERE chain_name = ?1",
            params![chain_name],
        )?;
        Ok(changed > 0)
    }

    /// All extension chains, ordered by (parent, priority) for listing.
    pub fn list_extension_chains(&self) -> Result<Vec<ExtensionChain>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, extension_id, chain_name, parent_chain, tbl, priority, created_at
             FROM extension_chains ORDER BY parent_chain, priority",
        )?;
        let rows = stmt.query_map([], row_to_extension_chain)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Extension chains of one (table, parent) pair in ascending priority:
    /// the jump-rebuild read.
    pub fn extension_chains_for(
        &self,
        table: Table,
        parent: ChainHook,
    ) -> Result<Vec<ExtensionChain>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, extension_id, chain_name, parent_chain, tbl, priority, created_at
             FROM extension_chains WHERE tbl = ?1 AND parent_chain = ?2
             ORDER BY priority",
        )?;
        let rows = stmt.query_map(
            params![table.as_str(), parent.as_str()],
            row_to_extension_chain,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }
}

/// Parses a text column into any `FromStr` type, surfacing failures as
/// conversion errors instead of panics (stale rows must not take the
/// process down).
fn parse_col<T: FromStr>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_col<T: FromStr>(idx: usize, value: Option<String>) -> rusqlite::Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.map(|v| parse_col(idx, &v)).transpose()
}

fn parse_datetime(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Rule> {
    Ok(Rule {
        id: parse_col(0, &row.get::<_, String>(0)?)?,
        table: parse_col(1, &row.get::<_, String>(1)?)?,
        chain: parse_col(2, &row.get::<_, String>(2)?)?,
        action: parse_col(3, &row.get::<_, String>(3)?)?,
        protocol: parse_opt_col(4, row.get::<_, Option<String>>(4)?)?,
        source: parse_opt_col(5, row.get::<_, Option<String>>(5)?)?,
        destination: parse_opt_col(6, row.get::<_, Option<String>>(6)?)?,
        port: row.get(7)?,
        in_interface: row.get(8)?,
        out_interface: row.get(9)?,
        state: row.get(10)?,
        limit_rate: row.get(11)?,
        limit_burst: row.get(12)?,
        to_destination: row.get(13)?,
        to_source: row.get(14)?,
        to_ports: row.get(15)?,
        log_prefix: row.get(16)?,
        log_level: row.get(17)?,
        reject_with: row.get(18)?,
        comment: row.get(19)?,
        order: row.get(20)?,
        enabled: row.get(21)?,
        created_at: parse_datetime(22, &row.get::<_, String>(22)?)?,
        updated_at: parse_datetime(23, &row.get::<_, String>(23)?)?,
    })
}

fn row_to_extension_chain(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtensionChain> {
    Ok(ExtensionChain {
        id: parse_col(0, &row.get::<_, String>(0)?)?,
        extension_id: row.get(1)?,
        chain_name: row.get(2)?,
        parent_chain: parse_col(3, &row.get::<_, String>(3)?)?,
        table: parse_col(4, &row.get::<_, String>(4)?)?,
        priority: row.get(5)?,
        created_at: parse_datetime(6, &row.get::<_, String>(6)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Action, RuleDraft};

    fn draft(chain: ChainHook) -> RuleDraft {
        RuleDraft {
            table: Table::Filter,
            chain,
            action: Action::Accept,
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

    #[test]
    fn test_rule_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut rule = draft(ChainHook::Input).into_rule(0);
        rule.protocol = Some(crate::core::model::Protocol::Tcp);
        rule.port = Some("22".to_string());
        rule.source = Some("10.0.0.0/8".parse().unwrap());
        rule.comment = Some("ssh".to_string());

        store.insert_rule(&rule).unwrap();
        let loaded = store.get_rule(rule.id).unwrap().unwrap();
        assert_eq!(loaded, rule);
    }

    #[test]
    fn test_get_missing_rule_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_rule(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_enabled_rules_ordering() {
        let store = Store::open_in_memory().unwrap();
        let mut r1 = draft(ChainHook::Input).into_rule(1);
        let mut r0 = draft(ChainHook::Input).into_rule(0);
        let mut disabled = draft(ChainHook::Output).into_rule(0);
        r1.comment = Some("second".to_string());
        r0.comment = Some("first".to_string());
        disabled.enabled = false;

        store.insert_rule(&r1).unwrap();
        store.insert_rule(&disabled).unwrap();
        store.insert_rule(&r0).unwrap();

        let rules = store.enabled_rules_ordered().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].comment.as_deref(), Some("first"));
        assert_eq!(rules[1].comment.as_deref(), Some("second"));
    }

    #[test]
    fn test_renumber_group_compacts() {
        let store = Store::open_in_memory().unwrap();
        for order in [0, 3, 7] {
            store
                .insert_rule(&draft(ChainHook::Input).into_rule(order))
                .unwrap();
        }
        store.renumber_group(Table::Filter, ChainHook::Input).unwrap();

        let orders: Vec<i64> = store
            .rules_in_group(Table::Filter, ChainHook::Input)
            .unwrap()
            .iter()
            .map(|r| r.order)
            .collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn test_max_order_empty_group() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.max_order(Table::Filter, ChainHook::Input).unwrap(), None);
    }

    #[test]
    fn test_extension_chain_roundtrip_and_ordering() {
        let store = Store::open_in_memory().unwrap();
        for (name, priority) in [("EXT_B", 20), ("EXT_A", 10)] {
            let chain = ExtensionChain {
                id: Uuid::new_v4(),
                extension_id: "wireguard".to_string(),
                chain_name: name.to_string(),
                parent_chain: ChainHook::Forward,
                table: Table::Filter,
                priority,
                created_at: Utc::now(),
            };
            store.insert_extension_chain(&chain).unwrap();
        }

        let chains = store
            .extension_chains_for(Table::Filter, ChainHook::Forward)
            .unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].chain_name, "EXT_A");
        assert_eq!(chains[1].chain_name, "EXT_B");
    }

    #[test]
    fn test_extension_chain_name_unique() {
        let store = Store::open_in_memory().unwrap();
        let chain = ExtensionChain {
            id: Uuid::new_v4(),
            extension_id: "wireguard".to_string(),
            chain_name: "EXT_WG".to_string(),
            parent_chain: ChainHook::Input,
            table: Table::Filter,
            priority: 50,
            created_at: Utc::now(),
        };
        store.insert_extension_chain(&chain).unwrap();

        let mut duplicate = chain.clone();
        duplicate.id = Uuid::new_v4();
        assert!(store.insert_extension_chain(&duplicate).is_err());
    }

    #[test]
    fn test_replace_all_rules() {
        let store = Store::open_in_memory().unwrap();
        store.insert_rule(&draft(ChainHook::Input).into_rule(0)).unwrap();
        store.insert_rule(&draft(ChainHook::Input).into_rule(1)).unwrap();

        let replacement = vec![draft(ChainHook::Output).into_rule(0)];
        store.replace_all_rules(&replacement).unwrap();

        assert_eq!(store.count_rules().unwrap(), 1);
        let rules = store.list_rules(None, None).unwrap();
        assert_eq!(rules[0].chain, ChainHook::Output);
    }
}
