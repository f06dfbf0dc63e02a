//! Running-balance ledgers for customers and suppliers.
//!
//! A party's `dueAmount` is a materialized view, never a source of truth.
//! Recalculation replays every non-deleted ledger entry of the party and
//! overwrites the cached balance. Full replay, not deltas: sync items
//! arrive out of order, get retried, and get edited after the fact, and a
//! replay converges to the same value no matter how the triggers interleave.

use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, warn};

use crate::store::{self, Collection};

/// Entry types that increase what the party owes.
pub const CREDIT_TYPES: &[&str] = &["purchase", "due", "opening_balance", "credit_usage"];
/// Entry types that reduce what the party owes.
pub const DEBIT_TYPES: &[&str] = &["payment", "settlement", "refund", "return", "cancellation"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyKind {
    Customer,
    Supplier,
}

impl PartyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PartyKind::Customer => "customer",
            PartyKind::Supplier => "supplier",
        }
    }

    pub fn collection(self) -> Collection {
        match self {
            PartyKind::Customer => Collection::Customers,
            PartyKind::Supplier => Collection::Suppliers,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "customer" => Some(PartyKind::Customer),
            "supplier" => Some(PartyKind::Supplier),
            _ => None,
        }
    }
}

/// Normalize a wire entry type: offline clients have shipped
/// `openingBalance`, `opening-balance`, and `opening_balance` over the years.
fn normalize_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    for (i, c) in raw.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' || c == ' ' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Replay all non-deleted ledger entries of a party into a single balance
/// and overwrite the party's cached `dueAmount`.
///
/// Returns the new balance. A missing party record is tolerated (entry may
/// sync before its parent); the balance lands once the party record arrives
/// and triggers the defensive recalculation.
pub fn recalculate_balance(
    conn: &Connection,
    tenant_id: &str,
    kind: PartyKind,
    party_id: &str,
) -> Result<f64, String> {
    let entries = store::find_where(
        conn,
        Collection::LedgerEntries,
        tenant_id,
        "party_kind = ?2 AND party_id = ?3 AND is_deleted = 0",
        &[&kind.as_str(), &party_id],
    )
    .map_err(|e| format!("load ledger entries: {e}"))?;

    let mut balance = 0.0;
    for entry in &entries {
        let amount = entry.data.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
        let entry_type = entry
            .data
            .get("type")
            .and_then(Value::as_str)
            .map(normalize_type)
            .unwrap_or_default();

        if CREDIT_TYPES.contains(&entry_type.as_str()) {
            balance += amount;
        } else if DEBIT_TYPES.contains(&entry_type.as_str()) {
            balance -= amount;
        } else {
            debug!(
                tenant_id,
                party_id,
                entry_type = %entry_type,
                "Unknown ledger entry type, contributing nothing"
            );
        }
    }
    let balance = round2(balance);

    match store::find_by_server_id(conn, kind.collection(), tenant_id, party_id) {
        Ok(Some(mut party)) => {
            party.data["dueAmount"] = serde_json::json!(balance);
            party.updated_at = chrono::Utc::now().to_rfc3339();
            store::save(conn, kind.collection(), &party)
                .map_err(|e| format!("save {} balance: {e}", kind.as_str()))?;
            debug!(
                tenant_id,
                party_id,
                entries = entries.len(),
                balance,
                "Recalculated ledger balance"
            );
        }
        Ok(None) => {
            warn!(
                tenant_id,
                party_id,
                kind = kind.as_str(),
                "Ledger recalculation for unknown party, balance not cached"
            );
        }
        Err(e) => return Err(format!("load party: {e}")),
    }

    Ok(balance)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::store::Doc;
    use chrono::Utc;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn
    }

    fn seed_party(conn: &Connection, tenant: &str, kind: PartyKind, id: &str, cached: f64) {
        let now = Utc::now().to_rfc3339();
        store::save(
            conn,
            kind.collection(),
            &Doc {
                server_id: id.to_string(),
                tenant_id: tenant.to_string(),
                local_id: None,
                is_deleted: false,
                created_at: now.clone(),
                updated_at: now,
                data: serde_json::json!({ "name": id, "dueAmount": cached }),
            },
        )
        .unwrap();
    }

    fn seed_entry(
        conn: &Connection,
        tenant: &str,
        id: &str,
        kind: PartyKind,
        party: &str,
        entry_type: &str,
        amount: f64,
        deleted: bool,
    ) {
        let now = Utc::now().to_rfc3339();
        store::save(
            conn,
            Collection::LedgerEntries,
            &Doc {
                server_id: id.to_string(),
                tenant_id: tenant.to_string(),
                local_id: None,
                is_deleted: deleted,
                created_at: now.clone(),
                updated_at: now,
                data: serde_json::json!({
                    "partyKind": kind.as_str(),
                    "partyId": party,
                    "type": entry_type,
                    "amount": amount,
                }),
            },
        )
        .unwrap();
    }

    fn cached_due(conn: &Connection, kind: PartyKind, id: &str) -> f64 {
        let table = kind.collection().table();
        conn.query_row(
            &format!("SELECT due_amount FROM {table} WHERE server_id = ?1"),
            [id],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_balance_is_credits_minus_debits() {
        let conn = test_conn();
        seed_party(&conn, "t1", PartyKind::Customer, "c1", 0.0);
        seed_entry(&conn, "t1", "e1", PartyKind::Customer, "c1", "due", 100.0, false);
        seed_entry(&conn, "t1", "e2", PartyKind::Customer, "c1", "opening_balance", 50.0, false);
        seed_entry(&conn, "t1", "e3", PartyKind::Customer, "c1", "payment", 30.0, false);

        let balance = recalculate_balance(&conn, "t1", PartyKind::Customer, "c1").unwrap();
        assert_eq!(balance, 120.0);
        assert_eq!(cached_due(&conn, PartyKind::Customer, "c1"), 120.0);
    }

    #[test]
    fn test_deleted_entries_are_ignored() {
        let conn = test_conn();
        seed_party(&conn, "t1", PartyKind::Supplier, "s1", 0.0);
        seed_entry(&conn, "t1", "e1", PartyKind::Supplier, "s1", "purchase", 200.0, false);
        seed_entry(&conn, "t1", "e2", PartyKind::Supplier, "s1", "purchase", 999.0, true);

        let balance = recalculate_balance(&conn, "t1", PartyKind::Supplier, "s1").unwrap();
        assert_eq!(balance, 200.0);
    }

    #[test]
    fn test_replay_overwrites_stale_cache() {
        let conn = test_conn();
        // Cached balance is wrong on purpose; replay must win.
        seed_party(&conn, "t1", PartyKind::Customer, "c2", 9999.0);
        seed_entry(&conn, "t1", "e1", PartyKind::Customer, "c2", "due", 10.0, false);

        let balance = recalculate_balance(&conn, "t1", PartyKind::Customer, "c2").unwrap();
        assert_eq!(balance, 10.0);
        assert_eq!(cached_due(&conn, PartyKind::Customer, "c2"), 10.0);
    }

    #[test]
    fn test_recalculation_is_order_independent() {
        let conn = test_conn();
        seed_party(&conn, "t1", PartyKind::Customer, "c3", 0.0);
        seed_party(&conn, "t1", PartyKind::Customer, "c4", 0.0);

        // Same entry set, inserted in different orders.
        for (party, order) in [("c3", [0usize, 1, 2, 3]), ("c4", [3, 1, 0, 2])] {
            let entries = [
                ("due", 40.0),
                ("payment", 15.0),
                ("credit_usage", 5.5),
                ("refund", 10.0),
            ];
            for (i, idx) in order.iter().enumerate() {
                let (t, amt) = entries[*idx];
                seed_entry(
                    &conn,
                    "t1",
                    &format!("{party}-{i}"),
                    PartyKind::Customer,
                    party,
                    t,
                    amt,
                    false,
                );
            }
        }

        let b3 = recalculate_balance(&conn, "t1", PartyKind::Customer, "c3").unwrap();
        let b4 = recalculate_balance(&conn, "t1", PartyKind::Customer, "c4").unwrap();
        assert_eq!(b3, b4);
        assert_eq!(b3, 20.5);
    }

    #[test]
    fn test_rerunning_converges_to_same_value() {
        let conn = test_conn();
        seed_party(&conn, "t1", PartyKind::Customer, "c5", 0.0);
        seed_entry(&conn, "t1", "e1", PartyKind::Customer, "c5", "due", 33.333, false);

        let first = recalculate_balance(&conn, "t1", PartyKind::Customer, "c5").unwrap();
        let second = recalculate_balance(&conn, "t1", PartyKind::Customer, "c5").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, 33.33); // rounded to 2 decimals
    }

    #[test]
    fn test_camel_case_entry_types_are_normalized() {
        let conn = test_conn();
        seed_party(&conn, "t1", PartyKind::Customer, "c6", 0.0);
        seed_entry(&conn, "t1", "e1", PartyKind::Customer, "c6", "openingBalance", 25.0, false);
        seed_entry(&conn, "t1", "e2", PartyKind::Customer, "c6", "creditUsage", 5.0, false);

        let balance = recalculate_balance(&conn, "t1", PartyKind::Customer, "c6").unwrap();
        assert_eq!(balance, 30.0);
    }

    #[test]
    fn test_unknown_types_contribute_nothing() {
        let conn = test_conn();
        seed_party(&conn, "t1", PartyKind::Customer, "c7", 0.0);
        seed_entry(&conn, "t1", "e1", PartyKind::Customer, "c7", "due", 10.0, false);
        seed_entry(&conn, "t1", "e2", PartyKind::Customer, "c7", "mystery", 1000.0, false);

        let balance = recalculate_balance(&conn, "t1", PartyKind::Customer, "c7").unwrap();
        assert_eq!(balance, 10.0);
    }

    #[test]
    fn test_missing_party_still_returns_balance() {
        let conn = test_conn();
        seed_entry(&conn, "t1", "e1", PartyKind::Customer, "ghost", "due", 12.0, false);

        let balance = recalculate_balance(&conn, "t1", PartyKind::Customer, "ghost").unwrap();
        assert_eq!(balance, 12.0);
    }
}
