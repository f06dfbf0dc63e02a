//! Offline-first sync reconciliation engine for a multi-tenant retail
//! back office.
//!
//! Client devices work offline for arbitrary periods and push batches of
//! locally-authored records (customers, products, inventory batches,
//! orders, refunds, vendor orders, ledger transactions). This crate merges
//! those batches into the canonical per-tenant dataset: resolving records
//! across the client-local and server identifier spaces, applying
//! idempotent create/update/delete semantics under retries and concurrent
//! devices, deducting order stock from FEFO/FIFO inventory batches exactly
//! once, and replaying ledgers into authoritative party balances.
//!
//! Entry points: [`db::init`] to open the store, [`sync::sync_batch`] to
//! process a batch.

use serde_json::Value;

pub mod alerts;
pub mod db;
pub mod ledger;
pub mod orders;
pub mod quota;
pub mod reconcile;
pub mod refunds;
pub mod resolve;
pub mod stock;
pub mod store;
pub mod sync;

/// Install the global tracing subscriber. Filter comes from `RUST_LOG`,
/// defaulting to `info`. Safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// First non-empty string under any of `keys`. Client payloads are loosely
/// typed JSON; these helpers are the one place that tolerance lives.
pub(crate) fn value_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    })
}

/// Truthiness of the first present key: JSON `true`, nonzero number, or
/// the strings `"true"`/`"1"`.
pub(crate) fn value_bool(value: &Value, keys: &[&str]) -> bool {
    for key in keys {
        match value.get(key) {
            Some(Value::Bool(b)) => return *b,
            Some(Value::Number(n)) => return n.as_f64().unwrap_or(0.0) != 0.0,
            Some(Value::String(s)) => return s == "true" || s == "1",
            Some(_) => return false,
            None => continue,
        }
    }
    false
}
