//! Sync batch orchestration.
//!
//! A batch is one tenant's items for one channel. Items run strictly
//! sequentially: later items may reference entities created earlier in the
//! same batch (a product after its category), so there is no intra-batch
//! parallelism. One item's failure is caught at the item boundary and
//! recorded; the batch always runs to the end and reports per-item results.
//!
//! Two channels are mixed: `customers` also carries customer ledger
//! entries, `suppliers` carries supplier ledger entries. Items declare
//! themselves with a `recordType` tag; payloads from clients that predate
//! the tag are classified by field shape. Parties are always reconciled
//! before ledger entries, whatever the input order, so an entry can land in
//! the same batch as the party it belongs to.

use std::sync::Arc;

use rusqlite::params;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::alerts;
use crate::db::DbState;
use crate::reconcile::{self, EntityKind};
use crate::value_str;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// Sync endpoint a batch arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Customers,
    Suppliers,
    Products,
    Categories,
    InventoryBatches,
    Orders,
    Refunds,
    VendorOrders,
    Transactions,
}

impl Channel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "customer" | "customers" => Some(Channel::Customers),
            "supplier" | "suppliers" => Some(Channel::Suppliers),
            "product" | "products" => Some(Channel::Products),
            "category" | "categories" => Some(Channel::Categories),
            "batch" | "batches" | "inventory" => Some(Channel::InventoryBatches),
            "order" | "orders" => Some(Channel::Orders),
            "refund" | "refunds" => Some(Channel::Refunds),
            "vendor-order" | "vendor-orders" | "vendor_orders" => Some(Channel::VendorOrders),
            "transaction" | "transactions" => Some(Channel::Transactions),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Customers => "customers",
            Channel::Suppliers => "suppliers",
            Channel::Products => "products",
            Channel::Categories => "categories",
            Channel::InventoryBatches => "batches",
            Channel::Orders => "orders",
            Channel::Refunds => "refunds",
            Channel::VendorOrders => "vendor-orders",
            Channel::Transactions => "transactions",
        }
    }

    /// Channels after which remaining stock may have changed.
    fn moves_stock(self) -> bool {
        matches!(
            self,
            Channel::Orders | Channel::Refunds | Channel::InventoryBatches | Channel::Products
        )
    }
}

/// Classify one item of a channel into the entity kind that reconciles it.
fn classify(channel: Channel, item: &Value) -> EntityKind {
    match channel {
        Channel::Customers => mixed_kind(
            item,
            EntityKind::Customer,
            EntityKind::CustomerLedger,
            "customerId",
            "customer",
        ),
        Channel::Suppliers => mixed_kind(
            item,
            EntityKind::Supplier,
            EntityKind::SupplierLedger,
            "supplierId",
            "supplier",
        ),
        Channel::Products => EntityKind::Product,
        Channel::Categories => EntityKind::Category,
        Channel::InventoryBatches => EntityKind::InventoryBatch,
        Channel::Orders => EntityKind::Order,
        Channel::Refunds => EntityKind::Refund,
        Channel::VendorOrders => EntityKind::VendorOrder,
        Channel::Transactions => EntityKind::Transaction,
    }
}

fn mixed_kind(
    item: &Value,
    party: EntityKind,
    entry: EntityKind,
    party_key: &str,
    party_tag: &str,
) -> EntityKind {
    match value_str(item, &["recordType"]).as_deref() {
        Some("ledgerEntry" | "ledger-entry" | "ledger_entry") => return entry,
        // Only this channel's own party tag counts; a foreign tag is a
        // client bug and falls through to shape classification.
        Some(tag) if tag == party_tag || tag == "party" => return party,
        Some(other) => {
            debug!(record_type = other, "Unknown recordType tag, classifying by shape");
        }
        None => {}
    }
    // Pre-tag clients: a ledger entry is the only record on these channels
    // carrying a type, an amount, and a party reference together.
    let has_party_ref = item.get("partyId").is_some() || item.get(party_key).is_some();
    if item.get("type").is_some() && item.get("amount").is_some() && has_party_ref {
        entry
    } else {
        party
    }
}

/// Ledger entries reconcile after the parties they reference.
fn child_rank(kind: EntityKind) -> u8 {
    match kind {
        EntityKind::CustomerLedger | EntityKind::SupplierLedger => 1,
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Batch processing
// ---------------------------------------------------------------------------

/// Process one sync batch and build the per-item report.
///
/// Holds the connection for the whole batch. Never fails on an item's
/// account; the only hard error is losing the database itself.
pub fn sync_batch(
    db: &Arc<DbState>,
    tenant_id: &str,
    channel: Channel,
    items: &[Value],
) -> Result<Value, String> {
    let mut success = Vec::new();
    let mut failed = Vec::new();

    {
        let conn = db
            .conn
            .lock()
            .map_err(|_| "Database connection poisoned".to_string())?;

        let mut ordered: Vec<(EntityKind, &Value)> =
            items.iter().map(|item| (classify(channel, item), item)).collect();
        // Stable: input order is preserved within each rank.
        ordered.sort_by_key(|(kind, _)| child_rank(*kind));

        for (kind, item) in ordered {
            match reconcile::reconcile_item(&conn, tenant_id, kind, item) {
                Ok(outcome) => {
                    success.push(json!({
                        "id": outcome.local_id,
                        "_id": outcome.server_id,
                        "action": outcome.action.as_str(),
                    }));
                }
                Err(error) => {
                    warn!(
                        tenant_id,
                        kind = ?kind,
                        local_id = value_str(item, &["id", "localId"]).as_deref(),
                        error = %error,
                        "Sync item failed"
                    );
                    failed.push(json!({
                        "id": value_str(item, &["id", "localId"]),
                        "error": error,
                    }));
                }
            }
        }

        // Fire-and-forget: a watermark miss must never fail a batch the
        // items already survived.
        if let Err(e) = record_watermark(&conn, tenant_id, channel.as_str(), success.len() as i64) {
            warn!(tenant_id, channel = channel.as_str(), "Watermark update failed: {e}");
        }
    }

    if channel.moves_stock() {
        schedule_alert_scan(db, tenant_id);
    }

    info!(
        tenant_id,
        channel = channel.as_str(),
        total = items.len(),
        successful = success.len(),
        failed = failed.len(),
        "Sync batch processed"
    );

    Ok(json!({
        "success": true,
        "results": { "success": success, "failed": failed },
        "summary": {
            "total": items.len(),
            "successful": success.len(),
            "failed": failed.len(),
        },
    }))
}

/// Advance the tenant's cumulative sync watermark for a channel.
fn record_watermark(
    conn: &rusqlite::Connection,
    tenant_id: &str,
    entity_type: &str,
    successful: i64,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO sync_state (tenant_id, entity_type, last_count)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(tenant_id, entity_type) DO UPDATE SET
             last_count = last_count + ?3,
             updated_at = datetime('now')",
        params![tenant_id, entity_type, successful],
    )
    .map_err(|e| format!("sync_state upsert: {e}"))?;
    Ok(())
}

/// Latest watermark for a tenant/channel, 0 when never synced.
pub fn watermark(conn: &rusqlite::Connection, tenant_id: &str, entity_type: &str) -> i64 {
    conn.query_row(
        "SELECT last_count FROM sync_state WHERE tenant_id = ?1 AND entity_type = ?2",
        params![tenant_id, entity_type],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Queue a low-stock scan to run after the response is returned. Outside a
/// runtime (tests, CLI tools) the scan is skipped; it is advisory only.
fn schedule_alert_scan(db: &Arc<DbState>, tenant_id: &str) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!(tenant_id, "No async runtime, skipping low-stock scan");
        return;
    };
    let db = Arc::clone(db);
    let tenant = tenant_id.to_string();
    handle.spawn(async move {
        let Ok(conn) = db.conn.lock() else {
            return;
        };
        if let Err(e) = alerts::scan_low_stock(&conn, &tenant) {
            warn!(tenant_id = %tenant, "Low-stock scan failed: {e}");
        }
    });
}

// ===========================================================================
// Tests
// ===========================================================================
