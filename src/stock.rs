//! Batch-based inventory allocation.
//!
//! Deductions walk a product's batches in FEFO order (soonest expiry first)
//! when the product tracks expiry, FIFO (oldest arrival first) otherwise.
//! Each touched batch is persisted individually so partial progress
//! survives a crash mid-loop. Allocation is best-effort: exhausting all
//! batches before the requested quantity is covered absorbs the shortfall
//! instead of failing the sale — an offline device already committed to it,
//! and rejecting after the fact is worse than a stock discrepancy that the
//! reports surface later. The shortfall is reported, not hidden.
//!
//! Restocks (refund returns, order cancellations) go to a single batch
//! chosen by policy; the origin batch of a sold unit is not reliably
//! recoverable, so quantity is never redistributed.

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{self, Collection, Doc};

/// One batch touched by a deduction, with the cost captured for margin
/// snapshotting on the order line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumedBatch {
    pub batch_id: String,
    pub quantity: f64,
    pub cost_price: Option<f64>,
}

/// Result of a single-product deduction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deduction {
    pub product_id: String,
    pub requested: f64,
    pub deducted: f64,
    pub shortfall: f64,
    pub consumed: Vec<ConsumedBatch>,
}

/// Which batch receives returned quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestockPolicy {
    /// Refund return: most recently created batch (LIFO-return).
    RefundReturn,
    /// Order cancellation: latest expiry, then most recent creation.
    Cancellation,
}

fn batch_quantity(doc: &Doc) -> f64 {
    doc.data.get("quantity").and_then(Value::as_f64).unwrap_or(0.0)
}

fn batch_expiry(doc: &Doc) -> Option<String> {
    doc.data
        .get("expiry")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Whether deductions for this product walk batches by expiry (FEFO) or by
/// arrival (FIFO). The product's `trackExpiry` flag decides; when the
/// product record is missing (unsynced parent), any batch carrying an
/// expiry is taken as evidence of expiry tracking.
fn uses_fefo(conn: &Connection, tenant_id: &str, product_id: &str, batches: &[Doc]) -> bool {
    if let Ok(Some(product)) =
        store::find_by_server_id(conn, Collection::Products, tenant_id, product_id)
    {
        return matches!(product.data.get("trackExpiry"), Some(Value::Bool(true)))
            || product
                .data
                .get("trackExpiry")
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
                != 0.0;
    }
    batches.iter().any(|b| batch_expiry(b).is_some())
}

/// Deduct `quantity` of a product from its batches.
///
/// Fetches non-deleted batches with positive quantity, orders them FEFO or
/// FIFO, and drains each in turn. Touched batches are saved one by one.
pub fn deduct(
    conn: &Connection,
    tenant_id: &str,
    product_id: &str,
    quantity: f64,
) -> Result<Deduction, String> {
    let mut batches = store::find_where(
        conn,
        Collection::ProductBatches,
        tenant_id,
        "product_id = ?2 AND is_deleted = 0 AND quantity > 0",
        &[&product_id],
    )
    .map_err(|e| format!("load batches: {e}"))?;

    if uses_fefo(conn, tenant_id, product_id, &batches) {
        // Soonest expiry first; batches without an expiry go last.
        batches.sort_by(|a, b| {
            match (batch_expiry(a), batch_expiry(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.created_at.cmp(&b.created_at),
            }
        });
    } else {
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    }

    let mut remaining = quantity;
    let mut consumed = Vec::new();
    let now = Utc::now().to_rfc3339();

    for mut batch in batches {
        if remaining <= 0.0 {
            break;
        }
        let available = batch_quantity(&batch);
        let take = available.min(remaining);
        if take <= 0.0 {
            continue;
        }

        batch.data["quantity"] = serde_json::json!(available - take);
        batch.updated_at = now.clone();
        store::save(conn, Collection::ProductBatches, &batch)
            .map_err(|e| format!("save batch {}: {e}", batch.server_id))?;

        consumed.push(ConsumedBatch {
            batch_id: batch.server_id.clone(),
            quantity: take,
            cost_price: batch.data.get("costPrice").and_then(Value::as_f64),
        });
        remaining -= take;
    }

    let deducted = quantity - remaining.max(0.0);
    let shortfall = remaining.max(0.0);
    if shortfall > 0.0 {
        warn!(
            tenant_id,
            product_id,
            requested = quantity,
            shortfall,
            "Batches exhausted, absorbing shortfall"
        );
    } else {
        debug!(tenant_id, product_id, deducted, "Stock deducted");
    }

    Ok(Deduction {
        product_id: product_id.to_string(),
        requested: quantity,
        deducted,
        shortfall,
        consumed,
    })
}

/// Return `quantity` of a product to a single batch chosen by `policy`.
///
/// When the product has no batches at all, a synthetic return batch is
/// created so the quantity is not lost. Returns the receiving batch id.
pub fn restock(
    conn: &Connection,
    tenant_id: &str,
    product_id: &str,
    quantity: f64,
    policy: RestockPolicy,
) -> Result<String, String> {
    if quantity <= 0.0 {
        return Err(format!("Restock quantity must be positive, got {quantity}"));
    }

    let mut batches = store::find_where(
        conn,
        Collection::ProductBatches,
        tenant_id,
        "product_id = ?2 AND is_deleted = 0",
        &[&product_id],
    )
    .map_err(|e| format!("load batches: {e}"))?;

    let now = Utc::now().to_rfc3339();

    let target = match policy {
        RestockPolicy::RefundReturn => {
            batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            batches.into_iter().next()
        }
        RestockPolicy::Cancellation => {
            batches.sort_by(|a, b| {
                let exp = batch_expiry(b).cmp(&batch_expiry(a)); // latest expiry first, None last
                exp.then_with(|| b.created_at.cmp(&a.created_at))
            });
            batches.into_iter().next()
        }
    };

    if let Some(mut batch) = target {
        let qty = batch_quantity(&batch) + quantity;
        batch.data["quantity"] = serde_json::json!(qty);
        batch.updated_at = now;
        store::save(conn, Collection::ProductBatches, &batch)
            .map_err(|e| format!("save batch {}: {e}", batch.server_id))?;
        debug!(tenant_id, product_id, batch_id = %batch.server_id, quantity, "Restocked");
        return Ok(batch.server_id);
    }

    // No batch to receive the return: mint one rather than dropping quantity.
    let batch_id = Uuid::new_v4().to_string();
    let doc = Doc {
        server_id: batch_id.clone(),
        tenant_id: tenant_id.to_string(),
        local_id: None,
        is_deleted: false,
        created_at: now.clone(),
        updated_at: now,
        data: serde_json::json!({
            "productId": product_id,
            "quantity": quantity,
            "returnBatch": true,
        }),
    };
    store::save(conn, Collection::ProductBatches, &doc)
        .map_err(|e| format!("create return batch: {e}"))?;
    warn!(tenant_id, product_id, batch_id = %batch_id, quantity, "No batch to restock, created return batch");
    Ok(batch_id)
}

// ===========================================================================
// Tests
// ===========================================================================
