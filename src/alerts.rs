//! Post-sync low-stock scan.
//!
//! Runs after batches that move inventory, outside the request path. Sums
//! remaining batch quantity per product and records an open alert row when
//! it falls to or below the product's threshold. Delivery (email, push) is
//! someone else's job; this module only maintains the alert records.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

use crate::store::{self, Collection};

const DEFAULT_LOW_STOCK_THRESHOLD: f64 = 5.0;

/// Scan a tenant's products and maintain `inventory_alerts` rows.
///
/// One open alert per product: an existing open alert is refreshed in
/// place, and products back above threshold get theirs resolved. Returns
/// the number of products currently below threshold.
pub fn scan_low_stock(conn: &Connection, tenant_id: &str) -> Result<usize, String> {
    let products = store::find_where(conn, Collection::Products, tenant_id, "is_deleted = 0", &[])
        .map_err(|e| format!("load products: {e}"))?;

    let mut low = 0usize;
    for product in &products {
        let threshold = product
            .data
            .get("lowStockThreshold")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_LOW_STOCK_THRESHOLD);

        let remaining: f64 = conn
            .query_row(
                "SELECT COALESCE(SUM(quantity), 0) FROM product_batches
                 WHERE tenant_id = ?1 AND product_id = ?2 AND is_deleted = 0",
                params![tenant_id, product.server_id],
                |row| row.get(0),
            )
            .map_err(|e| format!("sum batches: {e}"))?;

        if remaining <= threshold {
            low += 1;
            warn!(
                tenant_id,
                product_id = %product.server_id,
                remaining,
                threshold,
                "Product at or below low-stock threshold"
            );
            upsert_alert(conn, tenant_id, &product.server_id, remaining, threshold)?;
        } else {
            resolve_alert(conn, tenant_id, &product.server_id)?;
        }
    }

    debug!(tenant_id, products = products.len(), low, "Low-stock scan complete");
    Ok(low)
}

fn upsert_alert(
    conn: &Connection,
    tenant_id: &str,
    product_id: &str,
    remaining: f64,
    threshold: f64,
) -> Result<(), String> {
    let open: Option<String> = conn
        .query_row(
            "SELECT id FROM inventory_alerts
             WHERE tenant_id = ?1 AND product_id = ?2 AND status = 'open'",
            params![tenant_id, product_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("alert lookup: {e}"))?;

    match open {
        Some(id) => {
            conn.execute(
                "UPDATE inventory_alerts
                 SET remaining = ?2, threshold = ?3, updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, remaining, threshold],
            )
            .map_err(|e| format!("alert refresh: {e}"))?;
        }
        None => {
            conn.execute(
                "INSERT INTO inventory_alerts (tenant_id, product_id, remaining, threshold)
                 VALUES (?1, ?2, ?3, ?4)",
                params![tenant_id, product_id, remaining, threshold],
            )
            .map_err(|e| format!("alert insert: {e}"))?;
        }
    }
    Ok(())
}

fn resolve_alert(conn: &Connection, tenant_id: &str, product_id: &str) -> Result<(), String> {
    conn.execute(
        "UPDATE inventory_alerts SET status = 'resolved', updated_at = datetime('now')
         WHERE tenant_id = ?1 AND product_id = ?2 AND status = 'open'",
        params![tenant_id, product_id],
    )
    .map_err(|e| format!("alert resolve: {e}"))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
