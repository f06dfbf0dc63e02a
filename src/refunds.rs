//! Refund reconciliation.
//!
//! A refund is meaningless without its order: the order is where refundable
//! quantities come from, so an unresolvable order reference fails the item
//! and the client retries after the order has synced. Quantities are capped
//! per product at what the order sold minus what earlier refunds already
//! returned, across every device that refunded against the same order.
//!
//! Stock moves exactly once, at creation, into the newest batch of each
//! product. Updates merge fields without touching inventory, and deletion
//! tombstones the refund for the audit trail without clawing stock back —
//! the goods are physically on the shelf either way.

use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::reconcile::{
    creation_timestamp, item_ids, merge_payload, payload_fields, Action, ItemIds, SyncOutcome,
};
use crate::resolve;
use crate::stock::{self, RestockPolicy};
use crate::store::{self, Collection, Doc};
use crate::value_str;

pub fn reconcile_refund(
    conn: &Connection,
    tenant_id: &str,
    item: &Value,
) -> Result<SyncOutcome, String> {
    let ids = item_ids(item);

    if ids.is_deleted {
        return delete_refund(conn, tenant_id, &ids);
    }

    let existing = resolve::resolve(
        conn,
        Collection::Refunds,
        tenant_id,
        ids.local_id.as_deref(),
        ids.server_id.as_deref(),
    )
    .map_err(|e| format!("resolve refund: {e}"))?;

    match existing {
        Some(mut doc) => {
            merge_payload(&mut doc.data, item);
            resolve_line_products(conn, tenant_id, &mut doc.data)?;

            // An edit is bound by the same cap as a creation; the refund's
            // own stored quantities are excluded so an unchanged re-sync
            // still passes.
            let order = load_order(conn, tenant_id, &mut doc.data)?;
            validate_quantities(conn, tenant_id, &order, &doc.data, Some(&doc.server_id))?;

            if doc.local_id.is_none() {
                doc.local_id = ids.local_id.clone();
            }
            doc.is_deleted = false;
            doc.updated_at = Utc::now().to_rfc3339();
            store::save(conn, Collection::Refunds, &doc)
                .map_err(|e| format!("save refund: {e}"))?;
            Ok(SyncOutcome {
                local_id: doc.local_id,
                server_id: Some(doc.server_id),
                action: Action::Updated,
            })
        }
        None => create_refund(conn, tenant_id, item, &ids),
    }
}

fn create_refund(
    conn: &Connection,
    tenant_id: &str,
    item: &Value,
    ids: &ItemIds,
) -> Result<SyncOutcome, String> {
    let mut data = Value::Object(payload_fields(item));

    let order = load_order(conn, tenant_id, &mut data)?;
    resolve_line_products(conn, tenant_id, &mut data)?;
    validate_quantities(conn, tenant_id, &order, &data, None)?;

    let server_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let doc = Doc {
        server_id: server_id.clone(),
        tenant_id: tenant_id.to_string(),
        local_id: ids.local_id.clone(),
        is_deleted: false,
        created_at: creation_timestamp(item),
        updated_at: now,
        data,
    };
    store::save(conn, Collection::Refunds, &doc).map_err(|e| format!("save refund: {e}"))?;

    restock_refund_lines(conn, tenant_id, &doc)?;

    info!(tenant_id, server_id = %server_id, order_id = %order.server_id, "Refund created");
    Ok(SyncOutcome {
        local_id: ids.local_id.clone(),
        server_id: Some(server_id),
        action: Action::Created,
    })
}

fn delete_refund(
    conn: &Connection,
    tenant_id: &str,
    ids: &ItemIds,
) -> Result<SyncOutcome, String> {
    let existing = resolve::resolve(
        conn,
        Collection::Refunds,
        tenant_id,
        ids.local_id.as_deref(),
        ids.server_id.as_deref(),
    )
    .map_err(|e| format!("resolve refund: {e}"))?;

    match existing {
        Some(doc) if !doc.is_deleted => {
            let now = Utc::now().to_rfc3339();
            store::mark_deleted(conn, Collection::Refunds, tenant_id, &doc.server_id, &now)
                .map_err(|e| format!("delete refund: {e}"))?;
            info!(tenant_id, server_id = %doc.server_id, "Refund deleted");
            Ok(SyncOutcome {
                local_id: doc.local_id.or_else(|| ids.local_id.clone()),
                server_id: Some(doc.server_id),
                action: Action::Deleted,
            })
        }
        _ => Ok(SyncOutcome {
            local_id: ids.local_id.clone(),
            server_id: ids.server_id.clone(),
            action: Action::Deleted,
        }),
    }
}

/// Resolve the refund's order reference and load the order, rewriting
/// `orderId` in `data` to the server id.
fn load_order(conn: &Connection, tenant_id: &str, data: &mut Value) -> Result<Doc, String> {
    let order_token = value_str(data, &["orderId"]);
    let order_id =
        resolve::resolve_ref_id(conn, Collection::Orders, tenant_id, order_token.as_deref())
            .map_err(|e| format!("resolve order: {e}"))?
            .ok_or_else(|| format!("Unresolved order reference {:?} for refund", order_token))?;
    data["orderId"] = Value::String(order_id.clone());

    store::find_by_server_id(conn, Collection::Orders, tenant_id, &order_id)
        .map_err(|e| format!("load order: {e}"))?
        .ok_or_else(|| format!("Order {order_id} vanished during refund"))
}

// ---------------------------------------------------------------------------
// Lines
// ---------------------------------------------------------------------------

fn line_qty(line: &Value) -> f64 {
    line.get("quantity").and_then(Value::as_f64).unwrap_or(0.0)
}

/// Rewrite line product tokens to server ids so they compare against the
/// order's (already resolved) lines. Unresolvable products stay as-is and
/// are matched against `dProductId` order lines.
fn resolve_line_products(
    conn: &Connection,
    tenant_id: &str,
    data: &mut Value,
) -> Result<(), String> {
    let Some(lines) = data.get_mut("items").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    for line in lines.iter_mut() {
        let Some(token) = value_str(line, &["productId"]) else {
            continue;
        };
        if let Some(sid) =
            resolve::resolve_ref_id(conn, Collection::Products, tenant_id, Some(&token))
                .map_err(|e| format!("resolve product: {e}"))?
        {
            line["productId"] = Value::String(sid);
        }
    }
    Ok(())
}

/// Per-product key of an order or refund line. Deleted products keep their
/// last-known id in `dProductId`, so both slots participate.
fn line_product_key(line: &Value) -> Option<String> {
    value_str(line, &["productId"]).or_else(|| value_str(line, &["dProductId"]))
}

/// Enforce: refunded quantity per product never exceeds what the order sold
/// minus what other (non-deleted) refunds of the same order returned.
/// `exclude_refund` skips one refund's stored lines, so a refund being
/// edited is capped against everyone else but not its own previous state.
fn validate_quantities(
    conn: &Connection,
    tenant_id: &str,
    order: &Doc,
    refund_data: &Value,
    exclude_refund: Option<&str>,
) -> Result<(), String> {
    let mut ordered: HashMap<String, f64> = HashMap::new();
    if let Some(lines) = order.data.get("items").and_then(Value::as_array) {
        for line in lines {
            if let Some(key) = line_product_key(line) {
                *ordered.entry(key).or_insert(0.0) += line_qty(line);
            }
        }
    }

    let prior = store::find_where(
        conn,
        Collection::Refunds,
        tenant_id,
        "order_id = ?2 AND is_deleted = 0",
        &[&order.server_id.as_str()],
    )
    .map_err(|e| format!("load prior refunds: {e}"))?;
    let mut refunded: HashMap<String, f64> = HashMap::new();
    for refund in &prior {
        if exclude_refund == Some(refund.server_id.as_str()) {
            continue;
        }
        if let Some(lines) = refund.data.get("items").and_then(Value::as_array) {
            for line in lines {
                if let Some(key) = line_product_key(line) {
                    *refunded.entry(key).or_insert(0.0) += line_qty(line);
                }
            }
        }
    }

    if let Some(lines) = refund_data.get("items").and_then(Value::as_array) {
        for line in lines {
            let Some(key) = line_product_key(line) else {
                continue;
            };
            let qty = line_qty(line);
            let sold = ordered.get(&key).copied().unwrap_or(0.0);
            let already = refunded.get(&key).copied().unwrap_or(0.0);
            if qty > sold - already {
                return Err(format!(
                    "Refund quantity {qty} for product {key} exceeds refundable {} on order {}",
                    sold - already,
                    order.server_id
                ));
            }
        }
    }
    Ok(())
}

fn restock_refund_lines(conn: &Connection, tenant_id: &str, doc: &Doc) -> Result<(), String> {
    let Some(lines) = doc.data.get("items").and_then(Value::as_array) else {
        return Ok(());
    };
    for line in lines {
        let Some(token) = value_str(line, &["productId"]) else {
            continue;
        };
        // A product that no longer exists cannot receive stock back.
        let Some(product_id) =
            resolve::resolve_ref_id(conn, Collection::Products, tenant_id, Some(&token))
                .map_err(|e| format!("resolve product: {e}"))?
        else {
            warn!(tenant_id, token = %token, "Refund line product unknown, not restocked");
            continue;
        };
        let qty = line_qty(line);
        if qty <= 0.0 {
            continue;
        }
        stock::restock(conn, tenant_id, &product_id, qty, RestockPolicy::RefundReturn)?;
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::reconcile::{reconcile_item, EntityKind};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn
    }

    /// Seed a product (uuid id), one batch, and a deducted order for 5 units.
    /// Returns (product_id, batch_id, order server id).
    fn seed_order(conn: &Connection, tenant: &str) -> (String, String, String) {
        let product_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        store::save(
            conn,
            Collection::Products,
            &Doc {
                server_id: product_id.clone(),
                tenant_id: tenant.to_string(),
                local_id: None,
                is_deleted: false,
                created_at: now.clone(),
                updated_at: now.clone(),
                data: serde_json::json!({ "name": "Widget", "trackExpiry": false }),
            },
        )
        .unwrap();

        let batch_id = Uuid::new_v4().to_string();
        store::save(
            conn,
            Collection::ProductBatches,
            &Doc {
                server_id: batch_id.clone(),
                tenant_id: tenant.to_string(),
                local_id: None,
                is_deleted: false,
                created_at: now.clone(),
                updated_at: now.clone(),
                data: serde_json::json!({ "productId": product_id, "quantity": 20.0, "costPrice": 1.0 }),
            },
        )
        .unwrap();

        let order = serde_json::json!({
            "id": "ord-r",
            "totalAmount": 10.0,
            "stockDeducted": false,
            "items": [
                { "productId": product_id, "name": "Widget", "quantity": 5.0, "price": 2.0 }
            ],
        });
        let outcome = reconcile_item(conn, tenant, EntityKind::Order, &order).unwrap();
        (product_id, batch_id, outcome.server_id.unwrap())
    }

    fn batch_qty(conn: &Connection, id: &str) -> f64 {
        conn.query_row(
            "SELECT quantity FROM product_batches WHERE server_id = ?1",
            [id],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_refund_restocks_and_is_idempotent() {
        let conn = test_conn();
        let (product_id, batch_id, _) = seed_order(&conn, "t1");
        assert_eq!(batch_qty(&conn, &batch_id), 15.0);

        let refund = serde_json::json!({
            "id": "ref-1",
            "orderId": "ord-r",
            "totalAmount": 4.0,
            "items": [ { "productId": product_id, "quantity": 2.0, "price": 2.0 } ],
        });
        let first = reconcile_item(&conn, "t1", EntityKind::Refund, &refund).unwrap();
        assert_eq!(first.action, Action::Created);
        assert_eq!(batch_qty(&conn, &batch_id), 17.0);

        // Retry: update, no second restock.
        let second = reconcile_item(&conn, "t1", EntityKind::Refund, &refund).unwrap();
        assert_eq!(second.action, Action::Updated);
        assert_eq!(batch_qty(&conn, &batch_id), 17.0);
    }

    #[test]
    fn test_refund_without_resolvable_order_fails() {
        let conn = test_conn();
        let refund = serde_json::json!({
            "id": "ref-2",
            "orderId": "never-synced",
            "items": [],
        });
        let err = reconcile_item(&conn, "t1", EntityKind::Refund, &refund).unwrap_err();
        assert!(err.contains("Unresolved order"));
        assert_eq!(store::count(&conn, Collection::Refunds, "t1", true).unwrap(), 0);
    }

    #[test]
    fn test_refund_cannot_exceed_ordered_quantity() {
        let conn = test_conn();
        let (product_id, batch_id, _) = seed_order(&conn, "t1");

        let refund = serde_json::json!({
            "id": "ref-3",
            "orderId": "ord-r",
            "items": [ { "productId": product_id, "quantity": 6.0 } ],
        });
        let err = reconcile_item(&conn, "t1", EntityKind::Refund, &refund).unwrap_err();
        assert!(err.contains("exceeds refundable"));
        assert_eq!(batch_qty(&conn, &batch_id), 15.0);
    }

    #[test]
    fn test_refundable_quantity_shrinks_with_prior_refunds() {
        let conn = test_conn();
        let (product_id, _, _) = seed_order(&conn, "t1");

        let first = serde_json::json!({
            "id": "ref-4a",
            "orderId": "ord-r",
            "items": [ { "productId": product_id, "quantity": 3.0 } ],
        });
        reconcile_item(&conn, "t1", EntityKind::Refund, &first).unwrap();

        // 3 of 5 already returned; another 3 (from a second device) must fail.
        let second = serde_json::json!({
            "id": "ref-4b",
            "orderId": "ord-r",
            "items": [ { "productId": product_id, "quantity": 3.0 } ],
        });
        let err = reconcile_item(&conn, "t1", EntityKind::Refund, &second).unwrap_err();
        assert!(err.contains("exceeds refundable"));

        // The remaining 2 are fine.
        let third = serde_json::json!({
            "id": "ref-4c",
            "orderId": "ord-r",
            "items": [ { "productId": product_id, "quantity": 2.0 } ],
        });
        let outcome = reconcile_item(&conn, "t1", EntityKind::Refund, &third).unwrap();
        assert_eq!(outcome.action, Action::Created);
    }

    #[test]
    fn test_deleted_refund_frees_refundable_quantity() {
        let conn = test_conn();
        let (product_id, _, _) = seed_order(&conn, "t1");

        reconcile_item(
            &conn,
            "t1",
            EntityKind::Refund,
            &serde_json::json!({
                "id": "ref-5a",
                "orderId": "ord-r",
                "items": [ { "productId": product_id, "quantity": 5.0 } ],
            }),
        )
        .unwrap();
        reconcile_item(
            &conn,
            "t1",
            EntityKind::Refund,
            &serde_json::json!({ "id": "ref-5a", "isDeleted": true }),
        )
        .unwrap();

        // Tombstoned refund no longer counts against the cap.
        let again = reconcile_item(
            &conn,
            "t1",
            EntityKind::Refund,
            &serde_json::json!({
                "id": "ref-5b",
                "orderId": "ord-r",
                "items": [ { "productId": product_id, "quantity": 5.0 } ],
            }),
        )
        .unwrap();
        assert_eq!(again.action, Action::Created);
    }

    #[test]
    fn test_refund_update_is_bound_by_the_same_cap() {
        let conn = test_conn();
        let (product_id, _, _) = seed_order(&conn, "t1");

        reconcile_item(
            &conn,
            "t1",
            EntityKind::Refund,
            &serde_json::json!({
                "id": "ref-7",
                "orderId": "ord-r",
                "items": [ { "productId": product_id, "quantity": 2.0 } ],
            }),
        )
        .unwrap();

        // Edit inflating the quantity past the 5 units the order sold.
        let err = reconcile_item(
            &conn,
            "t1",
            EntityKind::Refund,
            &serde_json::json!({
                "id": "ref-7",
                "items": [ { "productId": product_id, "quantity": 50.0 } ],
            }),
        )
        .unwrap_err();
        assert!(err.contains("exceeds refundable"));

        // The rejected edit left the stored refund untouched.
        let doc = store::find_by_local_id(&conn, Collection::Refunds, "t1", "ref-7")
            .unwrap()
            .unwrap();
        assert_eq!(doc.data["items"][0]["quantity"], 2.0);
    }

    #[test]
    fn test_refund_update_is_capped_against_other_refunds_not_itself() {
        let conn = test_conn();
        let (product_id, _, _) = seed_order(&conn, "t1");

        reconcile_item(
            &conn,
            "t1",
            EntityKind::Refund,
            &serde_json::json!({
                "id": "ref-8a",
                "orderId": "ord-r",
                "items": [ { "productId": product_id, "quantity": 2.0 } ],
            }),
        )
        .unwrap();
        reconcile_item(
            &conn,
            "t1",
            EntityKind::Refund,
            &serde_json::json!({
                "id": "ref-8b",
                "orderId": "ord-r",
                "items": [ { "productId": product_id, "quantity": 2.0 } ],
            }),
        )
        .unwrap();

        // Growing ref-8a to 3 is fine: its own 2 don't count against it,
        // and 3 + ref-8b's 2 stays within the 5 sold.
        let grown = reconcile_item(
            &conn,
            "t1",
            EntityKind::Refund,
            &serde_json::json!({
                "id": "ref-8a",
                "items": [ { "productId": product_id, "quantity": 3.0 } ],
            }),
        )
        .unwrap();
        assert_eq!(grown.action, Action::Updated);

        // Growing it to 4 would make 6 of 5 sold.
        let err = reconcile_item(
            &conn,
            "t1",
            EntityKind::Refund,
            &serde_json::json!({
                "id": "ref-8a",
                "items": [ { "productId": product_id, "quantity": 4.0 } ],
            }),
        )
        .unwrap_err();
        assert!(err.contains("exceeds refundable"));
    }

    #[test]
    fn test_refund_accepts_order_local_id_as_reference() {
        let conn = test_conn();
        let (product_id, _, order_sid) = seed_order(&conn, "t1");

        // Reference by the client's local order id; stored refund carries
        // the resolved server id.
        let refund = serde_json::json!({
            "id": "ref-6",
            "orderId": "ord-r",
            "items": [ { "productId": product_id, "quantity": 1.0 } ],
        });
        let outcome = reconcile_item(&conn, "t1", EntityKind::Refund, &refund).unwrap();
        let doc = store::find_by_server_id(
            &conn,
            Collection::Refunds,
            "t1",
            outcome.server_id.as_deref().unwrap(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(doc.data["orderId"], order_sid);
    }
}
