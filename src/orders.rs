//! Order reconciliation: the only entity whose sync has side effects on
//! inventory.
//!
//! The `stockDeducted` flag stored on the server copy is the single point
//! of truth for whether an order's lines have already been taken out of
//! inventory. Client payloads never reset it: a retried create, a replayed
//! batch, or a stale device re-sending the order must not drain the batches
//! a second time.
//!
//! Orders from legacy clients arrive without identifiers, so near-duplicate
//! submissions are caught by a content fingerprint (sorted line items) plus
//! a short creation-time window.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::quota;
use crate::reconcile::{
    self, creation_timestamp, item_ids, merge_payload, payload_fields, Action, EntityKind,
    SyncOutcome,
};
use crate::resolve;
use crate::stock::{self, RestockPolicy};
use crate::store::{self, Collection, Doc};
use crate::{value_bool, value_str};

/// Two submissions of identical content within this window are one order.
const DUPLICATE_WINDOW_SECS: i64 = 10;

fn is_cancelled(status: Option<&str>) -> bool {
    matches!(status, Some(s) if s.eq_ignore_ascii_case("cancelled") || s.eq_ignore_ascii_case("canceled"))
}

fn order_status(data: &Value) -> Option<&str> {
    data.get("status").and_then(Value::as_str)
}

fn stock_deducted(data: &Value) -> bool {
    value_bool(data, &["stockDeducted"])
}

pub fn reconcile_order(
    conn: &Connection,
    tenant_id: &str,
    item: &Value,
) -> Result<SyncOutcome, String> {
    let ids = item_ids(item);

    if ids.is_deleted {
        return delete_order(conn, tenant_id, &ids);
    }

    let existing = resolve::resolve(
        conn,
        Collection::Orders,
        tenant_id,
        ids.local_id.as_deref(),
        ids.server_id.as_deref(),
    )
    .map_err(|e| format!("resolve order: {e}"))?;

    match existing {
        Some(doc) => update_order(conn, tenant_id, doc, item),
        None => {
            if let Some(dup) = find_fingerprint_duplicate(conn, tenant_id, item)? {
                info!(
                    tenant_id,
                    server_id = %dup.server_id,
                    "Duplicate order submission suppressed"
                );
                return Ok(SyncOutcome {
                    local_id: ids.local_id.clone(),
                    server_id: Some(dup.server_id),
                    action: Action::Skipped,
                });
            }
            create_order(conn, tenant_id, item, &ids)
        }
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

fn create_order(
    conn: &Connection,
    tenant_id: &str,
    item: &Value,
    ids: &reconcile::ItemIds,
) -> Result<SyncOutcome, String> {
    let mut data = Value::Object(payload_fields(item));
    resolve_customer_ref(conn, tenant_id, &mut data)?;
    data["fingerprint"] = Value::String(fingerprint(&data));

    let already_deducted = stock_deducted(&data);
    let server_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let mut doc = Doc {
        server_id: server_id.clone(),
        tenant_id: tenant_id.to_string(),
        local_id: ids.local_id.clone(),
        is_deleted: false,
        created_at: creation_timestamp(item),
        updated_at: now,
        data,
    };
    store::save(conn, Collection::Orders, &doc).map_err(|e| format!("save order: {e}"))?;

    let decision = quota::check_and_adjust(conn, tenant_id, "orders", 1)?;
    if !decision.success {
        reconcile::rollback_creation(conn, tenant_id, EntityKind::Order, &server_id)?;
        return Err(decision
            .message
            .unwrap_or_else(|| format!("{}: orders", quota::LIMIT_EXCEEDED)));
    }

    if !already_deducted && !is_cancelled(order_status(&doc.data)) {
        deduct_order_lines(conn, tenant_id, &mut doc)?;
        store::save(conn, Collection::Orders, &doc).map_err(|e| format!("save order: {e}"))?;
    }

    info!(tenant_id, server_id = %server_id, "Order created");
    Ok(SyncOutcome {
        local_id: ids.local_id.clone(),
        server_id: Some(server_id),
        action: Action::Created,
    })
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

fn update_order(
    conn: &Connection,
    tenant_id: &str,
    mut doc: Doc,
    item: &Value,
) -> Result<SyncOutcome, String> {
    let was_deducted = stock_deducted(&doc.data);
    let was_cancelled = is_cancelled(order_status(&doc.data));
    let was_tombstone = doc.is_deleted;

    merge_payload(&mut doc.data, item);
    resolve_customer_ref(conn, tenant_id, &mut doc.data)?;
    // The stored flag outlives whatever the client claims.
    doc.data["stockDeducted"] = Value::Bool(was_deducted);

    let now_cancelled = is_cancelled(order_status(&doc.data));

    if was_deducted && now_cancelled && !was_cancelled {
        restock_order_lines(conn, tenant_id, &doc, RestockPolicy::Cancellation)?;
        doc.data["stockDeducted"] = Value::Bool(false);
    } else if !was_deducted && !now_cancelled && (was_cancelled || was_tombstone) {
        // Revived or un-cancelled order whose stock was never (or no longer)
        // taken: deduct now.
        deduct_order_lines(conn, tenant_id, &mut doc)?;
    }

    if doc.local_id.is_none() {
        doc.local_id = item_ids(item).local_id;
    }
    // The earlier delete released this order's quota slot; revival takes
    // it back.
    if was_tombstone {
        let _ = quota::check_and_adjust(conn, tenant_id, "orders", 1)?;
    }
    doc.is_deleted = false;
    doc.updated_at = Utc::now().to_rfc3339();
    store::save(conn, Collection::Orders, &doc).map_err(|e| format!("save order: {e}"))?;

    Ok(SyncOutcome {
        local_id: doc.local_id,
        server_id: Some(doc.server_id),
        action: Action::Updated,
    })
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

fn delete_order(
    conn: &Connection,
    tenant_id: &str,
    ids: &reconcile::ItemIds,
) -> Result<SyncOutcome, String> {
    let existing = resolve::resolve(
        conn,
        Collection::Orders,
        tenant_id,
        ids.local_id.as_deref(),
        ids.server_id.as_deref(),
    )
    .map_err(|e| format!("resolve order: {e}"))?;

    match existing {
        Some(mut doc) if !doc.is_deleted => {
            if stock_deducted(&doc.data) && !is_cancelled(order_status(&doc.data)) {
                restock_order_lines(conn, tenant_id, &doc, RestockPolicy::Cancellation)?;
                doc.data["stockDeducted"] = Value::Bool(false);
            }
            let now = Utc::now().to_rfc3339();
            doc.updated_at = now.clone();
            store::save(conn, Collection::Orders, &doc).map_err(|e| format!("save order: {e}"))?;
            store::mark_deleted(conn, Collection::Orders, tenant_id, &doc.server_id, &now)
                .map_err(|e| format!("delete order: {e}"))?;
            let _ = quota::check_and_adjust(conn, tenant_id, "orders", -1)?;
            info!(tenant_id, server_id = %doc.server_id, "Order deleted");
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

// ---------------------------------------------------------------------------
// Stock movement
// ---------------------------------------------------------------------------

fn line_quantity(line: &Value) -> f64 {
    line.get("quantity").and_then(Value::as_f64).unwrap_or(0.0)
}

/// Deduct every sellable line from inventory and mark the order deducted.
///
/// Lines carrying `dProductId` reference a product that was deleted before
/// the order synced; they are kept for the receipt but move no stock. Lines
/// whose product cannot be resolved are likewise skipped. A line missing
/// its cost price gets the cost of the first batch it drained, so margin
/// reports see the real acquisition cost.
fn deduct_order_lines(conn: &Connection, tenant_id: &str, doc: &mut Doc) -> Result<(), String> {
    let mut shortfalls = Map::new();

    if let Some(lines) = doc.data.get_mut("items").and_then(Value::as_array_mut) {
        for line in lines.iter_mut() {
            if line.get("dProductId").is_some() {
                continue;
            }
            let Some(token) = value_str(line, &["productId"]) else {
                continue;
            };
            let resolved =
                resolve::resolve_ref_id(conn, Collection::Products, tenant_id, Some(&token))
                    .map_err(|e| format!("resolve product: {e}"))?;
            let Some(product_id) = resolved else {
                warn!(tenant_id, token = %token, "Order line product not found, line not deducted");
                continue;
            };
            line["productId"] = Value::String(product_id.clone());

            let qty = line_quantity(line);
            if qty <= 0.0 {
                continue;
            }
            let deduction = stock::deduct(conn, tenant_id, &product_id, qty)?;

            let has_cost = line.get("costPrice").and_then(Value::as_f64).unwrap_or(0.0) > 0.0;
            if !has_cost {
                if let Some(cost) = deduction.consumed.first().and_then(|c| c.cost_price) {
                    line["costPrice"] = serde_json::json!(cost);
                }
            }
            if deduction.shortfall > 0.0 {
                shortfalls.insert(product_id, serde_json::json!(deduction.shortfall));
            }
        }
    }

    doc.data["stockDeducted"] = Value::Bool(true);
    if !shortfalls.is_empty() {
        doc.data["stockShortfall"] = Value::Object(shortfalls);
    }
    Ok(())
}

fn restock_order_lines(
    conn: &Connection,
    tenant_id: &str,
    doc: &Doc,
    policy: RestockPolicy,
) -> Result<(), String> {
    let Some(lines) = doc.data.get("items").and_then(Value::as_array) else {
        return Ok(());
    };
    for line in lines {
        if line.get("dProductId").is_some() {
            continue;
        }
        let Some(product_id) = value_str(line, &["productId"]) else {
            continue;
        };
        let qty = line_quantity(line);
        if qty <= 0.0 {
            continue;
        }
        stock::restock(conn, tenant_id, &product_id, qty, policy)?;
    }
    debug!(tenant_id, server_id = %doc.server_id, "Order lines restocked");
    Ok(())
}

// ---------------------------------------------------------------------------
// Duplicate detection
// ---------------------------------------------------------------------------

/// Content fingerprint of an order: md5 over the sorted line items. Line
/// order is client-UI dependent, so it must not change the fingerprint.
fn fingerprint(data: &Value) -> String {
    let mut lines: Vec<String> = data
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|line| {
                    format!(
                        "{}|{}|{}",
                        value_str(line, &["name"]).unwrap_or_default(),
                        line.get("quantity").and_then(Value::as_f64).unwrap_or(0.0),
                        line.get("price").and_then(Value::as_f64).unwrap_or(0.0),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    lines.sort();
    format!("{:x}", md5::compute(lines.join(";")))
}

fn find_fingerprint_duplicate(
    conn: &Connection,
    tenant_id: &str,
    item: &Value,
) -> Result<Option<Doc>, String> {
    let fields = Value::Object(payload_fields(item));
    let fp = fingerprint(&fields);
    let total = fields
        .get("totalAmount")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    // Stored orders hold the resolved customer id, so compare against that.
    let token = value_str(&fields, &["customerId"]);
    let customer =
        resolve::resolve_ref_id(conn, Collection::Customers, tenant_id, token.as_deref())
            .map_err(|e| format!("resolve customer: {e}"))?
            .unwrap_or_default();

    let candidates = store::find_where(
        conn,
        Collection::Orders,
        tenant_id,
        "is_deleted = 0 AND fingerprint = ?2 AND total_amount = ?3 AND COALESCE(customer_id, '') = ?4",
        &[&fp, &total, &customer],
    )
    .map_err(|e| format!("duplicate check: {e}"))?;

    let item_ts = parse_ts(&creation_timestamp(item)).unwrap_or_else(Utc::now);
    Ok(candidates.into_iter().find(|c| {
        parse_ts(&c.created_at)
            .map(|ts| (item_ts - ts).num_seconds().abs() <= DUPLICATE_WINDOW_SECS)
            .unwrap_or(false)
    }))
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn resolve_customer_ref(
    conn: &Connection,
    tenant_id: &str,
    data: &mut Value,
) -> Result<(), String> {
    let Some(token) = value_str(data, &["customerId"]) else {
        return Ok(());
    };
    match resolve::resolve_ref_id(conn, Collection::Customers, tenant_id, Some(&token))
        .map_err(|e| format!("resolve customer: {e}"))?
    {
        Some(sid) => data["customerId"] = Value::String(sid),
        // Walk-in sale or not-yet-synced customer: keep the order anyway.
        None => data["customerId"] = Value::Null,
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
