//! Per-item reconciliation of client-authored records.
//!
//! One algorithm serves every entity type: resolve the incoming item
//! against the store (server id first, local id fallback), then apply the
//! client's intent — delete, update, or create — idempotently. Orders and
//! refunds carry extra machinery (stock deduction, fingerprinting,
//! refundable-quantity checks) and live in their own modules; everything
//! else flows through `reconcile_generic` with per-kind policy hooks.
//!
//! Deletion is always reported as success, found or not: the client's
//! intent is "this record should not exist", and that intent is satisfied
//! either way. Updates only overwrite fields actually present in the
//! payload — a device that never learned a field must not clobber it.

use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ledger::{self, PartyKind};
use crate::orders;
use crate::quota;
use crate::refunds;
use crate::resolve;
use crate::store::{self, Collection, Doc};
use crate::{value_bool, value_str};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Deleted,
    Skipped,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
            Action::Skipped => "skipped",
        }
    }
}

/// Per-item reconciliation result. Failures are plain `Err(String)` so the
/// batch orchestrator can record them without aborting the batch.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub local_id: Option<String>,
    pub server_id: Option<String>,
    pub action: Action,
}

// ---------------------------------------------------------------------------
// Entity kinds and policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Customer,
    Supplier,
    Product,
    Category,
    InventoryBatch,
    Order,
    Refund,
    VendorOrder,
    Transaction,
    CustomerLedger,
    SupplierLedger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeletePolicy {
    /// Tombstone the record. Anything with financial effect keeps its row
    /// for the audit trail.
    Soft,
    /// Remove the row. Safe only for entities with no downstream money.
    Hard,
}

impl EntityKind {
    pub fn collection(self) -> Collection {
        match self {
            EntityKind::Customer => Collection::Customers,
            EntityKind::Supplier => Collection::Suppliers,
            EntityKind::Product => Collection::Products,
            EntityKind::Category => Collection::Categories,
            EntityKind::InventoryBatch => Collection::ProductBatches,
            EntityKind::Order => Collection::Orders,
            EntityKind::Refund => Collection::Refunds,
            EntityKind::VendorOrder => Collection::VendorOrders,
            EntityKind::Transaction => Collection::Transactions,
            EntityKind::CustomerLedger | EntityKind::SupplierLedger => Collection::LedgerEntries,
        }
    }

    pub(crate) fn delete_policy(self) -> DeletePolicy {
        match self {
            EntityKind::Product | EntityKind::Category | EntityKind::InventoryBatch => {
                DeletePolicy::Hard
            }
            _ => DeletePolicy::Soft,
        }
    }

    /// Plan-limit resource gating creation, if any.
    pub(crate) fn quota_resource(self) -> Option<&'static str> {
        match self {
            EntityKind::Customer => Some("customers"),
            EntityKind::Product => Some("products"),
            EntityKind::Order => Some("orders"),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload helpers (shared with orders/refunds)
// ---------------------------------------------------------------------------

/// Wire keys that are sync metadata, not entity fields.
pub(crate) const META_KEYS: &[&str] = &[
    "id",
    "_id",
    "localId",
    "serverId",
    "isDeleted",
    "is_deleted",
    "tenantId",
    "sellerId",
    "recordType",
];

#[derive(Debug, Clone)]
pub(crate) struct ItemIds {
    pub local_id: Option<String>,
    pub server_id: Option<String>,
    pub is_deleted: bool,
}

pub(crate) fn item_ids(item: &Value) -> ItemIds {
    ItemIds {
        local_id: value_str(item, &["id", "localId"]),
        server_id: value_str(item, &["_id", "serverId"]),
        is_deleted: value_bool(item, &["isDeleted", "is_deleted"]),
    }
}

/// Entity fields of the payload, metadata stripped.
pub(crate) fn payload_fields(item: &Value) -> Map<String, Value> {
    match item.as_object() {
        Some(obj) => obj
            .iter()
            .filter(|(k, _)| !META_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        None => Map::new(),
    }
}

/// Overlay payload fields onto an existing document's data. Only keys
/// present in the payload are written; absent fields keep their value.
pub(crate) fn merge_payload(data: &mut Value, item: &Value) {
    if !data.is_object() {
        *data = Value::Object(Map::new());
    }
    if let Value::Object(target) = data {
        for (k, v) in payload_fields(item) {
            target.insert(k, v);
        }
    }
}

pub(crate) fn creation_timestamp(item: &Value) -> String {
    value_str(item, &["createdAt", "created_at"]).unwrap_or_else(|| Utc::now().to_rfc3339())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Reconcile one sync item into the canonical dataset.
pub fn reconcile_item(
    conn: &Connection,
    tenant_id: &str,
    kind: EntityKind,
    item: &Value,
) -> Result<SyncOutcome, String> {
    match kind {
        EntityKind::Order => orders::reconcile_order(conn, tenant_id, item),
        EntityKind::Refund => refunds::reconcile_refund(conn, tenant_id, item),
        _ => reconcile_generic(conn, tenant_id, kind, item),
    }
}

fn reconcile_generic(
    conn: &Connection,
    tenant_id: &str,
    kind: EntityKind,
    item: &Value,
) -> Result<SyncOutcome, String> {
    let ids = item_ids(item);

    if ids.is_deleted {
        return delete_entity(conn, tenant_id, kind, &ids);
    }

    let existing = resolve::resolve(
        conn,
        kind.collection(),
        tenant_id,
        ids.local_id.as_deref(),
        ids.server_id.as_deref(),
    )
    .map_err(|e| format!("resolve: {e}"))?;

    if let Some(doc) = existing {
        return update_entity(conn, tenant_id, kind, doc, item, &ids);
    }

    // Legacy clients synced without a stable local id; a content match is
    // the same record coming back, not a new one.
    if let Some(dup) = content_duplicate(conn, tenant_id, kind, item)? {
        debug!(
            tenant_id,
            server_id = %dup.server_id,
            kind = ?kind,
            "Content match absorbed as update"
        );
        return update_entity(conn, tenant_id, kind, dup, item, &ids);
    }

    create_entity(conn, tenant_id, kind, item, &ids)
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

fn delete_entity(
    conn: &Connection,
    tenant_id: &str,
    kind: EntityKind,
    ids: &ItemIds,
) -> Result<SyncOutcome, String> {
    let existing = resolve::resolve(
        conn,
        kind.collection(),
        tenant_id,
        ids.local_id.as_deref(),
        ids.server_id.as_deref(),
    )
    .map_err(|e| format!("resolve: {e}"))?;

    match existing {
        Some(doc) if !doc.is_deleted => {
            let now = Utc::now().to_rfc3339();
            match kind.delete_policy() {
                DeletePolicy::Soft => {
                    store::mark_deleted(conn, kind.collection(), tenant_id, &doc.server_id, &now)
                        .map_err(|e| format!("soft delete: {e}"))?;
                }
                DeletePolicy::Hard => {
                    store::delete_hard(conn, kind.collection(), tenant_id, &doc.server_id)
                        .map_err(|e| format!("hard delete: {e}"))?;
                }
            }
            if let Some(resource) = kind.quota_resource() {
                let _ = quota::check_and_adjust(conn, tenant_id, resource, -1)?;
            }
            after_delete(conn, tenant_id, kind, &doc)?;
            info!(tenant_id, server_id = %doc.server_id, kind = ?kind, "Deleted");
            Ok(SyncOutcome {
                local_id: doc.local_id.or_else(|| ids.local_id.clone()),
                server_id: Some(doc.server_id),
                action: Action::Deleted,
            })
        }
        // Already gone (or never existed): the intent is satisfied.
        _ => Ok(SyncOutcome {
            local_id: ids.local_id.clone(),
            server_id: ids.server_id.clone(),
            action: Action::Deleted,
        }),
    }
}

// ---------------------------------------------------------------------------
// Update / create
// ---------------------------------------------------------------------------

fn update_entity(
    conn: &Connection,
    tenant_id: &str,
    kind: EntityKind,
    mut doc: Doc,
    item: &Value,
    ids: &ItemIds,
) -> Result<SyncOutcome, String> {
    merge_payload(&mut doc.data, item);
    normalize_refs(conn, tenant_id, kind, &mut doc.data)?;

    if doc.local_id.is_none() {
        doc.local_id = ids.local_id.clone();
    }
    // A non-delete sync for a tombstone revives it: the client says the
    // record exists. The earlier delete released its quota slot, so the
    // revival takes one back.
    if doc.is_deleted {
        if let Some(resource) = kind.quota_resource() {
            let _ = quota::check_and_adjust(conn, tenant_id, resource, 1)?;
        }
    }
    doc.is_deleted = false;
    doc.updated_at = Utc::now().to_rfc3339();

    store::save(conn, kind.collection(), &doc).map_err(|e| format!("save: {e}"))?;
    after_upsert(conn, tenant_id, kind, &doc)?;

    Ok(SyncOutcome {
        local_id: doc.local_id,
        server_id: Some(doc.server_id),
        action: Action::Updated,
    })
}

fn create_entity(
    conn: &Connection,
    tenant_id: &str,
    kind: EntityKind,
    item: &Value,
    ids: &ItemIds,
) -> Result<SyncOutcome, String> {
    let mut data = Value::Object(payload_fields(item));
    normalize_refs(conn, tenant_id, kind, &mut data)?;

    let server_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let doc = Doc {
        server_id: server_id.clone(),
        tenant_id: tenant_id.to_string(),
        local_id: ids.local_id.clone(),
        is_deleted: false,
        created_at: creation_timestamp(item),
        updated_at: now.clone(),
        data,
    };
    store::save(conn, kind.collection(), &doc).map_err(|e| format!("save: {e}"))?;

    if let Some(resource) = kind.quota_resource() {
        let decision = quota::check_and_adjust(conn, tenant_id, resource, 1)?;
        if !decision.success {
            // Undo the tentative creation so no orphan survives the attempt.
            rollback_creation(conn, tenant_id, kind, &server_id)?;
            return Err(decision
                .message
                .unwrap_or_else(|| format!("{}: {resource}", quota::LIMIT_EXCEEDED)));
        }
    }

    after_upsert(conn, tenant_id, kind, &doc)?;
    info!(tenant_id, server_id = %server_id, kind = ?kind, "Created");

    Ok(SyncOutcome {
        local_id: ids.local_id.clone(),
        server_id: Some(server_id),
        action: Action::Created,
    })
}

pub(crate) fn rollback_creation(
    conn: &Connection,
    tenant_id: &str,
    kind: EntityKind,
    server_id: &str,
) -> Result<(), String> {
    let now = Utc::now().to_rfc3339();
    match kind.delete_policy() {
        DeletePolicy::Soft => {
            store::mark_deleted(conn, kind.collection(), tenant_id, server_id, &now)
                .map_err(|e| format!("rollback: {e}"))?;
        }
        DeletePolicy::Hard => {
            store::delete_hard(conn, kind.collection(), tenant_id, server_id)
                .map_err(|e| format!("rollback: {e}"))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Content-based duplicate detection (legacy clients without local ids)
// ---------------------------------------------------------------------------

fn content_duplicate(
    conn: &Connection,
    tenant_id: &str,
    kind: EntityKind,
    item: &Value,
) -> Result<Option<Doc>, String> {
    match kind {
        EntityKind::Product => {
            let Some(name) = value_str(item, &["name"]) else {
                return Ok(None);
            };
            let description = value_str(item, &["description"]).unwrap_or_default();
            let docs = store::find_where(
                conn,
                Collection::Products,
                tenant_id,
                "is_deleted = 0 AND name = ?2 AND COALESCE(description, '') = ?3",
                &[&name, &description],
            )
            .map_err(|e| format!("duplicate check: {e}"))?;
            Ok(docs.into_iter().next())
        }
        EntityKind::Customer => {
            let (Some(name), Some(mobile)) =
                (value_str(item, &["name"]), value_str(item, &["mobile"]))
            else {
                return Ok(None);
            };
            let docs = store::find_where(
                conn,
                Collection::Customers,
                tenant_id,
                "is_deleted = 0 AND name = ?2 AND mobile = ?3",
                &[&name, &mobile],
            )
            .map_err(|e| format!("duplicate check: {e}"))?;
            Ok(docs.into_iter().next())
        }
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Cross-entity references
// ---------------------------------------------------------------------------

/// Rewrite reference tokens in `data` to server ids.
///
/// Optional references (a batch's product, a vendor order's supplier, a
/// product's category) that fail to resolve are dropped rather than
/// failing the item — a later sync repairs the link once the parent
/// arrives. Ledger entries are the exception: an entry without a
/// resolvable party cannot be replayed into any balance, so it fails
/// explicitly and the client retries after the parent syncs.
fn normalize_refs(
    conn: &Connection,
    tenant_id: &str,
    kind: EntityKind,
    data: &mut Value,
) -> Result<(), String> {
    match kind {
        EntityKind::Product => {
            rewrite_optional_ref(conn, tenant_id, data, "categoryId", Collection::Categories)?;
        }
        EntityKind::InventoryBatch => {
            rewrite_optional_ref(conn, tenant_id, data, "productId", Collection::Products)?;
        }
        EntityKind::VendorOrder => {
            rewrite_optional_ref(conn, tenant_id, data, "supplierId", Collection::Suppliers)?;
        }
        EntityKind::CustomerLedger => {
            require_party_ref(conn, tenant_id, data, PartyKind::Customer, "customerId")?;
        }
        EntityKind::SupplierLedger => {
            require_party_ref(conn, tenant_id, data, PartyKind::Supplier, "supplierId")?;
        }
        EntityKind::Transaction => {
            // Transactions are money records: never dropped for a missing
            // party, the link just stays absent.
            let customer = value_str(data, &["customerId"]);
            let supplier = value_str(data, &["supplierId"]);
            if let Some(sid) = resolve::resolve_ref_id(
                conn,
                Collection::Customers,
                tenant_id,
                customer.as_deref(),
            )
            .map_err(|e| format!("resolve party: {e}"))?
            {
                data["partyKind"] = Value::String("customer".into());
                data["partyId"] = Value::String(sid);
            } else if let Some(sid) = resolve::resolve_ref_id(
                conn,
                Collection::Suppliers,
                tenant_id,
                supplier.as_deref(),
            )
            .map_err(|e| format!("resolve party: {e}"))?
            {
                data["partyKind"] = Value::String("supplier".into());
                data["partyId"] = Value::String(sid);
            }
        }
        _ => {}
    }
    Ok(())
}

fn rewrite_optional_ref(
    conn: &Connection,
    tenant_id: &str,
    data: &mut Value,
    key: &str,
    coll: Collection,
) -> Result<(), String> {
    let Some(token) = value_str(data, &[key]) else {
        return Ok(());
    };
    match resolve::resolve_ref_id(conn, coll, tenant_id, Some(&token))
        .map_err(|e| format!("resolve {key}: {e}"))?
    {
        Some(sid) => data[key] = Value::String(sid),
        None => {
            debug!(tenant_id, key, token = %token, "Unresolved reference dropped");
            data[key] = Value::Null;
        }
    }
    Ok(())
}

fn require_party_ref(
    conn: &Connection,
    tenant_id: &str,
    data: &mut Value,
    kind: PartyKind,
    alias_key: &str,
) -> Result<(), String> {
    let token = value_str(data, &["partyId"]).or_else(|| value_str(data, &[alias_key]));
    let resolved =
        resolve::resolve_ref_id(conn, kind.collection(), tenant_id, token.as_deref())
            .map_err(|e| format!("resolve party: {e}"))?;
    match resolved {
        Some(sid) => {
            data["partyId"] = Value::String(sid);
            data["partyKind"] = Value::String(kind.as_str().into());
            Ok(())
        }
        None => Err(format!(
            "Unresolved {} reference {:?} for ledger entry",
            kind.as_str(),
            token
        )),
    }
}

// ---------------------------------------------------------------------------
// Post-write hooks
// ---------------------------------------------------------------------------

fn party_of(doc: &Doc) -> Option<(PartyKind, String)> {
    let kind = doc
        .data
        .get("partyKind")
        .and_then(Value::as_str)
        .and_then(PartyKind::from_str)?;
    let id = doc.data.get("partyId").and_then(Value::as_str)?;
    Some((kind, id.to_string()))
}

fn after_upsert(
    conn: &Connection,
    tenant_id: &str,
    kind: EntityKind,
    doc: &Doc,
) -> Result<(), String> {
    match kind {
        // Defensive: a party upsert may carry a client-computed dueAmount;
        // replace it with the replayed value immediately.
        EntityKind::Customer => {
            ledger::recalculate_balance(conn, tenant_id, PartyKind::Customer, &doc.server_id)?;
        }
        EntityKind::Supplier => {
            ledger::recalculate_balance(conn, tenant_id, PartyKind::Supplier, &doc.server_id)?;
        }
        EntityKind::CustomerLedger | EntityKind::SupplierLedger | EntityKind::Transaction => {
            if let Some((party_kind, party_id)) = party_of(doc) {
                ledger::recalculate_balance(conn, tenant_id, party_kind, &party_id)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn after_delete(
    conn: &Connection,
    tenant_id: &str,
    kind: EntityKind,
    doc: &Doc,
) -> Result<(), String> {
    match kind {
        EntityKind::CustomerLedger | EntityKind::SupplierLedger | EntityKind::Transaction => {
            if let Some((party_kind, party_id)) = party_of(doc) {
                ledger::recalculate_balance(conn, tenant_id, party_kind, &party_id)?;
            }
        }
        _ => {}
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

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn
    }

    #[test]
    fn test_create_then_resync_is_update_not_duplicate() {
        let conn = test_conn();
        let item = serde_json::json!({ "id": "loc-c1", "name": "Ada", "mobile": "555-1" });

        let first = reconcile_item(&conn, "t1", EntityKind::Customer, &item).unwrap();
        assert_eq!(first.action, Action::Created);
        let sid = first.server_id.clone().unwrap();

        let second = reconcile_item(&conn, "t1", EntityKind::Customer, &item).unwrap();
        assert_eq!(second.action, Action::Updated);
        assert_eq!(second.server_id.as_deref(), Some(sid.as_str()));

        assert_eq!(store::count(&conn, Collection::Customers, "t1", true).unwrap(), 1);
    }

    #[test]
    fn test_delete_is_idempotent_and_never_fails() {
        let conn = test_conn();
        let item = serde_json::json!({ "id": "loc-d1", "name": "Temp", "mobile": "555-2" });
        reconcile_item(&conn, "t1", EntityKind::Customer, &item).unwrap();

        let tombstone = serde_json::json!({ "id": "loc-d1", "isDeleted": true });
        let first = reconcile_item(&conn, "t1", EntityKind::Customer, &tombstone).unwrap();
        assert_eq!(first.action, Action::Deleted);

        // Again, and for a record that never existed.
        let second = reconcile_item(&conn, "t1", EntityKind::Customer, &tombstone).unwrap();
        assert_eq!(second.action, Action::Deleted);
        let ghost = serde_json::json!({ "id": "never-was", "isDeleted": true });
        let third = reconcile_item(&conn, "t1", EntityKind::Customer, &ghost).unwrap();
        assert_eq!(third.action, Action::Deleted);
    }

    #[test]
    fn test_product_delete_is_hard_customer_delete_is_soft() {
        let conn = test_conn();
        reconcile_item(
            &conn,
            "t1",
            EntityKind::Product,
            &serde_json::json!({ "id": "loc-p", "name": "Beans" }),
        )
        .unwrap();
        reconcile_item(
            &conn,
            "t1",
            EntityKind::Customer,
            &serde_json::json!({ "id": "loc-c", "name": "Eve", "mobile": "555-3" }),
        )
        .unwrap();

        reconcile_item(
            &conn,
            "t1",
            EntityKind::Product,
            &serde_json::json!({ "id": "loc-p", "isDeleted": true }),
        )
        .unwrap();
        reconcile_item(
            &conn,
            "t1",
            EntityKind::Customer,
            &serde_json::json!({ "id": "loc-c", "isDeleted": true }),
        )
        .unwrap();

        // Product row gone entirely; customer tombstoned.
        assert_eq!(store::count(&conn, Collection::Products, "t1", true).unwrap(), 0);
        assert_eq!(store::count(&conn, Collection::Customers, "t1", true).unwrap(), 1);
        assert_eq!(store::count(&conn, Collection::Customers, "t1", false).unwrap(), 0);
    }

    #[test]
    fn test_partial_update_does_not_clobber_absent_fields() {
        let conn = test_conn();
        let created = reconcile_item(
            &conn,
            "t1",
            EntityKind::Customer,
            &serde_json::json!({ "id": "loc-m", "name": "Maya", "mobile": "555-4", "email": "m@example.com" }),
        )
        .unwrap();

        // Update carrying only the mobile — name and email must survive.
        reconcile_item(
            &conn,
            "t1",
            EntityKind::Customer,
            &serde_json::json!({ "id": "loc-m", "mobile": "555-9" }),
        )
        .unwrap();

        let doc = store::find_by_server_id(
            &conn,
            Collection::Customers,
            "t1",
            created.server_id.as_deref().unwrap(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(doc.data["name"], "Maya");
        assert_eq!(doc.data["email"], "m@example.com");
        assert_eq!(doc.data["mobile"], "555-9");
    }

    #[test]
    fn test_content_duplicate_absorbed_for_legacy_customers() {
        let conn = test_conn();
        // First sync from a legacy client without a local id.
        let first = reconcile_item(
            &conn,
            "t1",
            EntityKind::Customer,
            &serde_json::json!({ "name": "Noor", "mobile": "555-7" }),
        )
        .unwrap();
        assert_eq!(first.action, Action::Created);

        // Same content again, still no identifiers.
        let second = reconcile_item(
            &conn,
            "t1",
            EntityKind::Customer,
            &serde_json::json!({ "name": "Noor", "mobile": "555-7", "email": "n@example.com" }),
        )
        .unwrap();
        assert_eq!(second.action, Action::Updated);
        assert_eq!(store::count(&conn, Collection::Customers, "t1", true).unwrap(), 1);
    }

    #[test]
    fn test_quota_rollback_leaves_no_trace() {
        let conn = test_conn();
        quota::set_limit(&conn, "t1", "products", 1).unwrap();

        reconcile_item(
            &conn,
            "t1",
            EntityKind::Product,
            &serde_json::json!({ "id": "p-1", "name": "First" }),
        )
        .unwrap();
        let before = store::count(&conn, Collection::Products, "t1", false).unwrap();

        let err = reconcile_item(
            &conn,
            "t1",
            EntityKind::Product,
            &serde_json::json!({ "id": "p-2", "name": "Second" }),
        )
        .unwrap_err();
        assert!(err.contains(quota::LIMIT_EXCEEDED));

        let after = store::count(&conn, Collection::Products, "t1", false).unwrap();
        assert_eq!(before, after);
        assert_eq!(quota::usage(&conn, "t1", "products"), 1);
    }

    #[test]
    fn test_delete_releases_quota() {
        let conn = test_conn();
        quota::set_limit(&conn, "t1", "customers", 1).unwrap();

        reconcile_item(
            &conn,
            "t1",
            EntityKind::Customer,
            &serde_json::json!({ "id": "q-1", "name": "Quota", "mobile": "555-8" }),
        )
        .unwrap();
        reconcile_item(
            &conn,
            "t1",
            EntityKind::Customer,
            &serde_json::json!({ "id": "q-1", "isDeleted": true }),
        )
        .unwrap();

        // Slot freed: creating another succeeds.
        let next = reconcile_item(
            &conn,
            "t1",
            EntityKind::Customer,
            &serde_json::json!({ "id": "q-2", "name": "Next", "mobile": "555-10" }),
        )
        .unwrap();
        assert_eq!(next.action, Action::Created);
    }

    #[test]
    fn test_ledger_entry_requires_resolvable_party() {
        let conn = test_conn();
        let err = reconcile_item(
            &conn,
            "t1",
            EntityKind::CustomerLedger,
            &serde_json::json!({ "id": "le-1", "type": "due", "amount": 10.0, "customerId": "nobody" }),
        )
        .unwrap_err();
        assert!(err.contains("Unresolved customer"));
    }

    #[test]
    fn test_ledger_entry_lifecycle_recalculates_balance() {
        let conn = test_conn();
        let customer = reconcile_item(
            &conn,
            "t1",
            EntityKind::Customer,
            &serde_json::json!({ "id": "loc-b", "name": "Bal", "mobile": "555-11" }),
        )
        .unwrap();
        let cid = customer.server_id.unwrap();

        reconcile_item(
            &conn,
            "t1",
            EntityKind::CustomerLedger,
            &serde_json::json!({ "id": "le-a", "type": "due", "amount": 80.0, "customerId": "loc-b" }),
        )
        .unwrap();
        reconcile_item(
            &conn,
            "t1",
            EntityKind::CustomerLedger,
            &serde_json::json!({ "id": "le-b", "type": "payment", "amount": 30.0, "customerId": cid }),
        )
        .unwrap();

        let due: f64 = conn
            .query_row(
                "SELECT due_amount FROM customers WHERE server_id = ?1",
                [&cid],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(due, 50.0);

        // Edit the payment amount (retry with corrected value): replay wins.
        reconcile_item(
            &conn,
            "t1",
            EntityKind::CustomerLedger,
            &serde_json::json!({ "id": "le-b", "amount": 80.0 }),
        )
        .unwrap();
        let due: f64 = conn
            .query_row(
                "SELECT due_amount FROM customers WHERE server_id = ?1",
                [&cid],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(due, 0.0);

        // Delete the due entry: balance goes negative of the payment.
        reconcile_item(
            &conn,
            "t1",
            EntityKind::CustomerLedger,
            &serde_json::json!({ "id": "le-a", "isDeleted": true }),
        )
        .unwrap();
        let due: f64 = conn
            .query_row(
                "SELECT due_amount FROM customers WHERE server_id = ?1",
                [&cid],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(due, -80.0);
    }

    #[test]
    fn test_vendor_order_with_unknown_supplier_is_kept_without_link() {
        let conn = test_conn();
        let outcome = reconcile_item(
            &conn,
            "t1",
            EntityKind::VendorOrder,
            &serde_json::json!({ "id": "vo-1", "supplierId": "not-synced-yet", "totalAmount": 420.0 }),
        )
        .unwrap();
        assert_eq!(outcome.action, Action::Created);

        let doc = store::find_by_server_id(
            &conn,
            Collection::VendorOrders,
            "t1",
            outcome.server_id.as_deref().unwrap(),
        )
        .unwrap()
        .unwrap();
        assert!(doc.data["supplierId"].is_null());
        assert_eq!(doc.data["totalAmount"], 420.0);
    }

    #[test]
    fn test_tombstone_revival_on_non_delete_sync() {
        let conn = test_conn();
        let created = reconcile_item(
            &conn,
            "t1",
            EntityKind::Order,
            &serde_json::json!({ "id": "loc-o", "totalAmount": 10.0, "stockDeducted": true, "items": [] }),
        )
        .unwrap();
        let sid = created.server_id.unwrap();

        reconcile_item(
            &conn,
            "t1",
            EntityKind::Order,
            &serde_json::json!({ "_id": sid, "isDeleted": true }),
        )
        .unwrap();

        let revived = reconcile_item(
            &conn,
            "t1",
            EntityKind::Order,
            &serde_json::json!({ "_id": sid, "totalAmount": 12.0, "stockDeducted": true }),
        )
        .unwrap();
        assert_eq!(revived.action, Action::Updated);

        let doc = store::find_by_server_id(&conn, Collection::Orders, "t1", &sid)
            .unwrap()
            .unwrap();
        assert!(!doc.is_deleted);
        assert_eq!(doc.data["totalAmount"], 12.0);
    }
}
