//! Tenant-scoped document store over SQLite.
//!
//! Each syncable collection is a table sharing the document core columns
//! (`server_id`, `tenant_id`, `local_id`, `is_deleted`, timestamps) plus a
//! `data` JSON column holding the full record. A handful of fields are
//! additionally materialized into real columns on every save so the
//! allocator and ledger can query them without parsing JSON.
//!
//! All operations are scoped by tenant. No read here may ever return a
//! document belonging to another tenant, even when raw identifier values
//! collide across tenants.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("malformed stored document: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Customers,
    Suppliers,
    Products,
    Categories,
    ProductBatches,
    Orders,
    Refunds,
    VendorOrders,
    Transactions,
    LedgerEntries,
}

/// Type of a materialized column, used when extracting its value from `data`.
#[derive(Debug, Clone, Copy)]
enum ColKind {
    Text,
    Real,
    Bool,
}

impl Collection {
    pub fn table(self) -> &'static str {
        match self {
            Collection::Customers => "customers",
            Collection::Suppliers => "suppliers",
            Collection::Products => "products",
            Collection::Categories => "categories",
            Collection::ProductBatches => "product_batches",
            Collection::Orders => "orders",
            Collection::Refunds => "refunds",
            Collection::VendorOrders => "vendor_orders",
            Collection::Transactions => "transactions",
            Collection::LedgerEntries => "ledger_entries",
        }
    }

    /// Materialized columns: (sql column, camelCase key inside `data`, kind).
    fn indexed_columns(self) -> &'static [(&'static str, &'static str, ColKind)] {
        match self {
            Collection::Customers | Collection::Suppliers => &[
                ("name", "name", ColKind::Text),
                ("mobile", "mobile", ColKind::Text),
                ("due_amount", "dueAmount", ColKind::Real),
            ],
            Collection::Products => &[
                ("name", "name", ColKind::Text),
                ("description", "description", ColKind::Text),
                ("track_expiry", "trackExpiry", ColKind::Bool),
            ],
            Collection::Categories => &[("name", "name", ColKind::Text)],
            Collection::ProductBatches => &[
                ("product_id", "productId", ColKind::Text),
                ("quantity", "quantity", ColKind::Real),
                ("cost_price", "costPrice", ColKind::Real),
                ("selling_price", "sellingPrice", ColKind::Real),
                ("expiry", "expiry", ColKind::Text),
            ],
            Collection::Orders => &[
                ("customer_id", "customerId", ColKind::Text),
                ("total_amount", "totalAmount", ColKind::Real),
                ("status", "status", ColKind::Text),
                ("stock_deducted", "stockDeducted", ColKind::Bool),
                ("fingerprint", "fingerprint", ColKind::Text),
            ],
            Collection::Refunds => &[
                ("order_id", "orderId", ColKind::Text),
                ("total_amount", "totalAmount", ColKind::Real),
            ],
            Collection::VendorOrders => &[
                ("supplier_id", "supplierId", ColKind::Text),
                ("total_amount", "totalAmount", ColKind::Real),
                ("payment_status", "paymentStatus", ColKind::Text),
            ],
            Collection::Transactions | Collection::LedgerEntries => &[
                ("party_kind", "partyKind", ColKind::Text),
                ("party_id", "partyId", ColKind::Text),
                ("type", "type", ColKind::Text),
                ("amount", "amount", ColKind::Real),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// A stored document. `data` carries the full record; the core fields are
/// duplicated out of it for convenience.
#[derive(Debug, Clone)]
pub struct Doc {
    pub server_id: String,
    pub tenant_id: String,
    pub local_id: Option<String>,
    pub is_deleted: bool,
    pub created_at: String,
    pub updated_at: String,
    pub data: Value,
}

const CORE_COLS: &str = "server_id, tenant_id, local_id, is_deleted, created_at, updated_at, data";

fn row_to_doc(row: &rusqlite::Row<'_>) -> rusqlite::Result<Doc> {
    let raw: String = row.get(6)?;
    let data = serde_json::from_str(&raw).unwrap_or(Value::Null);
    Ok(Doc {
        server_id: row.get(0)?,
        tenant_id: row.get(1)?,
        local_id: row.get(2)?,
        is_deleted: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        data,
    })
}

/// Extract a materialized column value from the document data.
fn extract_col(data: &Value, key: &str, kind: ColKind) -> SqlValue {
    match kind {
        ColKind::Text => data
            .get(key)
            .and_then(Value::as_str)
            .map(|s| SqlValue::Text(s.to_string()))
            .unwrap_or(SqlValue::Null),
        ColKind::Real => data
            .get(key)
            .and_then(Value::as_f64)
            .map(SqlValue::Real)
            .unwrap_or(SqlValue::Real(0.0)),
        ColKind::Bool => {
            let truthy = match data.get(key) {
                Some(Value::Bool(b)) => *b,
                Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
                _ => false,
            };
            SqlValue::Integer(if truthy { 1 } else { 0 })
        }
    }
}

// ---------------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------------

/// Upsert a document by `server_id`, rewriting the materialized columns
/// from `data`. Single-row write; callers never assume multi-document
/// transactions.
pub fn save(conn: &Connection, coll: Collection, doc: &Doc) -> Result<(), StoreError> {
    let indexed = coll.indexed_columns();

    let mut columns = vec![
        "server_id",
        "tenant_id",
        "local_id",
        "is_deleted",
        "created_at",
        "updated_at",
    ];
    columns.extend(indexed.iter().map(|(col, _, _)| *col));
    columns.push("data");

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = columns
        .iter()
        .skip(1) // server_id is the conflict key
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(server_id) DO UPDATE SET {}",
        coll.table(),
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", "),
    );

    let mut values: Vec<SqlValue> = vec![
        SqlValue::Text(doc.server_id.clone()),
        SqlValue::Text(doc.tenant_id.clone()),
        doc.local_id
            .clone()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null),
        SqlValue::Integer(if doc.is_deleted { 1 } else { 0 }),
        SqlValue::Text(doc.created_at.clone()),
        SqlValue::Text(doc.updated_at.clone()),
    ];
    for (_, key, kind) in indexed {
        values.push(extract_col(&doc.data, key, *kind));
    }
    values.push(SqlValue::Text(doc.data.to_string()));

    conn.execute(&sql, rusqlite::params_from_iter(values))?;
    Ok(())
}

/// Look up by `(tenant, server_id)`. Returns deleted documents too — the
/// caller decides what a tombstone means.
pub fn find_by_server_id(
    conn: &Connection,
    coll: Collection,
    tenant_id: &str,
    server_id: &str,
) -> Result<Option<Doc>, StoreError> {
    let sql = format!(
        "SELECT {CORE_COLS} FROM {} WHERE tenant_id = ?1 AND server_id = ?2",
        coll.table()
    );
    Ok(conn
        .query_row(&sql, params![tenant_id, server_id], row_to_doc)
        .optional()?)
}

/// Look up by `(tenant, local_id)` among non-deleted documents only.
pub fn find_by_local_id(
    conn: &Connection,
    coll: Collection,
    tenant_id: &str,
    local_id: &str,
) -> Result<Option<Doc>, StoreError> {
    let sql = format!(
        "SELECT {CORE_COLS} FROM {} WHERE tenant_id = ?1 AND local_id = ?2 AND is_deleted = 0
         ORDER BY updated_at DESC LIMIT 1",
        coll.table()
    );
    Ok(conn
        .query_row(&sql, params![tenant_id, local_id], row_to_doc)
        .optional()?)
}

/// Filtered find. `clause` references table columns and uses `?2`-onwards
/// placeholders; `?1` is always the tenant.
pub fn find_where(
    conn: &Connection,
    coll: Collection,
    tenant_id: &str,
    clause: &str,
    extra: &[&dyn ToSql],
) -> Result<Vec<Doc>, StoreError> {
    let sql = format!(
        "SELECT {CORE_COLS} FROM {} WHERE tenant_id = ?1 AND ({clause})",
        coll.table()
    );
    let mut stmt = conn.prepare(&sql)?;

    let tenant: &dyn ToSql = &tenant_id;
    let mut bound: Vec<&dyn ToSql> = vec![tenant];
    bound.extend_from_slice(extra);

    let rows = stmt.query_map(rusqlite::params_from_iter(bound), row_to_doc)?;
    let mut docs = Vec::new();
    for row in rows {
        docs.push(row?);
    }
    Ok(docs)
}

/// Hard-delete a document. Returns whether a row was removed.
pub fn delete_hard(
    conn: &Connection,
    coll: Collection,
    tenant_id: &str,
    server_id: &str,
) -> Result<bool, StoreError> {
    let sql = format!(
        "DELETE FROM {} WHERE tenant_id = ?1 AND server_id = ?2",
        coll.table()
    );
    Ok(conn.execute(&sql, params![tenant_id, server_id])? > 0)
}

/// Soft-delete a document (tombstone). Returns whether a row was updated.
pub fn mark_deleted(
    conn: &Connection,
    coll: Collection,
    tenant_id: &str,
    server_id: &str,
    now: &str,
) -> Result<bool, StoreError> {
    let sql = format!(
        "UPDATE {} SET is_deleted = 1, updated_at = ?3 WHERE tenant_id = ?1 AND server_id = ?2",
        coll.table()
    );
    Ok(conn.execute(&sql, params![tenant_id, server_id, now])? > 0)
}

/// Count documents for a tenant, optionally including tombstones.
pub fn count(
    conn: &Connection,
    coll: Collection,
    tenant_id: &str,
    include_deleted: bool,
) -> Result<i64, StoreError> {
    let sql = if include_deleted {
        format!("SELECT COUNT(*) FROM {} WHERE tenant_id = ?1", coll.table())
    } else {
        format!(
            "SELECT COUNT(*) FROM {} WHERE tenant_id = ?1 AND is_deleted = 0",
            coll.table()
        )
    };
    Ok(conn.query_row(&sql, params![tenant_id], |row| row.get(0))?)
}

// ===========================================================================
// Tests
// ===========================================================================
