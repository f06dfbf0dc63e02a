//! Entity resolution across the two identifier spaces.
//!
//! Every synced record can carry a client-assigned `localId` (stable across
//! the device's offline lifetime) and/or a store-assigned `serverId`. The
//! resolver is the single chokepoint translating between them: reconcilers
//! and cross-entity reference lookups never do ad hoc identifier queries.
//!
//! Resolution order: a syntactically plausible server id wins outright;
//! otherwise fall back to the local id among non-deleted records. A local id
//! is never trusted as a tenant-crossing key. Pure reads, no writes.

use rusqlite::Connection;
use uuid::Uuid;

use crate::store::{self, Collection, Doc, StoreError};

/// Whether `candidate` is shaped like a store-assigned identifier.
///
/// Server ids are UUIDs minted on creation. Clients sometimes echo back
/// locally generated opaque tokens in the `_id` slot; those that happen to
/// parse as UUIDs are harmless — the authoritative lookup simply misses and
/// resolution falls through to the local id.
pub fn is_server_id_shape(candidate: &str) -> bool {
    Uuid::parse_str(candidate).is_ok()
}

/// Resolve an entity by `(tenant, serverId)` first, then `(tenant, localId)`.
///
/// The server-id path returns tombstones too (callers need them for
/// idempotent deletes); the local-id path only matches live records.
pub fn resolve(
    conn: &Connection,
    coll: Collection,
    tenant_id: &str,
    local_id: Option<&str>,
    server_id: Option<&str>,
) -> Result<Option<Doc>, StoreError> {
    if let Some(sid) = server_id.filter(|s| is_server_id_shape(s)) {
        if let Some(doc) = store::find_by_server_id(conn, coll, tenant_id, sid)? {
            return Ok(Some(doc));
        }
    }

    if let Some(lid) = local_id.filter(|s| !s.trim().is_empty()) {
        return store::find_by_local_id(conn, coll, tenant_id, lid);
    }

    Ok(None)
}

/// Resolve a cross-entity reference token (e.g. an order's customer) to the
/// referenced document's server id.
///
/// The token may be either identifier — offline clients usually only know
/// their own local id for the parent. Returns `None` when nothing matches;
/// callers then store the record without the reference rather than failing.
pub fn resolve_ref_id(
    conn: &Connection,
    coll: Collection,
    tenant_id: &str,
    raw: Option<&str>,
) -> Result<Option<String>, StoreError> {
    let Some(token) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let doc = resolve(conn, coll, tenant_id, Some(token), Some(token))?;
    Ok(doc.filter(|d| !d.is_deleted).map(|d| d.server_id))
}

// ===========================================================================
// Tests
// ===========================================================================
