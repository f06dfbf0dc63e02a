//! Plan-limit enforcement for tenant resource creation.
//!
//! Backed by the `plan_limits` table. Reconcilers call `check_and_adjust`
//! *after* tentatively creating a quota-gated entity; a rejection obliges
//! the caller to undo the creation so no orphan survives the attempt.
//! Deletes of quota-counted entities release usage with a negative delta.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

/// Marker embedded in rejection messages so clients can distinguish a plan
/// ceiling from a generic failure and show an upgrade prompt.
pub const LIMIT_EXCEEDED: &str = "limit-exceeded";

#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub success: bool,
    pub message: Option<String>,
}

impl QuotaDecision {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }
}

/// Check a tenant's plan limit for `resource` and apply `delta` to usage.
///
/// No `plan_limits` row means the resource is unlimited for that tenant.
/// A positive delta that would exceed `max_allowed` is rejected without
/// adjusting anything; negative deltas floor usage at zero.
pub fn check_and_adjust(
    conn: &Connection,
    tenant_id: &str,
    resource: &str,
    delta: i64,
) -> Result<QuotaDecision, String> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT used, max_allowed FROM plan_limits WHERE tenant_id = ?1 AND resource = ?2",
            params![tenant_id, resource],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| format!("quota lookup: {e}"))?;

    let Some((used, max_allowed)) = row else {
        debug!(tenant_id, resource, "No plan limit configured, allowing");
        return Ok(QuotaDecision::ok());
    };

    if delta > 0 && used + delta > max_allowed {
        info!(
            tenant_id,
            resource, used, max_allowed, "Plan limit reached, rejecting creation"
        );
        return Ok(QuotaDecision {
            success: false,
            message: Some(format!(
                "{LIMIT_EXCEEDED}: {resource} quota reached ({used}/{max_allowed})"
            )),
        });
    }

    let new_used = (used + delta).max(0);
    conn.execute(
        "UPDATE plan_limits SET used = ?3, updated_at = datetime('now')
         WHERE tenant_id = ?1 AND resource = ?2",
        params![tenant_id, resource, new_used],
    )
    .map_err(|e| format!("quota adjust: {e}"))?;

    Ok(QuotaDecision::ok())
}

/// Upsert a tenant's limit for a resource. Used by plan provisioning and tests.
pub fn set_limit(
    conn: &Connection,
    tenant_id: &str,
    resource: &str,
    max_allowed: i64,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO plan_limits (tenant_id, resource, used, max_allowed)
         VALUES (?1, ?2, 0, ?3)
         ON CONFLICT(tenant_id, resource) DO UPDATE SET
             max_allowed = excluded.max_allowed,
             updated_at = datetime('now')",
        params![tenant_id, resource, max_allowed],
    )
    .map_err(|e| format!("set limit: {e}"))?;
    Ok(())
}

/// Current usage for a tenant/resource, 0 when untracked.
pub fn usage(conn: &Connection, tenant_id: &str, resource: &str) -> i64 {
    conn.query_row(
        "SELECT used FROM plan_limits WHERE tenant_id = ?1 AND resource = ?2",
        params![tenant_id, resource],
        |row| row.get(0),
    )
    .unwrap_or(0)
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
    fn test_missing_row_is_unlimited() {
        let conn = test_conn();
        let d = check_and_adjust(&conn, "t1", "customers", 1).unwrap();
        assert!(d.success);
        assert_eq!(usage(&conn, "t1", "customers"), 0);
    }

    #[test]
    fn test_rejection_at_ceiling_leaves_usage_untouched() {
        let conn = test_conn();
        set_limit(&conn, "t1", "products", 2).unwrap();

        assert!(check_and_adjust(&conn, "t1", "products", 1).unwrap().success);
        assert!(check_and_adjust(&conn, "t1", "products", 1).unwrap().success);

        let rejected = check_and_adjust(&conn, "t1", "products", 1).unwrap();
        assert!(!rejected.success);
        assert!(rejected.message.unwrap().contains(LIMIT_EXCEEDED));
        assert_eq!(usage(&conn, "t1", "products"), 2);
    }

    #[test]
    fn test_release_floors_at_zero() {
        let conn = test_conn();
        set_limit(&conn, "t1", "orders", 10).unwrap();

        assert!(check_and_adjust(&conn, "t1", "orders", -3).unwrap().success);
        assert_eq!(usage(&conn, "t1", "orders"), 0);
    }

    #[test]
    fn test_limits_are_per_tenant() {
        let conn = test_conn();
        set_limit(&conn, "t1", "customers", 1).unwrap();
        assert!(check_and_adjust(&conn, "t1", "customers", 1).unwrap().success);
        assert!(!check_and_adjust(&conn, "t1", "customers", 1).unwrap().success);

        // Other tenant unaffected
        assert!(check_and_adjust(&conn, "t2", "customers", 1).unwrap().success);
    }
}
