//! SQLite persistence layer for the back-office sync engine.
//!
//! Uses rusqlite with WAL mode. Every syncable collection is stored as a
//! document table: the full record lives in a `data` JSON column, with a
//! handful of fields materialized into real columns for querying (tenant,
//! identifiers, party/product references, amounts). Provides schema
//! migrations and shared connection state for the sync pipeline.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/backoffice.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("backoffice.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: Syncable document collections.
///
/// Every table shares the document core (`server_id`, `tenant_id`,
/// `local_id`, `is_deleted`, timestamps, `data`). Extra columns are
/// materialized copies of fields inside `data`, maintained on save.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- customers
        CREATE TABLE IF NOT EXISTS customers (
            server_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            local_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            name TEXT,
            mobile TEXT,
            due_amount REAL NOT NULL DEFAULT 0,
            data TEXT NOT NULL DEFAULT '{}'
        );

        -- suppliers
        CREATE TABLE IF NOT EXISTS suppliers (
            server_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            local_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            name TEXT,
            mobile TEXT,
            due_amount REAL NOT NULL DEFAULT 0,
            data TEXT NOT NULL DEFAULT '{}'
        );

        -- products
        CREATE TABLE IF NOT EXISTS products (
            server_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            local_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            name TEXT,
            description TEXT,
            track_expiry INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL DEFAULT '{}'
        );

        -- categories
        CREATE TABLE IF NOT EXISTS categories (
            server_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            local_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            name TEXT,
            data TEXT NOT NULL DEFAULT '{}'
        );

        -- product_batches (inventory arrivals)
        CREATE TABLE IF NOT EXISTS product_batches (
            server_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            local_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            product_id TEXT,
            quantity REAL NOT NULL DEFAULT 0,
            cost_price REAL,
            selling_price REAL,
            expiry TEXT,
            data TEXT NOT NULL DEFAULT '{}'
        );

        -- orders
        CREATE TABLE IF NOT EXISTS orders (
            server_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            local_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            customer_id TEXT,
            total_amount REAL NOT NULL DEFAULT 0,
            status TEXT,
            stock_deducted INTEGER NOT NULL DEFAULT 0,
            fingerprint TEXT,
            data TEXT NOT NULL DEFAULT '{}'
        );

        -- refunds
        CREATE TABLE IF NOT EXISTS refunds (
            server_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            local_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            order_id TEXT,
            total_amount REAL NOT NULL DEFAULT 0,
            data TEXT NOT NULL DEFAULT '{}'
        );

        -- vendor_orders (purchase orders)
        CREATE TABLE IF NOT EXISTS vendor_orders (
            server_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            local_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            supplier_id TEXT,
            total_amount REAL NOT NULL DEFAULT 0,
            payment_status TEXT,
            data TEXT NOT NULL DEFAULT '{}'
        );

        -- transactions (POS money movements)
        CREATE TABLE IF NOT EXISTS transactions (
            server_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            local_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            party_kind TEXT,
            party_id TEXT,
            type TEXT,
            amount REAL NOT NULL DEFAULT 0,
            data TEXT NOT NULL DEFAULT '{}'
        );

        -- ledger_entries (customer and supplier running-balance ledgers)
        CREATE TABLE IF NOT EXISTS ledger_entries (
            server_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            local_id TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            party_kind TEXT,
            party_id TEXT,
            type TEXT,
            amount REAL NOT NULL DEFAULT 0,
            data TEXT NOT NULL DEFAULT '{}'
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_customers_tenant_local ON customers(tenant_id, local_id);
        CREATE INDEX IF NOT EXISTS idx_suppliers_tenant_local ON suppliers(tenant_id, local_id);
        CREATE INDEX IF NOT EXISTS idx_products_tenant_local ON products(tenant_id, local_id);
        CREATE INDEX IF NOT EXISTS idx_categories_tenant_local ON categories(tenant_id, local_id);
        CREATE INDEX IF NOT EXISTS idx_batches_tenant_local ON product_batches(tenant_id, local_id);
        CREATE INDEX IF NOT EXISTS idx_batches_tenant_product ON product_batches(tenant_id, product_id);
        CREATE INDEX IF NOT EXISTS idx_orders_tenant_local ON orders(tenant_id, local_id);
        CREATE INDEX IF NOT EXISTS idx_orders_tenant_fp ON orders(tenant_id, fingerprint);
        CREATE INDEX IF NOT EXISTS idx_refunds_tenant_local ON refunds(tenant_id, local_id);
        CREATE INDEX IF NOT EXISTS idx_refunds_tenant_order ON refunds(tenant_id, order_id);
        CREATE INDEX IF NOT EXISTS idx_vendor_orders_tenant_local ON vendor_orders(tenant_id, local_id);
        CREATE INDEX IF NOT EXISTS idx_transactions_tenant_local ON transactions(tenant_id, local_id);
        CREATE INDEX IF NOT EXISTS idx_ledger_tenant_local ON ledger_entries(tenant_id, local_id);
        CREATE INDEX IF NOT EXISTS idx_ledger_tenant_party ON ledger_entries(tenant_id, party_kind, party_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: Plan limits and per-tenant sync watermarks.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- plan_limits (quota enforcement)
        CREATE TABLE IF NOT EXISTS plan_limits (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            tenant_id TEXT NOT NULL,
            resource TEXT NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            max_allowed INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(tenant_id, resource)
        );

        -- sync_state (latest successful sync watermark per tenant/entity type)
        CREATE TABLE IF NOT EXISTS sync_state (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            tenant_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            last_count INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(tenant_id, entity_type)
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2");
    Ok(())
}

/// Migration v3: Low-stock alert records written by the post-sync scan.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS inventory_alerts (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            tenant_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            remaining REAL NOT NULL DEFAULT 0,
            threshold REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'open',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_alerts_tenant_product ON inventory_alerts(tenant_id, product_id, status);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3");
    Ok(())
}

/// Test helper: run migrations on an in-memory connection.
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
