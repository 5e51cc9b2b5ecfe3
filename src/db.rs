use crate::error::{MigrateError, MigrateResult};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

/// Target tables and the columns the engine reads or writes in each.
pub const TARGET_COLUMNS: &[(&str, &[&str])] = &[
    (
        "Customer",
        &["id", "name", "phone", "address", "customFields", "createdAt", "deletedAt"],
    ),
    ("Branch", &["id", "name"]),
    (
        "Device",
        &[
            "id",
            "customerId",
            "deviceType",
            "brand",
            "model",
            "serialNumber",
            "cpu",
            "gpu",
            "ram",
            "storage",
            "customFields",
            "createdAt",
        ],
    ),
    (
        "RepairRequest",
        &[
            "id",
            "deviceId",
            "customerId",
            "branchId",
            "reportedProblem",
            "status",
            "customFields",
            "createdAt",
            "updatedAt",
        ],
    ),
    (
        "Invoice",
        &[
            "id",
            "repairRequestId",
            "totalAmount",
            "amountPaid",
            "status",
            "currency",
            "notes",
            "createdAt",
            "updatedAt",
        ],
    ),
    (
        "InvoiceItem",
        &[
            "id",
            "invoiceId",
            "description",
            "quantity",
            "unitPrice",
            "totalPrice",
            "itemType",
            "serviceId",
            "createdAt",
            "updatedAt",
        ],
    ),
];

/// Open an existing target database for writing. The file is never created.
pub fn open_target(path: &Path) -> MigrateResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|source| MigrateError::StoreUnavailable {
        store: "target",
        source,
    })?;
    conn.execute("PRAGMA foreign_keys = ON", [])
        .map_err(|source| MigrateError::StoreUnavailable {
            store: "target",
            source,
        })?;
    Ok(conn)
}

pub fn table_exists(conn: &Connection, table: &str) -> MigrateResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [table],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> MigrateResult<bool> {
    let sql = format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\""));
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn require_tables(conn: &Connection, store: &'static str, tables: &[&str]) -> MigrateResult<()> {
    for table in tables {
        if !table_exists(conn, table)? {
            return Err(MigrateError::MissingTable {
                store,
                table: (*table).to_string(),
            });
        }
    }
    Ok(())
}

/// Every table in [`TARGET_COLUMNS`] must exist with all listed columns.
pub fn require_target_schema(conn: &Connection) -> MigrateResult<()> {
    for (table, columns) in TARGET_COLUMNS {
        require_tables(conn, "target", &[*table])?;
        for column in columns.iter() {
            if !table_has_column(conn, table, column)? {
                return Err(MigrateError::MissingColumn {
                    store: "target",
                    table: (*table).to_string(),
                    column: (*column).to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(include_str!("../tests/fixtures/target_schema.sql"))
            .expect("schema");
        conn
    }

    #[test]
    fn fixture_schema_passes_checks() {
        let conn = target();
        require_target_schema(&conn).expect("fixture schema is complete");
        assert!(table_has_column(&conn, "RepairRequest", "customFields").expect("probe"));
        assert!(!table_has_column(&conn, "RepairRequest", "nope").expect("probe"));
    }

    #[test]
    fn missing_table_is_reported_by_name() {
        let conn = target();
        conn.execute_batch("DROP TABLE InvoiceItem").expect("drop");
        match require_target_schema(&conn) {
            Err(MigrateError::MissingTable { store, table }) => {
                assert_eq!(store, "target");
                assert_eq!(table, "InvoiceItem");
            }
            other => panic!("expected MissingTable, got {other:?}"),
        }
    }

    #[test]
    fn missing_column_is_reported_by_name() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            &include_str!("../tests/fixtures/target_schema.sql")
                .replace("    serialNumber TEXT,\n", ""),
        )
        .expect("schema");
        match require_target_schema(&conn) {
            Err(MigrateError::MissingColumn { table, column, .. }) => {
                assert_eq!(table, "Device");
                assert_eq!(column, "serialNumber");
            }
            other => panic!("expected MissingColumn, got {other:?}"),
        }
    }

    #[test]
    fn open_target_never_creates_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.sqlite3");
        let err = open_target(&path).expect_err("missing file must not open");
        assert_eq!(err.code(), "store_unavailable");
        assert!(!path.exists());
    }
}
