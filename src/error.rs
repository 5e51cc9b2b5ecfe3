//! Error types for the migration engine.

/// Top-level error enum for a migration run.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("{store} store unavailable: {source}")]
    StoreUnavailable {
        store: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{store} store is missing table {table}")]
    MissingTable { store: &'static str, table: String },

    #[error("{store} store table {table} is missing column {column}")]
    MissingColumn {
        store: &'static str,
        table: String,
        column: String,
    },

    #[error("legacy record has no customer reference")]
    MissingCustomerRef,

    #[error("legacy customer {0} not found in staging store")]
    CustomerNotFound(i64),

    #[error("legacy customer {0} has a blank name")]
    BlankCustomerName(i64),

    #[error("legacy record {0} was already imported")]
    AlreadyImported(i64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Identity failures: the record is skipped before any write happens.
    pub fn is_identity_failure(&self) -> bool {
        matches!(
            self,
            MigrateError::MissingCustomerRef
                | MigrateError::CustomerNotFound(_)
                | MigrateError::BlankCustomerName(_)
        )
    }

    /// Stable machine-readable code used in the stdout envelope and run report.
    pub fn code(&self) -> &'static str {
        match self {
            MigrateError::StoreUnavailable { .. } => "store_unavailable",
            MigrateError::MissingTable { .. } => "missing_table",
            MigrateError::MissingColumn { .. } => "missing_column",
            MigrateError::MissingCustomerRef => "missing_customer_ref",
            MigrateError::CustomerNotFound(_) => "customer_not_found",
            MigrateError::BlankCustomerName(_) => "blank_customer_name",
            MigrateError::AlreadyImported(_) => "already_imported",
            MigrateError::Config(_) => "bad_config",
            MigrateError::Sqlite(_) => "db_write_failed",
            MigrateError::Json(_) => "json_failed",
        }
    }
}

/// True when a SQLite error is a UNIQUE / PRIMARY KEY constraint violation.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

pub type MigrateResult<T> = Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn unique_violation_is_detected() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t(k TEXT UNIQUE); INSERT INTO t(k) VALUES('a');")
            .expect("seed");
        let err = conn
            .execute("INSERT INTO t(k) VALUES('a')", [])
            .expect_err("duplicate insert must fail");
        assert!(is_unique_violation(&err));

        let not_null = conn
            .execute_batch("CREATE TABLE n(k TEXT NOT NULL); INSERT INTO n(k) VALUES(NULL);")
            .expect_err("null insert must fail");
        assert!(!is_unique_violation(&not_null));
    }

    #[test]
    fn classification_matches_policy() {
        assert!(MigrateError::CustomerNotFound(3).is_identity_failure());
        assert!(MigrateError::MissingCustomerRef.is_identity_failure());
        assert!(!MigrateError::AlreadyImported(3).is_identity_failure());
        assert_eq!(MigrateError::AlreadyImported(1).code(), "already_imported");
    }
}
