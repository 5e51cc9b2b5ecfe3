use crate::error::{MigrateError, MigrateResult};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;

/// Tables the staging store must expose.
pub const STAGING_TABLES: &[&str] = &[
    "invoices",
    "invoice_status",
    "status",
    "clients",
    "branches",
    "invoice_services",
];

/// One flat repair ticket from the legacy `invoices` table.
#[derive(Debug, Clone, Default)]
pub struct LegacyRecord {
    pub id: i64,
    pub payment: Option<String>,
    pub device_type: Option<String>,
    pub brand: Option<String>,
    pub device_model: Option<String>,
    pub device_sn: Option<String>,
    pub purchase_date: Option<String>,
    pub problem_description: Option<String>,
    pub accessories: Option<String>,
    pub specifications: Option<String>,
    pub examination: Option<String>,
    pub date: Option<String>,
    pub entry_at: Option<String>,
    pub exit_at: Option<String>,
    pub client_id: Option<i64>,
    pub total: Decimal,
    pub paid: Decimal,
    pub due: Decimal,
    pub note: Option<String>,
    pub branch_id: Option<i64>,
    pub creator_id: Option<i64>,
    pub status_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyStatusEvent {
    pub id: i64,
    pub record_id: i64,
    pub status_id: Option<i64>,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct LegacyCustomer {
    pub id: i64,
    pub name: Option<String>,
    pub mobile: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LegacyService {
    pub id: i64,
    pub title: Option<String>,
    pub price: Decimal,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInventory {
    pub records: i64,
    pub customers: i64,
    pub status_events: i64,
    pub distinct_service_titles: i64,
}

/// Read-only access to the staging store populated from the legacy dump.
pub struct LegacySourceReader {
    conn: Connection,
}

impl LegacySourceReader {
    pub fn open(path: &Path) -> MigrateResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| MigrateError::StoreUnavailable {
            store: "staging",
            source,
        })?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// All legacy records, ascending id.
    pub fn read_records(&self) -> MigrateResult<Vec<LegacyRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payment, device_type, brand, device_model, device_sn, purchase_date,
                    problem_description, accessories, specifcations, examination, date,
                    entery_at, exit_at, client_id, total, paid, due, note, branche_id,
                    creator_id, status_id
             FROM invoices
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn status_events(&self, record_id: i64) -> MigrateResult<Vec<LegacyStatusEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, invoice_id, status_id, created_at
             FROM invoice_status
             WHERE invoice_id = ?",
        )?;
        let events = stmt
            .query_map([record_id], |row| {
                Ok(LegacyStatusEvent {
                    id: row.get(0)?,
                    record_id: row.get(1)?,
                    status_id: value_i64(row.get(2)?),
                    created_at: value_text(row.get(3)?)
                        .as_deref()
                        .and_then(parse_legacy_datetime),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn status_label(&self, status_id: i64) -> MigrateResult<Option<String>> {
        let label = self
            .conn
            .query_row(
                "SELECT name FROM status WHERE id = ? LIMIT 1",
                [status_id],
                |row| row.get::<_, Value>(0),
            )
            .optional()?;
        Ok(label.and_then(value_text))
    }

    pub fn customer(&self, client_id: i64) -> MigrateResult<Option<LegacyCustomer>> {
        let customer = self
            .conn
            .query_row(
                "SELECT id, name, mobile FROM clients WHERE id = ? LIMIT 1",
                [client_id],
                |row| {
                    Ok(LegacyCustomer {
                        id: row.get(0)?,
                        name: value_text(row.get(1)?),
                        mobile: value_text(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(customer)
    }

    pub fn branch_name(&self, branch_id: i64) -> MigrateResult<Option<String>> {
        let name = self
            .conn
            .query_row(
                "SELECT name FROM branches WHERE id = ? LIMIT 1",
                [branch_id],
                |row| row.get::<_, Value>(0),
            )
            .optional()?;
        Ok(name.and_then(value_text))
    }

    /// Free-text service lines billed on a legacy record, in entry order.
    pub fn services(&self, record_id: i64) -> MigrateResult<Vec<LegacyService>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, price FROM invoice_services WHERE invoice_id = ? ORDER BY id",
        )?;
        let services = stmt
            .query_map([record_id], |row| {
                Ok(LegacyService {
                    id: row.get(0)?,
                    title: value_text(row.get(1)?),
                    price: parse_amount(&row.get::<_, Value>(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(services)
    }

    pub fn inventory(&self) -> MigrateResult<SourceInventory> {
        let count = |sql: &str| -> MigrateResult<i64> {
            Ok(self.conn.query_row(sql, [], |row| row.get::<_, i64>(0))?)
        };
        Ok(SourceInventory {
            records: count("SELECT COUNT(*) FROM invoices")?,
            customers: count("SELECT COUNT(*) FROM clients")?,
            status_events: count("SELECT COUNT(*) FROM invoice_status")?,
            distinct_service_titles: count(
                "SELECT COUNT(DISTINCT TRIM(title)) FROM invoice_services
                 WHERE title IS NOT NULL AND TRIM(title) <> ''",
            )?,
        })
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<LegacyRecord> {
    let text = |name: &str| -> rusqlite::Result<Option<String>> {
        Ok(value_text(row.get::<_, Value>(name)?))
    };
    let int = |name: &str| -> rusqlite::Result<Option<i64>> {
        Ok(value_i64(row.get::<_, Value>(name)?))
    };
    let amount = |name: &str| -> rusqlite::Result<Decimal> {
        Ok(parse_amount(&row.get::<_, Value>(name)?))
    };

    Ok(LegacyRecord {
        id: row.get("id")?,
        payment: text("payment")?,
        device_type: text("device_type")?,
        brand: text("brand")?,
        device_model: text("device_model")?,
        device_sn: text("device_sn")?,
        purchase_date: text("purchase_date")?,
        problem_description: text("problem_description")?,
        accessories: text("accessories")?,
        specifications: text("specifcations")?,
        examination: text("examination")?,
        date: text("date")?,
        entry_at: text("entery_at")?,
        exit_at: text("exit_at")?,
        client_id: int("client_id")?,
        total: amount("total")?,
        paid: amount("paid")?,
        due: amount("due")?,
        note: text("note")?,
        branch_id: int("branche_id")?,
        creator_id: int("creator_id")?,
        status_id: int("status_id")?,
    })
}

/// Text view of a loosely typed dump column. The literal `NULL` string some
/// dump tools emit counts as absent.
pub fn value_text(v: Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Text(s) => {
            if s == "NULL" {
                None
            } else {
                Some(s)
            }
        }
        Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
    }
}

pub fn value_i64(v: Value) -> Option<i64> {
    match v {
        Value::Integer(i) => Some(i),
        Value::Real(f) if f.fract() == 0.0 => Some(f as i64),
        Value::Text(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Monetary column to an exact decimal. Anything unparseable is zero.
pub fn parse_amount(v: &Value) -> Decimal {
    match v {
        Value::Integer(i) => Decimal::from(*i),
        Value::Real(f) => Decimal::from_f64(*f).unwrap_or(Decimal::ZERO),
        Value::Text(s) => parse_amount_text(s),
        _ => Decimal::ZERO,
    }
}

fn parse_amount_text(s: &str) -> Decimal {
    // Arabic-Indic digits show up in hand-entered prices.
    let cleaned: String = s
        .chars()
        .filter_map(|c| match c {
            '\u{0660}'..='\u{0669}' => char::from_digit(c as u32 - 0x0660, 10),
            ',' | ' ' | '\u{066C}' => None,
            '\u{066B}' => Some('.'),
            _ => Some(c),
        })
        .collect();
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .unwrap_or(Decimal::ZERO)
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];

/// Legacy timestamps come as `YYYY-MM-DD`, optionally followed by a time with
/// or without fractional seconds. Zero dates and anything else yield `None`.
pub fn parse_legacy_datetime(s: &str) -> Option<NaiveDateTime> {
    let t = s.trim();
    if t.is_empty() || t == "NULL" {
        return None;
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(v) = NaiveDateTime::parse_from_str(t, fmt) {
            return Some(v);
        }
    }
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Decode a JSON sub-document stored in a text column.
///
/// Dumps sometimes keep the escaping of the source SQL literal
/// (`{\"CPU\":\"i5\"}`) or double-encode the document as a JSON string; both
/// are unwrapped. Returns `None` for absent or unparseable input.
pub fn parse_json_field(raw: Option<&str>) -> Option<serde_json::Value> {
    let t = raw?.trim();
    if t.is_empty() || t == "NULL" {
        return None;
    }
    let parsed = serde_json::from_str::<serde_json::Value>(t).ok().or_else(|| {
        let unescaped = t.replace("\\\"", "\"").replace("\\'", "'");
        serde_json::from_str::<serde_json::Value>(&unescaped).ok()
    })?;
    match parsed {
        serde_json::Value::String(inner) => {
            match serde_json::from_str::<serde_json::Value>(&inner) {
                Ok(v @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => Some(v),
                _ => Some(serde_json::Value::String(inner)),
            }
        }
        v => Some(v),
    }
}
