use crate::error::{MigrateError, MigrateResult};
use crate::legacy::LegacySourceReader;
use chrono::Local;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

pub const MIN_PHONE_LEN: usize = 8;

/// Placeholder values the legacy system accepted instead of a phone number.
const PHONE_SENTINELS: &[&str] = &[".", "000", "00000000000"];

/// Keep ASCII digits and a single leading `+`. Sentinels and results shorter
/// than [`MIN_PHONE_LEN`] yield `None`.
pub fn normalize_phone(raw: Option<&str>) -> Option<String> {
    let t = raw?.trim();
    if t.is_empty() || PHONE_SENTINELS.contains(&t) {
        return None;
    }
    let mut out = String::with_capacity(t.len());
    for c in t.chars() {
        if c.is_ascii_digit() {
            out.push(c);
        } else if c == '+' && out.is_empty() {
            out.push(c);
        }
    }
    if out.chars().count() < MIN_PHONE_LEN {
        return None;
    }
    Some(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerMatch {
    ByName,
    ByPhone,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomerResolution {
    pub customer_id: i64,
    pub matched: CustomerMatch,
    pub phone_backfilled: bool,
}

/// Maps legacy customer and branch references onto canonical target rows.
///
/// Lookups and the occasional customer insert run outside any per-record
/// transaction; a single writer is assumed.
pub struct IdentityResolver<'a> {
    source: &'a LegacySourceReader,
    target: &'a Connection,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(source: &'a LegacySourceReader, target: &'a Connection) -> Self {
        Self { source, target }
    }

    pub fn resolve_customer(&self, legacy_customer_id: i64) -> MigrateResult<CustomerResolution> {
        let legacy = self
            .source
            .customer(legacy_customer_id)?
            .ok_or(MigrateError::CustomerNotFound(legacy_customer_id))?;
        let name = legacy
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(MigrateError::BlankCustomerName(legacy.id))?;
        let phone = normalize_phone(legacy.mobile.as_deref());

        if let Some((customer_id, existing_phone)) = self.find_by_name(name)? {
            let mut phone_backfilled = false;
            let missing_phone = existing_phone
                .as_deref()
                .map(|p| p.trim().is_empty())
                .unwrap_or(true);
            if missing_phone {
                if let Some(p) = phone.as_deref() {
                    self.target.execute(
                        "UPDATE Customer SET phone = ? WHERE id = ?",
                        (p, customer_id),
                    )?;
                    phone_backfilled = true;
                    debug!(customer_id, "backfilled customer phone");
                }
            }
            return Ok(CustomerResolution {
                customer_id,
                matched: CustomerMatch::ByName,
                phone_backfilled,
            });
        }

        if let Some(p) = phone.as_deref() {
            if let Some(customer_id) = self.find_by_phone(p)? {
                return Ok(CustomerResolution {
                    customer_id,
                    matched: CustomerMatch::ByPhone,
                    phone_backfilled: false,
                });
            }
        }

        let created_at = Local::now().naive_local().format("%Y-%m-%d %H:%M:%S").to_string();
        self.target.execute(
            "INSERT INTO Customer(name, phone, address, customFields, createdAt)
             VALUES(?, ?, NULL, NULL, ?)",
            (name, phone.as_deref(), &created_at),
        )?;
        let customer_id = self.target.last_insert_rowid();
        info!(
            legacy_customer_id,
            customer_id, "created customer from legacy client"
        );
        Ok(CustomerResolution {
            customer_id,
            matched: CustomerMatch::Created,
            phone_backfilled: false,
        })
    }

    /// Canonical branch with the same name as the legacy branch, if any.
    pub fn resolve_branch(&self, legacy_branch_id: Option<i64>) -> MigrateResult<Option<i64>> {
        let Some(legacy_branch_id) = legacy_branch_id else {
            return Ok(None);
        };
        let Some(name) = self.source.branch_name(legacy_branch_id)? else {
            return Ok(None);
        };
        let id = self
            .target
            .query_row(
                "SELECT id FROM Branch WHERE name = ? LIMIT 1",
                [name.trim()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id)
    }

    fn find_by_name(&self, name: &str) -> MigrateResult<Option<(i64, Option<String>)>> {
        let row = self
            .target
            .query_row(
                "SELECT id, phone FROM Customer
                 WHERE name = ? AND deletedAt IS NULL
                 ORDER BY id
                 LIMIT 1",
                [name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    fn find_by_phone(&self, phone: &str) -> MigrateResult<Option<i64>> {
        let id = self
            .target
            .query_row(
                "SELECT id FROM Customer
                 WHERE phone = ? AND deletedAt IS NULL
                 ORDER BY id
                 LIMIT 1",
                [phone],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> (LegacySourceReader, Connection) {
        let staging = Connection::open_in_memory().expect("open staging");
        staging
            .execute_batch(include_str!("../tests/fixtures/staging_schema.sql"))
            .expect("staging schema");
        let target = Connection::open_in_memory().expect("open target");
        target
            .execute_batch(include_str!("../tests/fixtures/target_schema.sql"))
            .expect("target schema");
        (LegacySourceReader::from_connection(staging), target)
    }

    fn customer_count(target: &Connection) -> i64 {
        target
            .query_row("SELECT COUNT(*) FROM Customer", [], |r| r.get(0))
            .expect("count customers")
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(
            normalize_phone(Some("0100 123-4567")),
            Some("01001234567".to_string())
        );
        assert_eq!(
            normalize_phone(Some("+20 100 123 4567")),
            Some("+201001234567".to_string())
        );
        assert_eq!(
            normalize_phone(Some("20+100+1234")),
            Some("201001234".to_string())
        );
        assert_eq!(normalize_phone(Some("1234567")), None);
        assert_eq!(normalize_phone(Some("00000000000")), None);
        assert_eq!(normalize_phone(Some(".")), None);
        assert_eq!(normalize_phone(Some("no phone")), None);
        assert_eq!(normalize_phone(None), None);
    }

    #[test]
    fn same_name_resolves_to_one_customer() {
        let (source, target) = stores();
        source
            .connection()
            .execute_batch(
                "INSERT INTO clients(id, name, mobile) VALUES
                   (1, 'Ahmed Ali', '01001234567'),
                   (2, 'Ahmed Ali', '01119998888');",
            )
            .expect("seed clients");
        let resolver = IdentityResolver::new(&source, &target);

        let a = resolver.resolve_customer(1).expect("first");
        let b = resolver.resolve_customer(2).expect("second");
        let again = resolver.resolve_customer(1).expect("repeat");

        assert_eq!(a.matched, CustomerMatch::Created);
        assert_eq!(b.matched, CustomerMatch::ByName);
        assert_eq!(a.customer_id, b.customer_id);
        assert_eq!(a.customer_id, again.customer_id);
        assert_eq!(customer_count(&target), 1);

        let phone: Option<String> = target
            .query_row("SELECT phone FROM Customer WHERE id = ?", [a.customer_id], |r| {
                r.get(0)
            })
            .expect("phone");
        assert_eq!(phone.as_deref(), Some("01001234567"));
    }

    #[test]
    fn name_match_backfills_missing_phone_only() {
        let (source, target) = stores();
        source
            .connection()
            .execute_batch(
                "INSERT INTO clients(id, name, mobile) VALUES
                   (1, 'Mona Samir', '0122 333 4444'),
                   (2, 'Karim Adel', '0155 666 7777');",
            )
            .expect("seed clients");
        target
            .execute_batch(
                "INSERT INTO Customer(id, name, phone, createdAt) VALUES
                   (10, 'Mona Samir', NULL, '2024-01-01'),
                   (11, 'Karim Adel', '0999999999', '2024-01-01');",
            )
            .expect("seed customers");
        let resolver = IdentityResolver::new(&source, &target);

        let mona = resolver.resolve_customer(1).expect("mona");
        assert_eq!(mona.customer_id, 10);
        assert!(mona.phone_backfilled);

        let karim = resolver.resolve_customer(2).expect("karim");
        assert_eq!(karim.customer_id, 11);
        assert!(!karim.phone_backfilled);
        let kept: String = target
            .query_row("SELECT phone FROM Customer WHERE id = 11", [], |r| r.get(0))
            .expect("phone");
        assert_eq!(kept, "0999999999");
    }

    #[test]
    fn phone_match_used_when_name_differs() {
        let (source, target) = stores();
        source
            .connection()
            .execute(
                "INSERT INTO clients(id, name, mobile) VALUES(1, 'A. Hassan', '(010) 5555-1234')",
                [],
            )
            .expect("seed client");
        target
            .execute(
                "INSERT INTO Customer(id, name, phone, createdAt)
                 VALUES(7, 'Ahmed Hassan', '01055551234', '2024-01-01')",
                [],
            )
            .expect("seed customer");
        let resolver = IdentityResolver::new(&source, &target);

        let r = resolver.resolve_customer(1).expect("resolve");
        assert_eq!(r.customer_id, 7);
        assert_eq!(r.matched, CustomerMatch::ByPhone);
        assert_eq!(customer_count(&target), 1);
    }

    #[test]
    fn soft_deleted_customers_are_not_matched() {
        let (source, target) = stores();
        source
            .connection()
            .execute("INSERT INTO clients(id, name, mobile) VALUES(1, 'Old Name', NULL)", [])
            .expect("seed client");
        target
            .execute(
                "INSERT INTO Customer(id, name, createdAt, deletedAt)
                 VALUES(3, 'Old Name', '2024-01-01', '2024-06-01')",
                [],
            )
            .expect("seed customer");
        let resolver = IdentityResolver::new(&source, &target);

        let r = resolver.resolve_customer(1).expect("resolve");
        assert_eq!(r.matched, CustomerMatch::Created);
        assert_ne!(r.customer_id, 3);
    }

    #[test]
    fn missing_or_blank_legacy_customer_fails() {
        let (source, target) = stores();
        source
            .connection()
            .execute("INSERT INTO clients(id, name, mobile) VALUES(5, '   ', '01001234567')", [])
            .expect("seed client");
        let resolver = IdentityResolver::new(&source, &target);

        assert!(matches!(
            resolver.resolve_customer(404),
            Err(MigrateError::CustomerNotFound(404))
        ));
        assert!(matches!(
            resolver.resolve_customer(5),
            Err(MigrateError::BlankCustomerName(5))
        ));
        assert_eq!(customer_count(&target), 0);
    }

    #[test]
    fn branch_lookup_is_optional() {
        let (source, target) = stores();
        source
            .connection()
            .execute_batch(
                "INSERT INTO branches(id, name) VALUES(1, 'Nasr City'), (2, 'Closed Branch');",
            )
            .expect("seed branches");
        target
            .execute("INSERT INTO Branch(id, name) VALUES(4, 'Nasr City')", [])
            .expect("seed target branch");
        let resolver = IdentityResolver::new(&source, &target);

        assert_eq!(resolver.resolve_branch(Some(1)).expect("hit"), Some(4));
        assert_eq!(resolver.resolve_branch(Some(2)).expect("target miss"), None);
        assert_eq!(resolver.resolve_branch(Some(99)).expect("staging miss"), None);
        assert_eq!(resolver.resolve_branch(None).expect("no ref"), None);
    }
}
