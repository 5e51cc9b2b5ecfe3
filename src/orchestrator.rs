use crate::builder::EntityBuilder;
use crate::config::MigrateConfig;
use crate::db;
use crate::error::{MigrateError, MigrateResult};
use crate::identity::{CustomerMatch, IdentityResolver};
use crate::legacy::{LegacyRecord, LegacySourceReader, SourceInventory, STAGING_TABLES};
use crate::model::{RecordOutcome, Summary};
use crate::report::RunReport;
use chrono::Local;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

/// Drives one migration run over every legacy record.
///
/// Per-record failures are logged, counted and recorded in the report; only
/// store-level problems (unreachable store, missing schema, unreadable record
/// list) end the run with an error.
pub struct ImportOrchestrator {
    config: MigrateConfig,
    source: LegacySourceReader,
    target: Connection,
    inventory: SourceInventory,
}

impl ImportOrchestrator {
    /// Open both stores named by `config` and check their schemas.
    pub fn open(config: MigrateConfig) -> MigrateResult<Self> {
        let source = LegacySourceReader::open(&config.staging_db)?;
        let target = db::open_target(&config.target_db)?;
        Self::from_parts(config, source, target)
    }

    pub fn from_parts(
        config: MigrateConfig,
        source: LegacySourceReader,
        target: Connection,
    ) -> MigrateResult<Self> {
        db::require_tables(source.connection(), "staging", STAGING_TABLES)?;
        db::require_target_schema(&target)?;

        let inventory = source.inventory()?;
        info!(
            records = inventory.records,
            customers = inventory.customers,
            status_events = inventory.status_events,
            distinct_service_titles = inventory.distinct_service_titles,
            "staging inventory"
        );
        Ok(Self {
            config,
            source,
            target,
            inventory,
        })
    }

    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    pub fn run(&self) -> MigrateResult<RunReport> {
        let started_at = Local::now();
        let records = self.source.read_records()?;
        let total = records.len();
        info!(total, currency = %self.config.currency, "starting legacy import");

        let mut summary = Summary::default();
        let mut outcomes = Vec::with_capacity(total);
        for (idx, record) in records.iter().enumerate() {
            summary.records_seen += 1;
            outcomes.push(self.process_record(record, &mut summary));

            let done = idx + 1;
            if self.config.progress_every > 0 && done % self.config.progress_every == 0 {
                info!(done, total, errors = summary.errors, "import progress");
            }
        }

        info!(
            records_seen = summary.records_seen,
            devices_created = summary.devices_created,
            repair_requests_created = summary.repair_requests_created,
            invoices_created = summary.invoices_created,
            invoice_items_created = summary.invoice_items_created,
            customers_created = summary.customers_created,
            already_imported = summary.already_imported,
            errors = summary.errors,
            "legacy import finished"
        );

        Ok(RunReport::new(
            started_at,
            Local::now(),
            &self.config,
            self.inventory.clone(),
            summary,
            outcomes,
        ))
    }

    fn process_record(&self, record: &LegacyRecord, summary: &mut Summary) -> RecordOutcome {
        match self.import_record(record, summary) {
            Ok(outcome) => outcome,
            Err(MigrateError::AlreadyImported(legacy_id)) => {
                summary.already_imported += 1;
                debug!(legacy_id, "legacy record already imported, skipping");
                RecordOutcome::AlreadyImported { legacy_id }
            }
            Err(e) => {
                summary.errors += 1;
                if e.is_identity_failure() {
                    warn!(legacy_id = record.id, code = e.code(), error = %e, "customer unresolved, record skipped");
                } else {
                    warn!(legacy_id = record.id, code = e.code(), error = %e, "record import failed");
                }
                RecordOutcome::Failed {
                    legacy_id: record.id,
                    code: e.code().to_string(),
                    message: e.to_string(),
                }
            }
        }
    }

    fn import_record(
        &self,
        record: &LegacyRecord,
        summary: &mut Summary,
    ) -> MigrateResult<RecordOutcome> {
        if self.config.skip_already_imported && self.already_imported(record.id)? {
            return Err(MigrateError::AlreadyImported(record.id));
        }

        let client_id = record.client_id.ok_or(MigrateError::MissingCustomerRef)?;
        let identity = IdentityResolver::new(&self.source, &self.target);
        let customer = identity.resolve_customer(client_id)?;
        if customer.matched == CustomerMatch::Created {
            summary.customers_created += 1;
        }
        debug!(
            legacy_id = record.id,
            customer_id = customer.customer_id,
            matched = ?customer.matched,
            phone_backfilled = customer.phone_backfilled,
            "customer resolved"
        );

        let branch_id = match identity.resolve_branch(record.branch_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(legacy_id = record.id, error = %e, "branch lookup failed, leaving branch unset");
                None
            }
        };

        let built = EntityBuilder::new(&self.source, &self.target, &self.config.currency)
            .build_and_persist(record, customer.customer_id, branch_id)?;

        summary.devices_created += 1;
        summary.repair_requests_created += 1;
        summary.invoices_created += 1;
        summary.invoice_items_created += built.invoice_item_ids.len();

        Ok(RecordOutcome::Imported {
            legacy_id: record.id,
            customer_id: customer.customer_id,
            branch_id,
            entities: built,
        })
    }

    /// True when a repair request already traces back to `legacy_id`.
    fn already_imported(&self, legacy_id: i64) -> MigrateResult<bool> {
        let hit = self
            .target
            .query_row(
                "SELECT 1 FROM RepairRequest
                 WHERE CASE WHEN json_valid(customFields)
                            THEN json_extract(customFields, '$.oldInvoiceId')
                       END = ?
                 LIMIT 1",
                [legacy_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(hit.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SEED: &str = "
        INSERT INTO status(id, name) VALUES
          (1, 'تم الاستلام من العميل'),
          (2, 'تم تسليم الجهاز للعميل👍✨');
        INSERT INTO clients(id, name, mobile) VALUES
          (1, 'Ahmed Ali', '01001234567'),
          (2, 'Ahmed Ali', '01119998888'),
          (3, 'Sara Nabil', '01223334444');
        INSERT INTO branches(id, name) VALUES(1, 'Downtown');
        INSERT INTO invoices(id, device_type, brand, problem_description, client_id, total, paid, branche_id, date) VALUES
          (10, 'Laptop', 'HP', 'Broken hinge', 1, '300', '300', 1, '2024-03-01'),
          (11, 'Phone', 'Samsung', 'Cracked screen', 2, '200', '50', 1, '2024-03-02'),
          (12, 'Laptop', 'Lenovo', NULL, 999, '100', '0', NULL, '2024-03-03'),
          (13, 'Tablet', 'Apple', 'Battery', 3, '0', '0', 7, '2024-03-04');
        INSERT INTO invoice_status(id, invoice_id, status_id, created_at) VALUES
          (1, 10, 1, '2024-03-01 09:00:00'),
          (2, 10, 2, '2024-03-05 17:00:00');
        INSERT INTO invoice_services(id, invoice_id, title, price) VALUES
          (1, 10, 'Hinge replacement', '250'),
          (2, 10, 'Cleaning', '50'),
          (3, 11, 'Screen', '200');
    ";

    fn config() -> MigrateConfig {
        MigrateConfig {
            staging_db: PathBuf::from("staging.sqlite3"),
            target_db: PathBuf::from("target.sqlite3"),
            currency: "EGP".into(),
            progress_every: 2,
            backup_dir: None,
            report_path: None,
            skip_already_imported: true,
        }
    }

    fn orchestrator(config: MigrateConfig) -> ImportOrchestrator {
        let staging = Connection::open_in_memory().expect("open staging");
        staging
            .execute_batch(include_str!("../tests/fixtures/staging_schema.sql"))
            .expect("staging schema");
        staging.execute_batch(SEED).expect("seed staging");
        let target = Connection::open_in_memory().expect("open target");
        target
            .execute_batch(include_str!("../tests/fixtures/target_schema.sql"))
            .expect("target schema");
        target
            .execute("INSERT INTO Branch(id, name) VALUES(5, 'Downtown')", [])
            .expect("seed branch");
        ImportOrchestrator::from_parts(config, LegacySourceReader::from_connection(staging), target)
            .expect("orchestrator")
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .expect("count")
    }

    #[test]
    fn run_imports_good_records_and_isolates_failures() {
        let orch = orchestrator(config());
        let report = orch.run().expect("run");
        let s = &report.summary;

        assert_eq!(s.records_seen, 4);
        assert_eq!(s.devices_created, 3);
        assert_eq!(s.repair_requests_created, 3);
        assert_eq!(s.invoices_created, 3);
        assert_eq!(s.invoice_items_created, 3);
        assert_eq!(s.customers_created, 2);
        assert_eq!(s.errors, 1);
        assert_eq!(s.already_imported, 0);
        assert_eq!(report.inventory.records, 4);

        let target = &orch.target;
        assert_eq!(count(target, "Customer"), 2);
        assert_eq!(count(target, "Device"), 3);

        let failed: Vec<_> = report
            .outcomes
            .iter()
            .filter_map(|o| match o {
                RecordOutcome::Failed { legacy_id, code, .. } => Some((*legacy_id, code.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![(12, "customer_not_found".to_string())]);

        let (status, branch): (String, Option<i64>) = target
            .query_row(
                "SELECT status, branchId FROM RepairRequest
                 WHERE json_extract(customFields, '$.oldInvoiceId') = 10",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("request for record 10");
        assert_eq!(status, "DELIVERED");
        assert_eq!(branch, Some(5));

        let (invoice_status, total): (String, f64) = target
            .query_row(
                "SELECT i.status, i.totalAmount FROM Invoice i
                 JOIN RepairRequest r ON r.id = i.repairRequestId
                 WHERE json_extract(r.customFields, '$.oldInvoiceId') = 11",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("invoice for record 11");
        assert_eq!(invoice_status, "PARTIAL");
        assert_eq!(total, 200.0);

        let unmatched_branch: Option<i64> = target
            .query_row(
                "SELECT branchId FROM RepairRequest
                 WHERE json_extract(customFields, '$.oldInvoiceId') = 13",
                [],
                |r| r.get(0),
            )
            .expect("request for record 13");
        assert_eq!(unmatched_branch, None);
    }

    #[test]
    fn second_run_creates_nothing_new() {
        let orch = orchestrator(config());
        orch.run().expect("first run");
        let devices = count(&orch.target, "Device");
        let items = count(&orch.target, "InvoiceItem");

        let report = orch.run().expect("second run");
        assert_eq!(report.summary.already_imported, 3);
        assert_eq!(report.summary.devices_created, 0);
        assert_eq!(report.summary.customers_created, 0);
        assert_eq!(report.summary.errors, 1);
        assert_eq!(count(&orch.target, "Device"), devices);
        assert_eq!(count(&orch.target, "InvoiceItem"), items);
    }

    #[test]
    fn reimport_mode_writes_duplicates() {
        let mut cfg = config();
        cfg.skip_already_imported = false;
        let orch = orchestrator(cfg);
        orch.run().expect("first run");
        let report = orch.run().expect("second run");
        assert_eq!(report.summary.devices_created, 3);
        assert_eq!(count(&orch.target, "Device"), 6);
        assert_eq!(count(&orch.target, "Customer"), 2);
    }

    #[test]
    fn guard_ignores_malformed_custom_fields() {
        let orch = orchestrator(config());
        orch.target
            .execute_batch(
                "INSERT INTO Customer(id, name, createdAt) VALUES(50, 'Seed', '2024-01-01');
                 INSERT INTO Device(id, customerId, createdAt) VALUES(50, 50, '2024-01-01');
                 INSERT INTO RepairRequest(deviceId, customerId, reportedProblem, status, customFields, createdAt, updatedAt)
                 VALUES(50, 50, 'x', 'RECEIVED', 'not json', '2024-01-01', '2024-01-01');",
            )
            .expect("seed malformed row");
        let report = orch.run().expect("run");
        assert_eq!(report.summary.devices_created, 3);
        assert_eq!(report.summary.errors, 1);
    }

    #[test]
    fn build_failure_is_isolated_to_its_record() {
        let orch = orchestrator(config());
        orch.target
            .execute_batch(
                "CREATE TRIGGER reject_screen_line BEFORE INSERT ON InvoiceItem
                 WHEN NEW.description = 'Screen'
                 BEGIN SELECT RAISE(ABORT, 'line rejected'); END;",
            )
            .expect("trigger");

        let report = orch.run().expect("run");
        let s = &report.summary;
        assert_eq!(s.records_seen, 4);
        assert_eq!(s.devices_created, 2);
        assert_eq!(s.repair_requests_created, 2);
        assert_eq!(s.invoices_created, 2);
        assert_eq!(s.invoice_items_created, 2);
        assert_eq!(s.errors, 2);

        let failed: Vec<_> = report
            .outcomes
            .iter()
            .filter_map(|o| match o {
                RecordOutcome::Failed { legacy_id, code, .. } => Some((*legacy_id, code.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            failed,
            vec![
                (11, "db_write_failed".to_string()),
                (12, "customer_not_found".to_string()),
            ]
        );

        let rows_for = |table: &str, legacy_id: i64| -> i64 {
            orch.target
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {} WHERE json_extract(customFields, '$.oldInvoiceId') = ?",
                        table
                    ),
                    [legacy_id],
                    |r| r.get(0),
                )
                .expect("count")
        };
        assert_eq!(rows_for("Device", 11), 0);
        assert_eq!(rows_for("RepairRequest", 11), 0);
        assert_eq!(rows_for("Device", 10), 1);
        assert_eq!(rows_for("RepairRequest", 13), 1);
        assert_eq!(count(&orch.target, "Invoice"), 2);
        assert_eq!(count(&orch.target, "InvoiceItem"), 2);
    }

    #[test]
    fn missing_staging_table_is_fatal() {
        let staging = Connection::open_in_memory().expect("open staging");
        staging
            .execute_batch(include_str!("../tests/fixtures/staging_schema.sql"))
            .expect("schema");
        staging.execute_batch("DROP TABLE invoice_services").expect("drop");
        let target = Connection::open_in_memory().expect("open target");
        target
            .execute_batch(include_str!("../tests/fixtures/target_schema.sql"))
            .expect("schema");

        let err = ImportOrchestrator::from_parts(
            config(),
            LegacySourceReader::from_connection(staging),
            target,
        )
        .err()
        .expect("must fail");
        assert!(matches!(
            err,
            MigrateError::MissingTable { store: "staging", ref table } if table == "invoice_services"
        ));
    }
}
