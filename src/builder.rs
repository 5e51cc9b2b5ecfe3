use crate::error::{is_unique_violation, MigrateError, MigrateResult};
use crate::legacy::{
    parse_json_field, parse_legacy_datetime, LegacyRecord, LegacyService, LegacySourceReader,
};
use crate::model::{BuiltEntities, InvoiceStatus, RepairStatus};
use crate::status::StatusTranslator;
use chrono::{Local, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rusqlite::{Connection, Transaction};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

pub const CPU_MAX_LEN: usize = 100;
pub const GPU_MAX_LEN: usize = 100;
pub const RAM_MAX_LEN: usize = 50;
pub const STORAGE_MAX_LEN: usize = 50;

pub const ITEM_TYPE_SERVICE: &str = "service";

/// Label of the trailer appended to the reported problem ("old invoice number").
pub const LEGACY_ID_TRAILER_LABEL: &str = "الرقم القديم للفاتورة";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Hardware specs pulled out of the legacy specification sub-document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSpecs {
    pub cpu: Option<String>,
    pub gpu: Option<String>,
    pub ram: Option<String>,
    pub storage: Option<String>,
    /// Every key that is not one of the four well-known ones.
    pub other: Map<String, Value>,
}

impl DeviceSpecs {
    /// Never fails: absent, malformed or non-object documents give empty specs.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(Value::Object(map)) = parse_json_field(raw) else {
            return Self::default();
        };
        let mut specs = Self::default();
        for (key, value) in map {
            let slot = match key.to_ascii_lowercase().as_str() {
                "cpu" => Some((&mut specs.cpu, CPU_MAX_LEN)),
                "gpu" => Some((&mut specs.gpu, GPU_MAX_LEN)),
                "ram" => Some((&mut specs.ram, RAM_MAX_LEN)),
                "storage" => Some((&mut specs.storage, STORAGE_MAX_LEN)),
                _ => None,
            };
            // Non-scalar values and case-duplicates of a filled key go to `other`.
            match slot {
                Some((field, max)) if field.is_none() => match spec_text(&value) {
                    Some(text) => *field = Some(truncate_chars(&text, max)),
                    None => {
                        specs.other.insert(key, value);
                    }
                },
                _ => {
                    specs.other.insert(key, value);
                }
            }
        }
        specs
    }
}

fn spec_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Legacy problem description with the legacy id trailer appended.
pub fn reported_problem(description: Option<&str>, legacy_id: i64) -> String {
    let trailer = format!("({}: {})", LEGACY_ID_TRAILER_LABEL, legacy_id);
    match description.map(str::trim_end).filter(|d| !d.trim().is_empty()) {
        Some(d) => format!("{}\n\n{}", d, trailer),
        None => trailer,
    }
}

fn fmt_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn money(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Inputs gathered from the staging store before the write transaction opens.
struct PreparedRecord<'r> {
    record: &'r LegacyRecord,
    specs: DeviceSpecs,
    status: RepairStatus,
    services: Vec<LegacyService>,
    now: NaiveDateTime,
}

/// Writes the Device → RepairRequest → Invoice → InvoiceItem chain of one
/// legacy record as a single transaction.
pub struct EntityBuilder<'a> {
    source: &'a LegacySourceReader,
    target: &'a Connection,
    currency: &'a str,
}

impl<'a> EntityBuilder<'a> {
    pub fn new(source: &'a LegacySourceReader, target: &'a Connection, currency: &'a str) -> Self {
        Self {
            source,
            target,
            currency,
        }
    }

    pub fn build_and_persist(
        &self,
        record: &LegacyRecord,
        customer_id: i64,
        branch_id: Option<i64>,
    ) -> MigrateResult<BuiltEntities> {
        let prepared = PreparedRecord {
            record,
            specs: DeviceSpecs::parse(record.specifications.as_deref()),
            status: StatusTranslator::new(self.source).latest_status(record.id)?,
            services: self.source.services(record.id)?,
            now: Local::now().naive_local(),
        };

        let tx = self.target.unchecked_transaction()?;
        match self.write_chain(&tx, &prepared, customer_id, branch_id) {
            Ok(built) => {
                tx.commit()?;
                Ok(built)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback() {
                    warn!(legacy_id = record.id, error = %rb, "rollback failed");
                }
                match e {
                    MigrateError::Sqlite(ref se) if is_unique_violation(se) => {
                        Err(MigrateError::AlreadyImported(record.id))
                    }
                    other => Err(other),
                }
            }
        }
    }

    fn write_chain(
        &self,
        tx: &Transaction<'_>,
        p: &PreparedRecord<'_>,
        customer_id: i64,
        branch_id: Option<i64>,
    ) -> MigrateResult<BuiltEntities> {
        let device_id = self.insert_device(tx, p, customer_id)?;
        let repair_request_id = self.insert_repair_request(tx, p, device_id, customer_id, branch_id)?;
        let (invoice_id, invoice_status) = self.insert_invoice(tx, p, repair_request_id)?;
        let invoice_item_ids = self.insert_items(tx, p, invoice_id)?;

        debug!(
            legacy_id = p.record.id,
            device_id,
            repair_request_id,
            invoice_id,
            items = invoice_item_ids.len(),
            "wrote entity chain"
        );

        Ok(BuiltEntities {
            device_id,
            repair_request_id,
            invoice_id,
            invoice_item_ids,
            status: p.status,
            invoice_status,
        })
    }

    fn insert_device(
        &self,
        tx: &Transaction<'_>,
        p: &PreparedRecord<'_>,
        customer_id: i64,
    ) -> MigrateResult<i64> {
        let r = p.record;
        let mut custom_fields = json!({
            "oldInvoiceId": r.id,
            "purchaseDate": r.purchase_date,
            "accessories": parse_json_field(r.accessories.as_deref()),
            "examination": parse_json_field(r.examination.as_deref()),
        });
        if !p.specs.other.is_empty() {
            custom_fields["otherSpecs"] = Value::Object(p.specs.other.clone());
        }

        tx.execute(
            "INSERT INTO Device(customerId, deviceType, brand, model, serialNumber, cpu, gpu, ram, storage, customFields, createdAt)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                customer_id,
                &r.device_type,
                &r.brand,
                &r.device_model,
                &r.device_sn,
                &p.specs.cpu,
                &p.specs.gpu,
                &p.specs.ram,
                &p.specs.storage,
                serde_json::to_string(&custom_fields)?,
                fmt_ts(p.now),
            ),
        )?;
        Ok(tx.last_insert_rowid())
    }

    fn insert_repair_request(
        &self,
        tx: &Transaction<'_>,
        p: &PreparedRecord<'_>,
        device_id: i64,
        customer_id: i64,
        branch_id: Option<i64>,
    ) -> MigrateResult<i64> {
        let r = p.record;
        let received_at = r
            .entry_at
            .as_deref()
            .and_then(parse_legacy_datetime)
            .or_else(|| r.date.as_deref().and_then(parse_legacy_datetime))
            .unwrap_or(p.now);
        let custom_fields = json!({
            "oldInvoiceId": r.id,
            "oldStatusId": r.status_id,
            "oldBranchId": r.branch_id,
            "oldCreatorId": r.creator_id,
            "legacyPayment": r.payment,
            "legacyDue": r.due.to_string(),
            "legacyExitAt": r.exit_at.as_deref().and_then(parse_legacy_datetime).map(fmt_ts),
        });

        tx.execute(
            "INSERT INTO RepairRequest(deviceId, customerId, branchId, reportedProblem, status, customFields, createdAt, updatedAt)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                device_id,
                customer_id,
                branch_id,
                reported_problem(r.problem_description.as_deref(), r.id),
                p.status.as_str(),
                serde_json::to_string(&custom_fields)?,
                fmt_ts(received_at),
                fmt_ts(p.now),
            ),
        )?;
        Ok(tx.last_insert_rowid())
    }

    fn insert_invoice(
        &self,
        tx: &Transaction<'_>,
        p: &PreparedRecord<'_>,
        repair_request_id: i64,
    ) -> MigrateResult<(i64, InvoiceStatus)> {
        let r = p.record;
        let status = InvoiceStatus::from_amounts(r.total, r.paid);
        let invoiced_at = r
            .date
            .as_deref()
            .and_then(parse_legacy_datetime)
            .unwrap_or(p.now);

        tx.execute(
            "INSERT INTO Invoice(repairRequestId, totalAmount, amountPaid, status, currency, notes, createdAt, updatedAt)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                repair_request_id,
                money(r.total),
                money(r.paid),
                status.as_str(),
                self.currency,
                &r.note,
                fmt_ts(invoiced_at),
                fmt_ts(p.now),
            ),
        )?;
        Ok((tx.last_insert_rowid(), status))
    }

    fn insert_items(
        &self,
        tx: &Transaction<'_>,
        p: &PreparedRecord<'_>,
        invoice_id: i64,
    ) -> MigrateResult<Vec<i64>> {
        let mut ins = tx.prepare(
            "INSERT INTO InvoiceItem(invoiceId, description, quantity, unitPrice, totalPrice, itemType, serviceId, createdAt, updatedAt)
             VALUES(?, ?, ?, ?, ?, ?, NULL, ?, ?)",
        )?;
        let now = fmt_ts(p.now);
        let mut ids = Vec::new();
        for svc in &p.services {
            let Some(title) = svc.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
                debug!(legacy_id = p.record.id, service_id = svc.id, "skipping blank service line");
                continue;
            };
            let quantity: i64 = 1;
            let unit_price = svc.price;
            let total_price = unit_price * Decimal::from(quantity);
            ins.execute((
                invoice_id,
                title,
                quantity,
                money(unit_price),
                money(total_price),
                ITEM_TYPE_SERVICE,
                &now,
                &now,
            ))?;
            ids.push(tx.last_insert_rowid());
        }
        Ok(ids)
    }
}
