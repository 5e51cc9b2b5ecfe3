use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

/// Canonical repair-request status stored in `RepairRequest.status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairStatus {
    #[default]
    Received,
    Inspection,
    ReadyForDelivery,
    WaitingParts,
    Rejected,
    Delivered,
    OnHold,
}

impl RepairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStatus::Received => "RECEIVED",
            RepairStatus::Inspection => "INSPECTION",
            RepairStatus::ReadyForDelivery => "READY_FOR_DELIVERY",
            RepairStatus::WaitingParts => "WAITING_PARTS",
            RepairStatus::Rejected => "REJECTED",
            RepairStatus::Delivered => "DELIVERED",
            RepairStatus::OnHold => "ON_HOLD",
        }
    }
}

impl fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Paid,
    Partial,
    Unpaid,
}

impl InvoiceStatus {
    /// Nothing paid is always UNPAID, even for a zero total; otherwise the
    /// invoice is PAID once `paid` covers `total`.
    pub fn from_amounts(total: Decimal, paid: Decimal) -> Self {
        if paid <= Decimal::ZERO {
            InvoiceStatus::Unpaid
        } else if paid >= total {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::Partial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Partial => "PARTIAL",
            InvoiceStatus::Unpaid => "UNPAID",
        }
    }
}

/// Row ids created for one legacy record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltEntities {
    pub device_id: i64,
    pub repair_request_id: i64,
    pub invoice_id: i64,
    pub invoice_item_ids: Vec<i64>,
    pub status: RepairStatus,
    pub invoice_status: InvoiceStatus,
}

/// Aggregate counts of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub records_seen: usize,
    pub devices_created: usize,
    pub repair_requests_created: usize,
    pub invoices_created: usize,
    pub invoice_items_created: usize,
    pub customers_created: usize,
    pub already_imported: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RecordOutcome {
    #[serde(rename_all = "camelCase")]
    Imported {
        legacy_id: i64,
        customer_id: i64,
        branch_id: Option<i64>,
        #[serde(flatten)]
        entities: BuiltEntities,
    },
    #[serde(rename_all = "camelCase")]
    AlreadyImported { legacy_id: i64 },
    #[serde(rename_all = "camelCase")]
    Failed {
        legacy_id: i64,
        code: String,
        message: String,
    },
}
