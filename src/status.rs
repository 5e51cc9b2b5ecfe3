use crate::error::MigrateResult;
use crate::legacy::{LegacySourceReader, LegacyStatusEvent};
use crate::model::RepairStatus;
use tracing::debug;

/// Legacy status labels as they appear in the staging `status` table.
///
/// The delivered label is stored with a mangled emoji in older dumps, so both
/// spellings are listed.
pub const STATUS_LABELS: &[(&str, RepairStatus)] = &[
    ("تم الاستلام من العميل", RepairStatus::Received),
    ("تم التسليم للمهندس وجارى الفحص", RepairStatus::Inspection),
    ("تحت الاختبارت النهائيه...", RepairStatus::Inspection),
    ("تم الاصلاح وجاهز للاستلام ✨", RepairStatus::ReadyForDelivery),
    ("بانتظار قطع غيار", RepairStatus::WaitingParts),
    ("مرفوض", RepairStatus::Rejected),
    ("تم تسليم الجهاز للعميل?✨", RepairStatus::Delivered),
    ("تم تسليم الجهاز للعميل👍✨", RepairStatus::Delivered),
    ("صيانه خارحيه", RepairStatus::OnHold),
];

/// The most recent event: greatest `(created_at, id)`. Events with an
/// unreadable timestamp sort before every dated event.
pub fn latest_event(events: &[LegacyStatusEvent]) -> Option<&LegacyStatusEvent> {
    events.iter().max_by_key(|e| (e.created_at, e.id))
}

/// Map a legacy label to the canonical status, `RECEIVED` when unknown.
pub fn translate_label(label: Option<&str>) -> RepairStatus {
    let Some(label) = label.map(str::trim).filter(|l| !l.is_empty()) else {
        return RepairStatus::default();
    };
    STATUS_LABELS
        .iter()
        .find(|(known, _)| *known == label)
        .map(|(_, status)| *status)
        .unwrap_or_default()
}

/// Resolves the status a migrated repair request starts in.
pub struct StatusTranslator<'a> {
    source: &'a LegacySourceReader,
}

impl<'a> StatusTranslator<'a> {
    pub fn new(source: &'a LegacySourceReader) -> Self {
        Self { source }
    }

    pub fn latest_status(&self, legacy_record_id: i64) -> MigrateResult<RepairStatus> {
        let events = self.source.status_events(legacy_record_id)?;
        let Some(event) = latest_event(&events) else {
            return Ok(RepairStatus::default());
        };
        let Some(status_id) = event.status_id else {
            return Ok(RepairStatus::default());
        };
        let label = self.source.status_label(status_id)?;
        let status = translate_label(label.as_deref());
        debug!(
            legacy_id = event.record_id,
            event_id = event.id,
            status_id,
            label = label.as_deref().unwrap_or(""),
            %status,
            "resolved latest legacy status"
        );
        Ok(status)
    }
}
