use crate::config::MigrateConfig;
use crate::legacy::SourceInventory;
use crate::model::{RecordOutcome, Summary};
use anyhow::Context;
use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Everything one run did, written to `report_path` as pretty JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub app_version: &'static str,
    pub started_at: String,
    pub finished_at: String,
    pub staging_db: String,
    pub target_db: String,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_bundle: Option<String>,
    pub inventory: SourceInventory,
    pub summary: Summary,
    pub outcomes: Vec<RecordOutcome>,
}

impl RunReport {
    pub fn new(
        started_at: DateTime<Local>,
        finished_at: DateTime<Local>,
        config: &MigrateConfig,
        inventory: SourceInventory,
        summary: Summary,
        outcomes: Vec<RecordOutcome>,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            app_version: env!("CARGO_PKG_VERSION"),
            started_at: started_at.to_rfc3339_opts(SecondsFormat::Secs, false),
            finished_at: finished_at.to_rfc3339_opts(SecondsFormat::Secs, false),
            staging_db: config.staging_db.to_string_lossy().into_owned(),
            target_db: config.target_db.to_string_lossy().into_owned(),
            currency: config.currency.clone(),
            backup_bundle: None,
            inventory,
            summary,
            outcomes,
        }
    }
}

/// Write the report through a sibling temp file so a crash never leaves a
/// truncated report behind.
pub fn write_report(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let text = serde_json::to_string_pretty(report).context("failed to serialize run report")?;
    let tmp = path.with_extension("json.writing");
    let mut f = std::fs::File::create(&tmp)
        .with_context(|| format!("failed to create {}", tmp.to_string_lossy()))?;
    f.write_all(text.as_bytes())
        .context("failed to write run report")?;
    f.flush().context("failed to flush run report")?;
    drop(f);
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move run report to {}", path.to_string_lossy()))?;
    Ok(())
}
