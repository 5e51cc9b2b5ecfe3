use anyhow::{anyhow, Context};
use rusqlite::{Connection, OpenFlags};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/target.sqlite3";
pub const BUNDLE_FORMAT: &str = "repair-migrate-target-v1";

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub bundle_path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct RestoreSummary {
    pub bundle_format_detected: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Snapshot the target database with `VACUUM INTO` and pack it into a zip
/// bundle under `backup_dir`.
pub fn export_target_bundle(target_db: &Path, backup_dir: &Path) -> anyhow::Result<BackupSummary> {
    if !target_db.is_file() {
        return Err(anyhow!(
            "target database not found: {}",
            target_db.to_string_lossy()
        ));
    }
    std::fs::create_dir_all(backup_dir)
        .with_context(|| format!("failed to create directory {}", backup_dir.to_string_lossy()))?;

    let tag = uuid::Uuid::new_v4().simple().to_string();
    let snapshot = backup_dir.join(format!(".snapshot-{}.sqlite3", tag));
    let result = write_bundle(target_db, &snapshot, backup_dir, &tag[..8]);
    if snapshot.exists() {
        let _ = std::fs::remove_file(&snapshot);
    }
    result
}

fn write_bundle(
    target_db: &Path,
    snapshot: &Path,
    backup_dir: &Path,
    short_tag: &str,
) -> anyhow::Result<BackupSummary> {
    {
        let conn = Connection::open_with_flags(
            target_db,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open database {}", target_db.to_string_lossy()))?;
        conn.execute("VACUUM INTO ?", [snapshot.to_string_lossy().into_owned()])
            .context("failed to snapshot target database")?;
    }
    let (sha256, bytes) = sha256_file(snapshot)?;

    let exported_at = chrono::Local::now();
    let bundle_path = backup_dir.join(format!(
        "target-backup-{}-{}.zip",
        exported_at.format("%Y%m%d-%H%M%S"),
        short_tag
    ));
    let out_file = File::create(&bundle_path).with_context(|| {
        format!(
            "failed to create output file {}",
            bundle_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at.to_rfc3339(),
        "sourceDatabase": target_db.to_string_lossy(),
        "sha256": sha256,
        "bytes": bytes,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(snapshot)
        .with_context(|| format!("failed to open snapshot {}", snapshot.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(BackupSummary {
        bundle_path,
        sha256,
        bytes,
    })
}

/// Replace `target_db` with the database stored in a bundle, after checking
/// the bundle format and the snapshot checksum.
pub fn restore_target_bundle(bundle: &Path, target_db: &Path) -> anyhow::Result<RestoreSummary> {
    let in_file = File::open(bundle)
        .with_context(|| format!("failed to open bundle {}", bundle.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let expected = manifest
        .get("sha256")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest.json has no sha256"))?
        .to_string();

    if let Some(parent) = target_db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let tmp_dst = target_db.with_extension("sqlite3.restoring");
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }
    {
        let mut db_out = File::create(&tmp_dst).with_context(|| {
            format!(
                "failed to create temp database {}",
                tmp_dst.to_string_lossy()
            )
        })?;
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/target.sqlite3")?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
        db_out
            .flush()
            .context("failed to flush extracted database")?;
    }

    let (actual, bytes) = sha256_file(&tmp_dst)?;
    if actual != expected {
        let _ = std::fs::remove_file(&tmp_dst);
        return Err(anyhow!(
            "checksum mismatch: manifest {} but database entry {}",
            expected,
            actual
        ));
    }

    std::fs::rename(&tmp_dst, target_db).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            target_db.to_string_lossy()
        )
    })?;

    Ok(RestoreSummary {
        bundle_format_detected: format.to_string(),
        sha256: actual,
        bytes,
    })
}

fn sha256_file(path: &Path) -> anyhow::Result<(String, u64)> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    let bytes = std::io::copy(&mut f, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.to_string_lossy()))?;
    let hex = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    Ok((hex, bytes))
}
