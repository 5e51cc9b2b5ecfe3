mod backup;
mod builder;
mod config;
mod db;
mod envelope;
mod error;
mod identity;
mod legacy;
mod model;
mod orchestrator;
mod report;
mod status;

use clap::{Args, Parser, Subcommand};
use config::{load_config_file, ConfigFile, ConfigOverrides, MigrateConfig};
use orchestrator::ImportOrchestrator;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// Migrate legacy repair-shop records into the normalized repair database.
#[derive(Parser, Debug)]
#[command(name = "repair-migrate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import every staging record into the target database
    Run(RunArgs),
    /// Replace the target database with a backup bundle
    Restore(RestoreArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// TOML file with run settings
    #[arg(long, value_name = "FILE", env = "REPAIR_MIGRATE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite staging database loaded from the legacy dump
    #[arg(long, value_name = "FILE", env = "REPAIR_MIGRATE_STAGING_DB")]
    staging_db: Option<PathBuf>,

    /// Existing target database
    #[arg(long, value_name = "FILE", env = "REPAIR_MIGRATE_TARGET_DB")]
    target_db: Option<PathBuf>,

    /// Currency code stored on every invoice
    #[arg(long, env = "REPAIR_MIGRATE_CURRENCY")]
    currency: Option<String>,

    /// Log progress every N records (0 disables)
    #[arg(long, value_name = "N")]
    progress_every: Option<usize>,

    /// Write a backup bundle of the target here before importing
    #[arg(long, value_name = "DIR", env = "REPAIR_MIGRATE_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Write the JSON run report to this file
    #[arg(long, value_name = "FILE", env = "REPAIR_MIGRATE_REPORT")]
    report: Option<PathBuf>,

    /// Import records even when the target already holds them
    #[arg(long)]
    reimport: bool,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Bundle written by a previous run
    #[arg(long, value_name = "FILE")]
    bundle: PathBuf,

    /// Database file to replace
    #[arg(long, value_name = "FILE", env = "REPAIR_MIGRATE_TARGET_DB")]
    target_db: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let resp = match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Restore(args) => handle_restore(args),
    };

    let mut stdout = std::io::stdout();
    let _ = writeln!(
        stdout,
        "{}",
        serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
    );
    let _ = stdout.flush();

    if envelope::is_ok(&resp) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn handle_run(args: RunArgs) -> serde_json::Value {
    let config = match resolve_config(args) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return envelope::err(e.code(), e.to_string(), None);
        }
    };

    let orch = match ImportOrchestrator::open(config) {
        Ok(o) => o,
        Err(e) => {
            error!(code = e.code(), error = %e, "cannot start import");
            return envelope::err(e.code(), e.to_string(), None);
        }
    };
    let config = orch.config().clone();

    let backup = match &config.backup_dir {
        Some(dir) => match backup::export_target_bundle(&config.target_db, dir) {
            Ok(b) => {
                info!(bundle = %b.bundle_path.display(), sha256 = %b.sha256, bytes = b.bytes, "target backed up");
                Some(b)
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "backup failed, target left untouched");
                return envelope::err(
                    "backup_failed",
                    format!("{e:#}"),
                    Some(json!({ "backupDir": dir.to_string_lossy() })),
                );
            }
        },
        None => None,
    };

    let mut report = match orch.run() {
        Ok(r) => r,
        Err(e) => {
            error!(code = e.code(), error = %e, "import aborted");
            return envelope::err(e.code(), e.to_string(), None);
        }
    };
    report.backup_bundle = backup
        .as_ref()
        .map(|b| b.bundle_path.to_string_lossy().into_owned());

    let mut result = json!({
        "runId": report.run_id,
        "summary": report.summary,
    });
    if let Some(bundle) = &report.backup_bundle {
        result["backupBundle"] = json!(bundle);
    }
    if let Some(path) = &config.report_path {
        match report::write_report(path, &report) {
            Ok(()) => result["reportPath"] = json!(path.to_string_lossy()),
            // The import itself has committed; a report failure is not a run failure.
            Err(e) => {
                warn!(error = %format!("{e:#}"), "failed to write run report");
                result["reportError"] = json!(format!("{e:#}"));
            }
        }
    }
    envelope::ok(result)
}

fn resolve_config(args: RunArgs) -> error::MigrateResult<MigrateConfig> {
    let file = match &args.config {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    MigrateConfig::resolve(
        file,
        ConfigOverrides {
            staging_db: args.staging_db,
            target_db: args.target_db,
            currency: args.currency,
            progress_every: args.progress_every,
            backup_dir: args.backup_dir,
            report_path: args.report,
            reimport: args.reimport,
        },
    )
}

fn handle_restore(args: RestoreArgs) -> serde_json::Value {
    match backup::restore_target_bundle(&args.bundle, &args.target_db) {
        Ok(s) => {
            info!(target_db = %args.target_db.display(), bytes = s.bytes, "target restored");
            envelope::ok(json!({
                "bundleFormatDetected": s.bundle_format_detected,
                "sha256": s.sha256,
                "bytes": s.bytes,
                "targetDb": args.target_db.to_string_lossy(),
            }))
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "restore failed");
            envelope::err("restore_failed", format!("{e:#}"), None)
        }
    }
}
