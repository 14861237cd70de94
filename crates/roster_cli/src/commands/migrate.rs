//! Migration reporting.

use miette::Result;
use owo_colors::OwoColorize;
use roster_auth::{MigrationOutcome, RosterContext, LEGACY_MIGRATION_NAME};

use crate::output::Output;

/// Report what the startup migration did. Returns whether it succeeded.
pub fn report(ctx: &RosterContext) -> bool {
    let output = Output::new();
    output.section(&format!("Migration {}", LEGACY_MIGRATION_NAME.bright_cyan()));

    match &ctx.migration {
        MigrationOutcome::NoLegacyData => {
            output.success("No legacy snapshot found; nothing to migrate");
            output.info(
                "Looked for:",
                &ctx.config.storage.legacy_snapshot_path().display().to_string(),
            );
        }
        MigrationOutcome::AlreadyMigrated { executed_at } => {
            output.success("Already migrated");
            output.info("Completed at:", &format_timestamp(*executed_at));
        }
        MigrationOutcome::Completed(report) => {
            output.info("Imported:", &report.imported.to_string());
            output.info("Already present:", &report.skipped.to_string());
            if let Some(backup) = &report.backup_path {
                output.info("Backup:", &backup.display().to_string());
            }
            if report.errors.is_empty() {
                output.success("Migration succeeded");
            } else {
                output.error(&format!(
                    "Migration failed with {} errors; it will be retried on next startup",
                    report.errors.len()
                ));
                for error in &report.errors {
                    output.list_item(error);
                }
            }
        }
    }

    ctx.migration.is_success()
}

/// Show every ledger row.
pub async fn ledger(ctx: &RosterContext) -> Result<()> {
    let output = Output::new();
    output.section("Migration ledger");

    let entries = ctx.members.list_migrations().await?;
    if entries.is_empty() {
        output.status("No migrations recorded");
        return Ok(());
    }

    for entry in entries {
        let state = if entry.success {
            "succeeded".bright_green().to_string()
        } else {
            "failed".bright_red().to_string()
        };
        output.info(&entry.name, &format!("{} at {}", state, format_timestamp(entry.executed_at)));
        if let Some(message) = entry.error_message {
            for line in message.lines() {
                output.list_item(line);
            }
        }
    }
    Ok(())
}

fn format_timestamp(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}
