//! Legacy registry inspection.

use roster_auth::{ConsistencyViolation, RosterContext};

use crate::output::Output;

/// Check the legacy registry's two indexes against each other.
pub fn verify(ctx: &RosterContext) -> bool {
    let output = Output::new();
    output.section("Legacy registry");
    output.info(
        "Snapshot:",
        &ctx.config.storage.legacy_snapshot_path().display().to_string(),
    );
    output.info("Entries:", &ctx.legacy.len().to_string());

    let violations = ctx.legacy.verify_consistency();
    if violations.is_empty() {
        output.success("Indexes are consistent");
        return true;
    }

    output.error(&format!("{} consistency violations", violations.len()));
    for violation in &violations {
        output.list_item(&describe(violation));
    }
    false
}

fn describe(violation: &ConsistencyViolation) -> String {
    match violation {
        ConsistencyViolation::MissingLocalIndex {
            external_id,
            local_id,
        } => format!("active account {external_id} ({local_id}) is missing from the local-id index"),
        ConsistencyViolation::MisdirectedLocalIndex {
            local_id,
            expected,
            found,
        } => format!("local id {local_id} points at {found}, expected {expected}"),
        ConsistencyViolation::OrphanLocalIndex {
            local_id,
            external_id,
        } => format!("local id {local_id} points at unknown account {external_id}"),
        ConsistencyViolation::InactiveLocalIndex {
            local_id,
            external_id,
        } => format!("local id {local_id} points at inactive account {external_id}"),
        ConsistencyViolation::StaleLocalIndex {
            local_id,
            external_id,
            actual_local_id,
        } => format!(
            "local id {local_id} points at account {external_id}, which belongs to {actual_local_id}"
        ),
    }
}
