//! Account listing.

use miette::Result;
use owo_colors::OwoColorize;
use roster_auth::RosterContext;

use crate::output::Output;

/// List active accounts.
pub async fn list(ctx: &RosterContext) -> Result<()> {
    let output = Output::new();
    let accounts = ctx.members.list_active_accounts().await?;
    let total = ctx.members.count_accounts().await?;

    output.section(&format!(
        "Active accounts ({} of {})",
        accounts.len(),
        total
    ));

    for account in accounts {
        let credential = if account.encrypted_credential.is_some() {
            "credential stored".green().to_string()
        } else {
            "no credential".yellow().to_string()
        };
        output.list_item(&format!(
            "{} → {} ({}, registered {})",
            account.local_id.bright_cyan(),
            account.external_id,
            credential,
            account.registered_at.format("%Y-%m-%d")
        ));
    }
    Ok(())
}
