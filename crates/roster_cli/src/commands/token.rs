//! Token inspection and forced refresh.

use miette::Result;
use owo_colors::OwoColorize;
use roster_auth::{AccessStatus, ForcedRefresh, RosterContext};

use super::AccountSelector;
use crate::output::{format_relative_time, Output};

/// Show whether an account can make authenticated calls.
///
/// Resolving the status may refresh an expiring token.
pub async fn status(ctx: &RosterContext, selector: &AccountSelector) -> Result<bool> {
    let output = Output::new();
    let Some(account) = selector.find(&ctx.members).await? else {
        output.error(&format!("No account for {}", selector.describe()));
        return Ok(false);
    };

    output.section(&format!(
        "Token status: {} ({})",
        account.local_id.bright_cyan(),
        account.external_id
    ));
    output.info("Active:", if account.is_active { "yes" } else { "no" });

    let now = chrono::Utc::now().timestamp();
    match ctx.members.load_credential(account.external_id).await? {
        Some(credential) => {
            let expiry = credential
                .expires_at
                .map(|at| format_relative_time(at, now))
                .unwrap_or_else(|| "unknown".to_string());
            output.info("Stored token expires:", &expiry);
            output.info(
                "Refresh token:",
                if credential.refresh_token.is_some() { "present" } else { "missing" },
            );
        }
        None => output.info("Stored token:", "none usable"),
    }

    match ctx.tokens.access_status(&account).await {
        AccessStatus::Valid { tier } => {
            output.success(&format!("Valid token available from {} tier", tier));
            Ok(true)
        }
        AccessStatus::NeedsReauth => {
            output.warning("No valid token; the user needs to re-authenticate");
            Ok(false)
        }
    }
}

/// Refresh an account's token now, regardless of expiry.
pub async fn refresh(ctx: &RosterContext, selector: &AccountSelector) -> Result<bool> {
    let output = Output::new();
    let Some(account) = selector.find(&ctx.members).await? else {
        output.error(&format!("No account for {}", selector.describe()));
        return Ok(false);
    };

    let now = chrono::Utc::now().timestamp();
    match ctx.tokens.refresh_now(&account).await {
        ForcedRefresh::Refreshed { expires_at } => {
            let expiry = expires_at
                .map(|at| format_relative_time(at, now))
                .unwrap_or_else(|| "unknown".to_string());
            output.success(&format!("Refreshed; new token expires {}", expiry));
            Ok(true)
        }
        ForcedRefresh::NoCredential => {
            output.error("No usable stored credential for this account");
            Ok(false)
        }
        ForcedRefresh::NoRefreshToken => {
            output.error("Stored credential has no refresh token");
            Ok(false)
        }
        ForcedRefresh::Revoked => {
            output.error("The provider revoked this account's refresh token");
            Ok(false)
        }
        ForcedRefresh::Failed { reason } => {
            output.error(&format!("Refresh failed: {}", reason));
            Ok(false)
        }
    }
}
