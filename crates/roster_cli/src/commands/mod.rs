pub mod accounts;
pub mod legacy;
pub mod migrate;
pub mod token;

use miette::Result;
use roster_auth::{Account, MemberStore};

/// Which account a command targets.
#[derive(Debug, Clone, clap::Args)]
#[group(required = true, multiple = false)]
pub struct AccountSelector {
    /// Chat-platform id of an active account
    #[arg(long)]
    pub local_id: Option<String>,

    /// Provider account id
    #[arg(long)]
    pub external_id: Option<i64>,
}

impl AccountSelector {
    pub async fn find(&self, members: &MemberStore) -> Result<Option<Account>> {
        let account = match (&self.local_id, self.external_id) {
            (_, Some(external_id)) => members.get_by_external_id(external_id).await?,
            (Some(local_id), None) => members.get_by_local_id(local_id).await?,
            (None, None) => None,
        };
        Ok(account)
    }

    pub fn describe(&self) -> String {
        match (&self.local_id, self.external_id) {
            (_, Some(external_id)) => format!("external id {}", external_id),
            (Some(local_id), None) => format!("local id {}", local_id),
            (None, None) => "no account".to_string(),
        }
    }
}
