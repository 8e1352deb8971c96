use quill_core::models::User;
use quill_core::{Identity, IdentitySource};

use crate::commands::common::{format_timestamp, Paths, Session};
use crate::error::CliError;

pub async fn run_whoami(paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let identity = *session.client().identity();
    let profile = session.client().profile();
    session.close().await?;

    for line in format_identity_lines(&identity, profile.as_ref()) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_identity_lines(identity: &Identity, profile: Option<&User>) -> Vec<String> {
    let source = match identity.source {
        IdentitySource::Restored => "restored",
        IdentitySource::Minted => "new install",
        IdentitySource::MintedAfterTimeout => "new (storage restore timed out)",
    };
    let mut lines = vec![format!("user:     {}", identity.user_id), format!("identity: {source}")];

    match profile {
        Some(user) => {
            lines.push(format!(
                "code:     {}",
                user.referral_code.as_deref().unwrap_or("-")
            ));
            if let Some(used) = &user.used_referral_code {
                lines.push(format!("referred: {used}"));
            }
            lines.push(format!("credits:  {}", user.credits));
            lines.push(format!("since:    {}", format_timestamp(user.created_at)));
        }
        None => lines.push("account:  not created yet (run any command while online)".to_string()),
    }
    lines
}
