use quill_core::{AwardOutcome, LedgerAudit};

use crate::commands::common::{print_json, Paths, Session};
use crate::error::CliError;

pub async fn run_referral_code(paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let client = session.client();
    let code = client.ledger().generate_code(client.owner_id()).await;
    session.close().await?;
    println!("{}", code?);
    Ok(())
}

pub async fn run_referral_redeem(code: &str, paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let client = session.client();
    let redeemed = client.ledger().redeem(code, client.owner_id()).await;
    session.close().await?;

    let event = redeemed?;
    println!(
        "Redeemed {}; your referrer is credited once your account qualifies.",
        event.code_used
    );
    Ok(())
}

pub async fn run_referral_qualify(paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let client = session.client();
    let outcome = client.ledger().qualify(client.owner_id()).await;
    session.close().await?;

    match outcome? {
        AwardOutcome::Awarded { referrer_id, credits } => {
            println!("Referral qualified; {referrer_id} now has {credits} credit(s).");
        }
        AwardOutcome::AlreadyAwarded => println!("Referral was already credited."),
    }
    Ok(())
}

pub async fn run_referral_audit(json: bool, paths: &Paths) -> Result<(), CliError> {
    let session = Session::open(paths).await?;
    let client = session.client();
    let audited = client.ledger().audit(client.owner_id()).await;
    session.close().await?;

    let audit = audited?;
    if json {
        print_json(&audit)?;
    } else {
        for line in format_audit_lines(&audit) {
            println!("{line}");
        }
    }
    check_audit(&audit)
}

pub fn format_audit_lines(audit: &LedgerAudit) -> Vec<String> {
    vec![
        format!("credits:   {}", audit.credits),
        format!("referrals: {}", audit.awarded_referrals),
        format!("expected:  {}", audit.expected_credits),
    ]
}

pub const fn check_audit(audit: &LedgerAudit) -> Result<(), CliError> {
    if audit.is_consistent() {
        Ok(())
    } else {
        Err(CliError::LedgerMismatch {
            credits: audit.credits,
            expected: audit.expected_credits,
        })
    }
}
