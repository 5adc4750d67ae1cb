use anyhow::{Context, Result};
use serde_json::Value;

use super::flag_value;
use super::runtime::Runtime;
use crate::core::terminal::{GuideSection, print_success, print_warn};
use crate::core::vault::CredentialStatus;

fn print_usage() {
    GuideSection::new("flowforge credential")
        .command("set", "Store (or replace) a service credential, encrypted")
        .command("disable", "Mark a credential inactive")
        .command("enable", "Mark a credential active again")
        .blank()
        .text("Options: --owner <id>  --service <name>  --payload <json>")
        .blank()
        .hint(
            "flowforge credential set --owner u1 --service slack --payload '{\"token\":\"xoxb-...\"}'",
            "",
        )
        .print();
    println!();
}

pub async fn run_credential_command(args: &[String]) -> Result<()> {
    let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
    if !matches!(sub_cmd, "set" | "disable" | "enable") {
        print_usage();
        return Ok(());
    }

    let owner = flag_value(args, 3, &["--owner", "-o"]).context("--owner <id> is required")?;
    let service = flag_value(args, 3, &["--service"])
        .map(|s| s.trim().to_ascii_lowercase())
        .context("--service <name> is required")?;

    let runtime = Runtime::open(true).await?;
    let vault = runtime.manager.vault();
    vault.initialize().await?;

    match sub_cmd {
        "set" => {
            let raw = flag_value(args, 3, &["--payload", "-p"]).context("--payload <json> is required")?;
            let payload: Value = serde_json::from_str(&raw).context("--payload must be JSON")?;
            if !payload.is_object() {
                anyhow::bail!("--payload must be a JSON object");
            }
            vault.store_credential(&owner, &service, &payload).await?;
            print_success(&format!("Stored {} credential for owner {}.", service, owner));
        }
        _ => {
            let status = if sub_cmd == "enable" {
                CredentialStatus::Active
            } else {
                CredentialStatus::Inactive
            };
            if vault.set_status(&owner, &service, status).await? {
                print_success(&format!(
                    "{} credential of owner {} is now {}.",
                    service,
                    owner,
                    status.as_str()
                ));
            } else {
                print_warn(&format!("No {} credential stored for owner {}.", service, owner));
            }
        }
    }
    Ok(())
}
