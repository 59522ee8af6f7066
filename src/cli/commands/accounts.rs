use crate::cli::{build_client, ClientArgs};
use authflow::Result;

pub fn list(client_args: &ClientArgs, json: bool) -> Result<()> {
    let client = build_client(client_args, false)?;
    let accounts = client.all_accounts();
    let active = client.active_account().map(|a| a.home_account_id);

    if json {
        let output: Vec<_> = accounts
            .iter()
            .map(|account| {
                serde_json::json!({
                    "home_account_id": account.home_account_id,
                    "username": account.username,
                    "name": account.name,
                    "tenant_id": account.tenant_id,
                    "environment": account.environment,
                    "active": active.as_deref() == Some(account.home_account_id.as_str()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if accounts.is_empty() {
        println!("No accounts signed in");
        return Ok(());
    }

    println!("Accounts ({}):", accounts.len());
    for account in &accounts {
        let marker = if active.as_deref() == Some(account.home_account_id.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{} {}  ({})", marker, account.display_name(), account.home_account_id);
    }
    Ok(())
}

pub fn use_account(client_args: &ClientArgs, account_id: &str) -> Result<()> {
    let client = build_client(client_args, false)?;
    let account = client.set_active_account(account_id)?;
    println!("✓ Active account: {}", account.display_name());
    Ok(())
}

pub fn remove(client_args: &ClientArgs, account_id: &str) -> Result<()> {
    let client = build_client(client_args, false)?;
    let account = client.remove_account(account_id)?;
    println!("✓ Removed {}", account.display_name());
    if client.active_account().is_none() && !client.all_accounts().is_empty() {
        println!("  No active account; choose one with: authflow use <ACCOUNT_ID>");
    }
    Ok(())
}
