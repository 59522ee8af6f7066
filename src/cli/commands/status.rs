use crate::cli::{build_client, ClientArgs};
use authflow::expiry::format_time_remaining;
use authflow::Result;

pub fn execute(client_args: &ClientArgs, json: bool) -> Result<()> {
    let client = build_client(client_args, false)?;
    let skew = client.config().clock_skew_seconds;
    let pending = client.pending_request()?;

    let Some(account) = client.active_account() else {
        if json {
            println!(
                "{}",
                serde_json::json!({
                    "active": false,
                    "accounts": client.all_accounts().len(),
                    "login_pending": pending.is_some(),
                })
            );
        } else {
            println!("No active account ({} signed in)", client.all_accounts().len());
            if let Some(pending) = pending {
                println!("Redirect login pending since {}", pending.created_at.format("%H:%M:%S"));
            }
        }
        std::process::exit(1);
    };

    let tokens: Vec<_> = client
        .cached_tokens()
        .into_iter()
        .filter(|t| t.home_account_id == account.home_account_id)
        .collect();

    if json {
        let token_summaries: Vec<_> = tokens
            .iter()
            .map(|t| {
                serde_json::json!({
                    "scopes": t.scopes,
                    "expired": t.is_expired(skew),
                    "expires_in_minutes": t.expires_in_minutes(),
                    "refreshable": t.refresh_token.is_some(),
                })
            })
            .collect();
        let output = serde_json::json!({
            "active": true,
            "account": account.home_account_id,
            "username": account.username,
            "authority": client.config().authority_key(),
            "tokens": token_summaries,
            "login_pending": pending.is_some(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Active account: {}", account.display_name());
    println!("  Authority: {}", client.config().authority_key());
    if tokens.is_empty() {
        println!("  No cached tokens");
    }
    for token in &tokens {
        let state = if token.is_expired(skew) {
            "expired".to_string()
        } else {
            format!("expires in {}", format_time_remaining(&token.expires_at))
        };
        println!("  [{}] {}", token.scopes.to_scope_string(), state);
    }
    Ok(())
}
