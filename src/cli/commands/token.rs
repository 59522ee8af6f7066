use crate::cli::{build_client, ClientArgs};
use authflow::{AuthError, Result};

pub async fn execute(
    client_args: &ClientArgs,
    scopes: Vec<String>,
    account: Option<String>,
    json: bool,
) -> Result<()> {
    let client = build_client(client_args, false)?;

    let result = match client.acquire_token_silent(&scopes, account.as_deref()).await {
        Ok(result) => result,
        Err(AuthError::InteractionRequired(reason)) => {
            eprintln!("Sign-in required: {}", reason);
            eprintln!("Run: authflow login");
            std::process::exit(1);
        }
        Err(e) => return Err(e),
    };

    if json {
        let output = serde_json::json!({
            "access_token": result.access_token,
            "token_type": "Bearer",
            "expires_at": result.expires_at.to_rfc3339(),
            "scopes": result.scopes,
            "account": result.account.home_account_id,
            "from_cache": result.from_cache,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", result.access_token);
    }
    Ok(())
}
