use crate::cli::{build_client, ClientArgs};
use authflow::auth::RedirectOutcome;
use authflow::{AuthError, Result};
use url::Url;

pub async fn execute(client_args: &ClientArgs, open_browser: bool, url: String) -> Result<()> {
    let client = build_client(client_args, open_browser)?;
    let url = Url::parse(url.trim())
        .map_err(|e| AuthError::Configuration(format!("Not a valid URL ({}): {}", e, url)))?;

    match client.handle_redirect_return(&url).await? {
        RedirectOutcome::Completed(result) => {
            println!("✓ Login successful!");
            println!("  Account: {}", result.account.display_name());
            println!("  Token expires in: {}", result.expiration_display());
        }
        RedirectOutcome::NoOp => {
            println!("No pending login matches this URL; nothing to do");
            if client.pending_request()?.is_none() {
                println!("Start one with: authflow login");
            }
        }
    }
    Ok(())
}
