use crate::cli::{build_client, ClientArgs};
use authflow::{LoginRequest, Result};

pub async fn execute(
    client_args: &ClientArgs,
    open_browser: bool,
    popup: bool,
    scopes: Vec<String>,
    prompt: Option<String>,
    login_hint: Option<String>,
) -> Result<()> {
    let client = build_client(client_args, open_browser)?;
    let request = LoginRequest {
        scopes,
        prompt,
        login_hint,
        ..LoginRequest::default()
    };

    if popup {
        let cancel = client.popup_cancel_handle();
        let login = client.login_popup(&request);
        tokio::pin!(login);

        let result = tokio::select! {
            result = &mut login => result?,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                login.await?
            }
        };

        println!("✓ Login successful!");
        println!("  Account: {}", result.account.display_name());
        println!("  Token expires in: {}", result.expiration_display());
        return Ok(());
    }

    client.login_redirect(&request)?;
    println!("After signing in, copy the address your browser lands on and run:");
    println!("  authflow handle-return '<URL>'");
    Ok(())
}
