use crate::cli::{build_client, ClientArgs};
use authflow::Result;

pub async fn execute(
    client_args: &ClientArgs,
    open_browser: bool,
    popup: bool,
    account: Option<String>,
) -> Result<()> {
    let client = build_client(client_args, open_browser)?;

    if popup {
        let cancel = client.popup_cancel_handle();
        let logout = client.logout_popup(account.as_deref(), None);
        tokio::pin!(logout);

        tokio::select! {
            result = &mut logout => result?,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                logout.await?
            }
        };
    } else {
        client.logout(account.as_deref())?;
    }

    println!("✓ Logged out successfully");
    match client.active_account() {
        Some(active) => println!("  Active account: {}", active.display_name()),
        None if !client.all_accounts().is_empty() => {
            println!("  No active account. Pick one with: authflow use <ACCOUNT_ID>")
        }
        None => {}
    }
    Ok(())
}
