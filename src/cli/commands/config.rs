use crate::cli::{ClientArgs, ConfigCommand};
use authflow::{Config, Result};

pub fn execute(client_args: &ClientArgs, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Init => {
            let path = Config::config_file_path()?;
            Config::create_sample(&path)?;
            println!("✓ Created sample config at {}", path.display());
            println!("  Fill in client_id, authority and redirect_uri, then run: authflow login");
        }
        ConfigCommand::Show => {
            let config_path = Config::config_file_path()?;
            println!("Config file path: {}", config_path.display());
            if !config_path.exists() {
                println!("Status: File does not exist");
                println!("\nTo create a sample config file, run:");
                println!("  authflow config init");
            }

            let config = Config::load()?.with_overrides(
                client_args.client_id.clone(),
                client_args.authority.clone(),
                client_args.redirect_uri.clone(),
            );
            if !config.is_complete() {
                println!("Complete: No (missing client_id, authority or redirect_uri)");
                return Ok(());
            }

            match config.client_config() {
                Ok(client) => {
                    println!("Valid: Yes");
                    println!("\nClient:");
                    println!("  Client id: {}", client.client_id);
                    println!("  Authority: {}", client.authority);
                    println!("  Redirect URI: {}", client.redirect_uri);
                    println!("  Authorize endpoint: {}", client.authorize_endpoint()?);
                    println!("  Token endpoint: {}", client.token_endpoint()?);
                    println!("  Scopes: {}", client.scopes.join(" "));
                    println!("  Cache: {:?}", client.cache_location);
                }
                Err(e) => {
                    println!("Valid: No");
                    println!("Error: {}", e);
                }
            }
        }
    }

    Ok(())
}
