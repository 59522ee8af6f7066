// CLI interface
pub mod commands;

use authflow::auth::{BrowserNavigator, HttpTokenExchange, LoopbackPopupHost};
use authflow::storage::{FileStorage, Storage};
use authflow::{AuthClient, Config, EventType, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "authflow")]
#[command(about = "Sign in with OAuth 2.0 / OpenID Connect and manage cached tokens", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub client: ClientArgs,

    /// Print URLs instead of opening a browser
    #[arg(long, global = true)]
    pub no_browser: bool,

    /// Enable verbose/debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Overrides for the `[client]` section of the config file
#[derive(Args, Debug, Clone, Default)]
pub struct ClientArgs {
    /// Application (client) id
    #[arg(long, global = true)]
    pub client_id: Option<String>,

    /// Issuer URL the endpoints are derived from
    #[arg(long, global = true)]
    pub authority: Option<String>,

    /// Redirect URI registered for the application
    #[arg(long, global = true)]
    pub redirect_uri: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in through the browser
    Login {
        /// Use a loopback popup and wait for the result instead of a redirect
        #[arg(long)]
        popup: bool,

        /// Scopes to request (defaults to the configured scopes)
        #[arg(long, num_args = 1..)]
        scopes: Vec<String>,

        /// Value for the prompt parameter (login, consent, select_account, none)
        #[arg(long)]
        prompt: Option<String>,

        /// Pre-fill the username on the sign-in page
        #[arg(long)]
        login_hint: Option<String>,
    },

    /// Complete a redirect login with the URL the browser landed on
    HandleReturn {
        /// Full redirect URL including its query string
        url: String,
    },

    /// Print an access token, refreshing it if needed
    Token {
        /// Scopes the token must cover (defaults to the configured scopes)
        #[arg(long, num_args = 1..)]
        scopes: Vec<String>,

        /// Account to use instead of the active one
        #[arg(long)]
        account: Option<String>,

        /// Output in JSON format for scripting
        #[arg(long)]
        json: bool,
    },

    /// List signed-in accounts
    Accounts {
        /// Output in JSON format for scripting
        #[arg(long)]
        json: bool,
    },

    /// Make an account the active one
    Use {
        /// Home account id as shown by `authflow accounts`
        account_id: String,
    },

    /// Forget an account and its tokens without signing out at the provider
    Remove {
        account_id: String,
    },

    /// Show the active account and cached tokens
    Status {
        /// Output in JSON format for scripting
        #[arg(long)]
        json: bool,
    },

    /// Sign out an account (the active one by default)
    Logout {
        #[arg(long)]
        account: Option<String>,

        /// Show the provider's sign-out page and wait for it to finish
        #[arg(long)]
        popup: bool,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Generate shell completion scripts
    ///
    /// INSTALLATION:
    ///
    /// Bash:
    ///   eval "$(authflow completions bash)"    # Add to ~/.bashrc
    ///
    /// Zsh:
    ///   eval "$(authflow completions zsh)"     # Add to ~/.zshrc
    ///
    /// Fish:
    ///   authflow completions fish > ~/.config/fish/completions/authflow.fish
    Completions {
        /// Shell type to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write a commented sample config file
    Init,
    /// Show where the config lives and what it resolves to
    Show,
}

#[derive(Debug, Clone, ValueEnum)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

/// Resolve configuration and wire the client to the browser, the loopback
/// listener, the token endpoint and on-disk storage
pub fn build_client(args: &ClientArgs, open_browser: bool) -> Result<AuthClient> {
    let config = Config::load()?
        .with_overrides(
            args.client_id.clone(),
            args.authority.clone(),
            args.redirect_uri.clone(),
        )
        .client_config()?;

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new()?);
    let exchange = Arc::new(HttpTokenExchange::new(&config)?);
    let navigator = Arc::new(BrowserNavigator::new(open_browser));
    let popup_host = Arc::new(LoopbackPopupHost::new(
        config.redirect_uri.clone(),
        open_browser,
    ));

    let client = AuthClient::new(config, storage, exchange, navigator, popup_host)?;
    report_account_changes(&client);
    Ok(client)
}

fn report_account_changes(client: &AuthClient) {
    client.events().subscribe(|event| {
        let Some(account) = event.account() else {
            return;
        };
        match event.event_type {
            EventType::AccountAdded => eprintln!("+ New account: {}", account.display_name()),
            EventType::AccountRemoved => eprintln!("- Removed account: {}", account.display_name()),
            _ => {}
        }
    });
}

pub async fn execute(args: Cli) -> Result<()> {
    let open_browser = !args.no_browser;
    let client = &args.client;

    match args.command {
        Commands::Login {
            popup,
            scopes,
            prompt,
            login_hint,
        } => commands::login::execute(client, open_browser, popup, scopes, prompt, login_hint).await,
        Commands::HandleReturn { url } => {
            commands::handle_return::execute(client, open_browser, url).await
        }
        Commands::Token {
            scopes,
            account,
            json,
        } => commands::token::execute(client, scopes, account, json).await,
        Commands::Accounts { json } => commands::accounts::list(client, json),
        Commands::Use { account_id } => commands::accounts::use_account(client, &account_id),
        Commands::Remove { account_id } => commands::accounts::remove(client, &account_id),
        Commands::Status { json } => commands::status::execute(client, json),
        Commands::Logout { account, popup } => {
            commands::logout::execute(client, open_browser, popup, account).await
        }
        Commands::Config { command } => commands::config::execute(client, command),
        Commands::Completions { shell } => {
            commands::completions::execute(shell);
            Ok(())
        }
    }
}
