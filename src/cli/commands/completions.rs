use crate::cli::{Cli, Shell};
use clap::CommandFactory;
use clap_complete::{generate, Shell as ClapShell};
use std::io;

pub fn execute(shell: Shell) {
    let mut cmd = Cli::command();
    let bin_name = "authflow";

    let clap_shell = match shell {
        Shell::Bash => ClapShell::Bash,
        Shell::Zsh => ClapShell::Zsh,
        Shell::Fish => ClapShell::Fish,
        Shell::PowerShell => ClapShell::PowerShell,
        Shell::Elvish => ClapShell::Elvish,
    };

    generate(clap_shell, &mut cmd, bin_name, &mut io::stdout());

    let hint = match shell {
        Shell::Bash => "# Add to ~/.bashrc:\n#   eval \"$(authflow completions bash)\"",
        Shell::Zsh => "# Add to ~/.zshrc:\n#   eval \"$(authflow completions zsh)\"",
        Shell::Fish => {
            "# Save to:\n#   authflow completions fish > ~/.config/fish/completions/authflow.fish"
        }
        Shell::PowerShell => {
            "# Add to PowerShell profile:\n#   authflow completions powershell | Out-String | Invoke-Expression"
        }
        Shell::Elvish => "# Add to Elvish config:\n#   eval (authflow completions elvish | slurp)",
    };
    eprintln!("\n{}", hint);
}
