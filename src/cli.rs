use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "matrix-bridge-googlechat",
    version,
    about = "A puppeting bridge between Matrix and Google Chat"
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Print the appservice registration for the homeserver and exit
    #[arg(long)]
    pub generate_registration: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn defaults_to_config_yaml() {
        let cli = Cli::try_parse_from(["matrix-bridge-googlechat"]).expect("parse");
        assert!(!cli.generate_registration);
        if std::env::var_os("CONFIG_PATH").is_none() {
            assert_eq!(cli.config.to_str(), Some("config.yaml"));
        }
    }

    #[test]
    fn accepts_registration_flag_and_path() {
        let cli = Cli::try_parse_from([
            "matrix-bridge-googlechat",
            "--config",
            "/etc/bridge.yaml",
            "--generate-registration",
        ])
        .expect("parse");
        assert!(cli.generate_registration);
        assert_eq!(cli.config.to_str(), Some("/etc/bridge.yaml"));
    }
}
