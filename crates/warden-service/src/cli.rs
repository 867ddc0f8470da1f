use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "warden", version)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compile a schema file and print it in canonical form.
    ValidateSchema { path: PathBuf },
    /// Write a sample schema and relationships, then check and look them up.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_parses_validate_schema() {
        let cli = Cli::parse_from(["warden", "validate-schema", "schema.zed"]);
        assert!(matches!(
            cli.command,
            Command::ValidateSchema { ref path } if path == &PathBuf::from("schema.zed")
        ));
    }

    #[test]
    fn cli_parses_demo() {
        let cli = Cli::parse_from(["warden", "demo"]);
        assert!(matches!(cli.command, Command::Demo));
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_config_flag_works_after_subcommand() {
        let cli = Cli::parse_from(["warden", "demo", "--config", "/etc/warden.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/warden.toml")));
    }

    #[test]
    fn cli_requires_a_subcommand() {
        assert!(Cli::try_parse_from(["warden"]).is_err());
    }

    #[test]
    fn cli_version_flag() {
        let err = Cli::try_parse_from(["warden", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
