//! Command-line interface for the gate binary.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Command line arguments, layered on top of the configuration file.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub bind_address: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    fn command() -> Command {
        Command::new("gate")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Framed TCP gate built on single-owner modules")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("config.toml"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("Override the listen address"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Emit logs as JSON")
                    .action(ArgAction::SetTrue),
            )
    }

    pub fn parse() -> Self {
        Self::from_matches(Self::command().get_matches())
    }

    /// Parses an explicit argument list, for embedding and tests.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(Self::command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .map(String::as_str)
                    .unwrap_or("config.toml"),
            ),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_config_toml() {
        let args = CliArgs::try_parse_from(["gate"]).unwrap();
        assert_eq!(args.config_path, PathBuf::from("config.toml"));
        assert!(args.bind_address.is_none());
        assert!(args.log_level.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn overrides_are_picked_up() {
        let args = CliArgs::try_parse_from([
            "gate",
            "-c",
            "gate.toml",
            "--bind",
            "0.0.0.0:9000",
            "-l",
            "debug",
            "--json-logs",
        ])
        .unwrap();
        assert_eq!(args.config_path, PathBuf::from("gate.toml"));
        assert_eq!(args.bind_address.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }
}
