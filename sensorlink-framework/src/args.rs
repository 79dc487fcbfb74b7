//! CLI argument parsing for gateways.

use std::path::PathBuf;

use clap::Parser;

/// Common CLI arguments for all gateways.
#[derive(Parser, Debug, Clone)]
#[command(about = "SensorLink gateway")]
pub struct BridgeArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl BridgeArgs {
    /// Parse CLI arguments, falling back to `default_config` when `--config` is absent.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .get_matches();

        match <Self as clap::FromArgMatches>::from_arg_matches(&matches) {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// Parse CLI arguments (requires --config to be specified).
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Log level to use: the CLI override if given, otherwise `configured`.
    pub fn effective_log_level(&self, configured: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| configured.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_from_explicit_args() {
        let args = <BridgeArgs as Parser>::try_parse_from([
            "zenoh-bridge-dtu",
            "--config",
            "dtu.json5",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("dtu.json5"));
        assert_eq!(args.effective_log_level("info"), "debug");
    }

    #[test]
    fn test_config_is_required_without_default() {
        assert!(<BridgeArgs as Parser>::try_parse_from(["zenoh-bridge-dtu"]).is_err());
    }

    #[test]
    fn test_configured_level_without_override() {
        let args = BridgeArgs {
            config: PathBuf::from("dtu.json5"),
            log_level: None,
        };
        assert_eq!(args.effective_log_level("warn"), "warn");
    }
}
