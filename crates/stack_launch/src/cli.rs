//! Command-line interface for stack_launch

use argh::FromArgs;
use std::collections::{HashMap, HashSet};

/// Start a stack of units in dependency order, gated on health checks
#[derive(FromArgs, Debug)]
pub struct StackArgs {
    /// path to the stack file (default: launch/observability.stack.yaml)
    #[argh(
        positional,
        default = "String::from(\"launch/observability.stack.yaml\")"
    )]
    pub stack_file: String,

    /// override interpolation variables (format: KEY=VALUE)
    #[argh(option, short = 'e', from_str_fn(parse_env_override))]
    pub env: Vec<(String, String)>,

    /// enable units in these profiles (comma-separated)
    #[argh(option, short = 'p', from_str_fn(parse_list))]
    pub profile: Option<Vec<String>>,

    /// show the start plan without launching anything
    #[argh(switch)]
    pub dry_run: bool,

    /// validate the stack file and exit
    #[argh(switch)]
    pub validate: bool,

    /// print every state transition to stdout as a JSON line
    #[argh(switch)]
    pub events_json: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse an override in format "KEY=VALUE"
fn parse_env_override(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Invalid override '{}'. Expected 'KEY=VALUE'", s)),
    }
}

/// Parse a comma-separated list, dropping empty entries
fn parse_list(s: &str) -> Result<Vec<String>, String> {
    Ok(s.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect())
}

impl StackArgs {
    /// Interpolation overrides as a map; later flags win
    pub fn env_overrides(&self) -> HashMap<String, String> {
        self.env.iter().cloned().collect()
    }

    /// Selected profiles
    pub fn profiles(&self) -> HashSet<String> {
        self.profile.iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_override() {
        let result = parse_env_override("GRAFANA_PORT=3000");
        assert_eq!(result, Ok(("GRAFANA_PORT".to_string(), "3000".to_string())));
    }

    #[test]
    fn test_parse_env_override_keeps_value_equals() {
        let result = parse_env_override("DSN=postgres://u:p@db/app?sslmode=disable");
        assert_eq!(
            result,
            Ok((
                "DSN".to_string(),
                "postgres://u:p@db/app?sslmode=disable".to_string()
            ))
        );
    }

    #[test]
    fn test_parse_env_override_invalid() {
        assert!(parse_env_override("invalid").is_err());
        assert!(parse_env_override("=value").is_err());
    }

    #[test]
    fn test_parse_list() {
        let result = parse_list("dev, tracing,,");
        assert_eq!(result, Ok(vec!["dev".to_string(), "tracing".to_string()]));
    }

    #[test]
    fn test_args_from_command_line() {
        let args = StackArgs::from_args(
            &["stack_launch"],
            &[
                "stack.yaml",
                "-e",
                "A=1",
                "-e",
                "A=2",
                "-p",
                "dev",
                "--dry-run",
            ],
        )
        .unwrap();

        assert_eq!(args.stack_file, "stack.yaml");
        assert_eq!(args.env_overrides().get("A"), Some(&"2".to_string()));
        assert!(args.profiles().contains("dev"));
        assert!(args.dry_run);
        assert!(!args.events_json);
        assert_eq!(args.log_level, "info");
    }
}
