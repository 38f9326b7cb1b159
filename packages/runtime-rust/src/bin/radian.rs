//! `radian`: loads layered configuration and runs the selected microservices
//! until SIGINT/SIGTERM.
//!
//! Arguments of the form `-radian-seg1-seg2=value` are configuration
//! overrides; they are split off before the remaining flags are parsed.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use radian_core::{config_arg_body, DEFAULT_ARG_PREFIX, DEFAULT_CONFIG_PATH, DEFAULT_ENV_PREFIX};
use radian_runtime::logging::{self, LogFormat, DEFAULT_LOG_FILTER};
use radian_runtime::{monitoring, ManagerError, ServiceManager};
use tracing::{error, info, warn};

const MODE_ENV: &str = "RADIAN_MODE";
const CONFIG_ENV: &str = "RADIAN_CONFIG";

#[derive(Parser, Debug)]
#[command(name = "radian")]
#[command(about = "Run Radian microservices")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Microservices to run: empty, `all` or `monolith` for everything,
    /// otherwise a comma-separated list of names.
    #[arg(short, long, env = MODE_ENV, default_value = "")]
    mode: String,

    /// JSON configuration file. Skipped with a warning when absent.
    #[arg(short, long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Prefix of environment variables merged into the configuration.
    #[arg(long, default_value = DEFAULT_ENV_PREFIX)]
    env_prefix: String,

    /// Name under which the monitoring microservice is registered.
    #[arg(long, default_value = "monitoring")]
    monitoring_name: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Filter directive used when `RUST_LOG` is unset.
    #[arg(long, default_value = DEFAULT_LOG_FILTER)]
    log_filter: String,
}

/// Splits process arguments into clap's share and configuration overrides.
/// Arguments that are not valid UTF-8 are left to clap.
fn partition_args(args: impl IntoIterator<Item = OsString>) -> (Vec<OsString>, Vec<String>) {
    let mut cli_args = Vec::new();
    let mut config_args = Vec::new();
    for (index, arg) in args.into_iter().enumerate() {
        let override_arg = arg
            .to_str()
            .filter(|text| index > 0 && config_arg_body(text, DEFAULT_ARG_PREFIX).is_some())
            .map(str::to_owned);
        match override_arg {
            Some(text) => config_args.push(text),
            None => cli_args.push(arg),
        }
    }
    (cli_args, config_args)
}

/// Environment entries merged into the configuration: UTF-8 only, without
/// the variables that feed the command line itself.
fn config_env_entries(vars: impl IntoIterator<Item = (OsString, OsString)>) -> Vec<String> {
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .filter(|(key, _)| key != MODE_ENV && key != CONFIG_ENV)
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

async fn run(cli: Cli, config_args: &[String]) -> Result<(), ManagerError> {
    let mut manager = ServiceManager::new();

    if cli.config.exists() {
        manager.load_configuration(&cli.config)?;
        info!(path = %cli.config.display(), "configuration file loaded");
    } else {
        warn!(path = %cli.config.display(), "configuration file not found, continuing without it");
    }
    let env_entries =
        manager.load_from_vars(&cli.env_prefix, config_env_entries(std::env::vars_os()))?;
    let arg_entries = manager.load_from_args(DEFAULT_ARG_PREFIX, config_args)?;
    info!(env_entries, arg_entries, "configuration overrides applied");

    manager.add_microservice_creator(cli.monitoring_name, monitoring::create_microservice)?;
    manager.resolve_run_mode(&cli.mode);
    manager.run_desired().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let (cli_args, config_args) = partition_args(std::env::args_os());
    let cli = Cli::parse_from(cli_args);
    logging::init_tracing(cli.log_format, &cli.log_filter);

    match run(cli, &config_args).await {
        Ok(()) => {
            info!("all microservices stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "radian terminated with error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| (*a).to_string()).collect()
    }

    fn os_strings(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    fn env(entries: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        entries
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    #[test]
    fn config_overrides_are_split_off() {
        let (cli, config) = partition_args(os_strings(&[
            "radian",
            "--mode",
            "orders",
            "-radian-orders-Port=8080",
            "--radian-db-host=localhost",
            "--log-format",
            "pretty",
        ]));
        assert_eq!(cli, os_strings(&["radian", "--mode", "orders", "--log-format", "pretty"]));
        assert_eq!(
            config,
            strings(&["-radian-orders-Port=8080", "--radian-db-host=localhost"])
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_arguments_stay_with_clap() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let raw = OsStr::from_bytes(b"-radian-db-\xff=1").to_os_string();
        let mut args = os_strings(&["radian", "-radian-db-host=h"]);
        args.push(raw.clone());
        let (cli, config) = partition_args(args);
        assert_eq!(cli, vec![OsString::from("radian"), raw]);
        assert_eq!(config, strings(&["-radian-db-host=h"]));
    }

    #[test]
    fn command_line_variables_stay_out_of_config() {
        let entries = config_env_entries(env(&[
            (MODE_ENV, "orders"),
            (CONFIG_ENV, "/etc/radian.json"),
            ("RADIAN_DB_HOST", "localhost"),
        ]));
        assert_eq!(entries, strings(&["RADIAN_DB_HOST=localhost"]));

        let mut store = radian_core::ConfigStore::new();
        store.load_from_vars(DEFAULT_ENV_PREFIX, &entries).unwrap();
        assert!(store.get(&["MODE"]).is_err());
        assert!(store.get(&["CONFIG"]).is_err());
        assert!(store.get(&["DB", "HOST"]).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_variables_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut vars = env(&[("RADIAN_DB_HOST", "localhost")]);
        vars.push((
            OsString::from("RADIAN_DB_USER"),
            OsStr::from_bytes(b"\xff").to_os_string(),
        ));
        assert_eq!(config_env_entries(vars), strings(&["RADIAN_DB_HOST=localhost"]));
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["radian"]).unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(cli.env_prefix, DEFAULT_ENV_PREFIX);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.monitoring_name, "monitoring");
    }
}
