use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use serimux_engine::{ListenEndpoint, MuxConfig, DEFAULT_SOCKET, DEFAULT_TRANSPORT};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod connect;
pub mod doctor;
pub mod remote;
pub mod run;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the multiplexer daemon.
    Run(RunArgs),
    /// Connect to a service through a running multiplexer.
    Connect(ConnectArgs),
    /// Act as the remote end of the serial link on a Unix socket.
    Remote(RemoteArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Run(args) => run::run(args),
        Command::Connect(args) => connect::run(args, format),
        Command::Remote(args) => remote::run(args, format),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Serial transport: a character device, or a Unix socket to connect to.
    #[arg(long, env = "SERIMUX_TRANSPORT", default_value = DEFAULT_TRANSPORT)]
    pub transport: PathBuf,
    /// Client socket path to bind.
    #[arg(long, env = "SERIMUX_SOCKET", default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,
    /// Adopt the listening socket published as ANDROID_SOCKET_<NAME> instead of binding --socket.
    #[arg(long, value_name = "NAME")]
    pub inherit: Option<String>,
    /// Permission bits for the bound client socket, in octal.
    #[arg(long, env = "SERIMUX_SOCKET_MODE", default_value = "666", value_parser = parse_mode)]
    pub socket_mode: u32,
    /// Longest single wait between Ctrl-C checks (e.g. 500ms, 1s). `0` waits
    /// without bound and leaves SIGINT at its default action.
    #[arg(long, env = "SERIMUX_POLL_INTERVAL", default_value = "500ms")]
    pub poll_interval: String,
}

impl RunArgs {
    pub fn to_config(&self) -> CliResult<MuxConfig> {
        let listen = match &self.inherit {
            Some(name) => ListenEndpoint::Inherited(name.clone()),
            None => ListenEndpoint::Path(self.socket.clone()),
        };
        Ok(MuxConfig {
            transport: self.transport.clone(),
            listen,
            socket_mode: self.socket_mode,
            poll_interval: parse_poll_interval(&self.poll_interval)?,
        })
    }
}

fn parse_poll_interval(input: &str) -> CliResult<Option<Duration>> {
    match input.trim() {
        "0" | "0s" | "0ms" => Ok(None),
        other => parse_duration(other).map(Some),
    }
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Multiplexer client socket.
    pub socket: PathBuf,
    /// Service name to request.
    pub service: String,
    /// After registration, send this payload and print the reply.
    #[arg(long)]
    pub send: Option<String>,
    /// Maximum time to wait for each reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct RemoteArgs {
    /// Socket path to bind; point `serimux run --transport` at it.
    pub socket: PathBuf,
    /// Services to accept (comma-separated). Others are refused.
    #[arg(long, value_delimiter = ',')]
    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Serial transport to check.
    #[arg(long, env = "SERIMUX_TRANSPORT", default_value = DEFAULT_TRANSPORT)]
    pub transport: PathBuf,
    /// Client socket whose directory should be writable.
    #[arg(long, env = "SERIMUX_SOCKET", default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

fn parse_mode(input: &str) -> Result<u32, String> {
    let digits = input.strip_prefix("0o").unwrap_or(input);
    let mode = u32::from_str_radix(digits, 8).map_err(|_| format!("{input} is not an octal mode"))?;
    if mode > 0o7777 {
        return Err(format!("{input} has bits outside 0o7777"));
    }
    Ok(mode)
}

pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }

    #[test]
    fn zero_poll_interval_means_unbounded_wait() {
        assert_eq!(parse_poll_interval("0").unwrap(), None);
        assert_eq!(parse_poll_interval("0ms").unwrap(), None);
        assert_eq!(
            parse_poll_interval("50ms").unwrap(),
            Some(Duration::from_millis(50))
        );
        assert_eq!(parse_poll_interval("soon").unwrap_err().code, USAGE);
    }

    #[test]
    fn parse_mode_accepts_octal() {
        assert_eq!(parse_mode("666"), Ok(0o666));
        assert_eq!(parse_mode("0o600"), Ok(0o600));
        assert!(parse_mode("8").is_err());
        assert!(parse_mode("77777").is_err());
    }
}
