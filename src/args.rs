use std::fmt;

use crate::config::{LaunchMode, Overrides, Protocol, Role};

/// The result of parsing the program's arguments.
#[derive(Debug, PartialEq)]
pub enum ArgumentsRequest {
    /// Print the help menu to stdout and exit.
    Help,

    /// Print this program's version to stdout and exit.
    Version,

    /// Run with the provided arguments.
    Run(StartupArguments),
}

#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    pub mode: LaunchMode,
    pub overrides: Overrides,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    UnknownMode(String),
    MissingMode,
    MissingBridgeId(String),
    MissingConfigPath,
    ExtraPositional(String),
    MissingValue(String),
    InvalidPort(String, String),
    InvalidInteger(String, String),
    InvalidProtocol(String),
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::UnknownMode(arg) => write!(f, "Unknown mode {arg:?}, expected exposer, accessor or config"),
            Self::MissingMode => write!(f, "A mode must be specified: exposer, accessor or config"),
            Self::MissingBridgeId(mode) => write!(f, "Mode {mode} requires a bridge id"),
            Self::MissingConfigPath => write!(f, "Mode config requires a path to a config file"),
            Self::ExtraPositional(arg) => write!(f, "Unexpected extra argument: {arg}"),
            Self::MissingValue(arg) => write!(f, "Expected a value after {arg}"),
            Self::InvalidPort(arg, value) => write!(f, "Invalid port number after {arg}: {value}"),
            Self::InvalidInteger(arg, value) => write!(f, "Invalid integer after {arg}: {value}"),
            Self::InvalidProtocol(value) => write!(f, "Invalid protocol {value:?}, expected tcp, udp or both"),
        }
    }
}

pub fn get_version_string() -> String {
    format!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: natbridge <exposer|accessor|config> <bridge-id-or-config-path> [options...]\n",
        "\n",
        "Modes:\n",
        "  exposer <bridge-id>    Publish a local service under the given bridge id\n",
        "  accessor <bridge-id>   Forward a local port to the service behind the bridge id\n",
        "  config <path>          Load all settings from a JSON config file\n",
        "\n",
        "Options:\n",
        "  -h, --help             Display this help menu and exit\n",
        "  -V, --version          Display the version number and exit\n",
        "  --expose <port>        Port of the local service to publish (default 8080)\n",
        "  --listen <port>        Local port to accept connections on (default 5000)\n",
        "  --protocol <proto>     tcp, udp or both (default tcp; both requires exposer)\n",
        "  --secret <string>      Shared secret for mutual authentication (empty disables)\n",
        "  --status <port>        Loopback HTTP status endpoint port (0 disables, default 0)\n",
        "  --max-streams <n>      Concurrent substream budget (default 256)\n",
        "  --kbps <n>             Per-stream throttle, exposer to accessor (0 disables)\n",
        "  --tcp-retries <n>      Dial attempts against the exposed service (default 5)\n",
        "  --tcp-retry-delay <ms> Delay between dial attempts (default 500)\n",
        "  -v, --verbose          Print additional information\n",
        "  -w, --warnings         Print benign disconnect diagnostics\n",
        "  --json                 Log single-line JSON objects instead of text\n",
    )
}

fn require_value<T: Iterator<Item = String>>(arg: &str, args: &mut T) -> Result<String, ArgumentsError> {
    args.next().ok_or_else(|| ArgumentsError::MissingValue(arg.to_string()))
}

fn parse_port_arg<T: Iterator<Item = String>>(arg: &str, args: &mut T) -> Result<u16, ArgumentsError> {
    let value = require_value(arg, args)?;
    value
        .parse::<u16>()
        .map_err(|_| ArgumentsError::InvalidPort(arg.to_string(), value))
}

fn parse_u64_arg<T: Iterator<Item = String>>(arg: &str, args: &mut T) -> Result<u64, ArgumentsError> {
    let value = require_value(arg, args)?;
    value
        .parse::<u64>()
        .map_err(|_| ArgumentsError::InvalidInteger(arg.to_string(), value))
}

/// Parses the program's arguments. The first argument is expected to be the
/// program's name and is ignored.
pub fn parse_arguments<T: Iterator<Item = String>>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError> {
    args.next();

    let mut mode_word: Option<String> = None;
    let mut positional: Option<String> = None;
    let mut overrides = Overrides::default();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg == "-h" || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg == "-V" || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        } else if arg == "-v" || arg.eq_ignore_ascii_case("--verbose") {
            overrides.verbose = true;
        } else if arg == "-w" || arg.eq_ignore_ascii_case("--warnings") {
            overrides.show_warnings = true;
        } else if arg.eq_ignore_ascii_case("--json") {
            overrides.json_logs = true;
        } else if arg.eq_ignore_ascii_case("--expose") {
            overrides.exposed_port = Some(parse_port_arg(&arg, &mut args)?);
        } else if arg.eq_ignore_ascii_case("--listen") {
            overrides.listen_port = Some(parse_port_arg(&arg, &mut args)?);
        } else if arg.eq_ignore_ascii_case("--status") {
            overrides.status_port = Some(parse_port_arg(&arg, &mut args)?);
        } else if arg.eq_ignore_ascii_case("--protocol") {
            let value = require_value(&arg, &mut args)?;
            let protocol = value
                .parse::<Protocol>()
                .map_err(|()| ArgumentsError::InvalidProtocol(value))?;
            overrides.protocol = Some(protocol);
        } else if arg.eq_ignore_ascii_case("--secret") {
            overrides.secret = Some(require_value(&arg, &mut args)?);
        } else if arg.eq_ignore_ascii_case("--max-streams") {
            overrides.max_streams = Some(parse_u64_arg(&arg, &mut args)? as usize);
        } else if arg.eq_ignore_ascii_case("--kbps") {
            overrides.kbps = Some(parse_u64_arg(&arg, &mut args)?);
        } else if arg.eq_ignore_ascii_case("--tcp-retries") {
            overrides.tcp_retries = Some(parse_u64_arg(&arg, &mut args)? as u32);
        } else if arg.eq_ignore_ascii_case("--tcp-retry-delay") {
            overrides.tcp_retry_delay_ms = Some(parse_u64_arg(&arg, &mut args)?);
        } else if arg.starts_with('-') {
            return Err(ArgumentsError::UnknownArgument(arg));
        } else if mode_word.is_none() {
            mode_word = Some(arg);
        } else if positional.is_none() {
            positional = Some(arg);
        } else {
            return Err(ArgumentsError::ExtraPositional(arg));
        }
    }

    let mode_word = mode_word.ok_or(ArgumentsError::MissingMode)?;
    let mode = match mode_word.parse::<Role>() {
        Ok(role) => {
            let bridge_id = positional.ok_or(ArgumentsError::MissingBridgeId(mode_word))?;
            LaunchMode::Direct { role, bridge_id }
        }
        Err(()) if mode_word == "config" => {
            LaunchMode::ConfigFile(positional.ok_or(ArgumentsError::MissingConfigPath)?)
        }
        Err(()) => return Err(ArgumentsError::UnknownMode(mode_word)),
    };

    Ok(ArgumentsRequest::Run(StartupArguments { mode, overrides }))
}
