use std::time::Duration;

use clap::{CommandFactory, Parser};

/// Default connection timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parses a timeout given as whole seconds (`30`) or in humantime form
/// (`500ms`, `2m`, `1m30s`).
pub fn parse_duration(arg: &str) -> Result<Duration, String> {
    let arg = arg.trim();
    if !arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit()) {
        return arg
            .parse()
            .map(Duration::from_secs)
            .map_err(|e| format!("invalid duration {}: {}", arg, e));
    }
    humantime::parse_duration(arg).map_err(|e| format!("invalid duration {}: {}", arg, e))
}

/// Checks connectivity and credentials against a single Tapo plug.
///
/// Flags may be written with one dash (`-host`) or two (`--host`).
#[derive(Parser, Debug)]
#[command(
    name = "tapo-probe",
    version,
    about,
    long_about = None,
    disable_help_flag = true,
    after_help = "Example:\n  tapo-probe -host 192.168.1.100 -username you@example.com -password secret -debug"
)]
pub struct Cli {
    /// IP address of the Tapo device (required)
    #[arg(long)]
    pub host: Option<String>,

    /// TP-Link account username (required)
    #[arg(long)]
    pub username: Option<String>,

    /// TP-Link account password (required)
    #[arg(long, allow_hyphen_values = true)]
    pub password: Option<String>,

    /// Connection timeout, e.g. 30s
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub timeout: Duration,

    /// Print credential hashes and troubleshooting hints
    #[arg(long)]
    pub debug: bool,

    /// Use the legacy RSA/AES protocol instead of KLAP
    #[arg(long)]
    pub legacy: bool,

    /// Show this help message
    #[arg(long)]
    pub help: bool,
}

/// Fully specified probe target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeArgs {
    pub host: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub debug: bool,
    pub legacy: bool,
}

impl Cli {
    /// Returns the name of the first missing required flag, or the complete
    /// arguments.
    pub fn into_probe_args(self) -> Result<ProbeArgs, &'static str> {
        fn required(value: Option<String>, flag: &'static str) -> Result<String, &'static str> {
            value.filter(|v| !v.is_empty()).ok_or(flag)
        }

        Ok(ProbeArgs {
            host: required(self.host, "-host")?,
            username: required(self.username, "-username")?,
            password: required(self.password, "-password")?,
            timeout: self.timeout,
            debug: self.debug,
            legacy: self.legacy,
        })
    }
}

/// Flags that consume the following argument as their value.
const VALUE_FLAGS: [&str; 4] = ["--host", "--username", "--password", "--timeout"];

/// Rewrites single-dash long flags (`-host`) to the double-dash form clap
/// expects. Flag values, such as a password starting with `-`, pass through
/// unchanged.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for (idx, arg) in args.into_iter().enumerate() {
        let follows_value_flag = out
            .last()
            .is_some_and(|prev| VALUE_FLAGS.contains(&prev.as_str()));
        let is_single_dash_long = idx > 0
            && !follows_value_flag
            && arg.len() > 2
            && arg.starts_with('-')
            && !arg.starts_with("--")
            && arg.chars().nth(1).is_some_and(|c| c.is_ascii_alphabetic());

        if is_single_dash_long {
            out.push(format!("-{}", arg));
        } else {
            out.push(arg);
        }
    }
    out
}

/// Renders the usage text.
pub fn usage() -> String {
    Cli::command().render_help().to_string()
}
