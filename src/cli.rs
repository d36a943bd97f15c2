//! Command line options.

use std::path::PathBuf;

use thiserror::Error;

use crate::config_proxy::affinity::DEFAULT_AFFINITY_URL;
use crate::config_proxy::DEFAULT_CONFIG_URL;

const APP_DIR: &str = "veil";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CliError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("option '{0}' needs a value")]
    MissingValue(&'static str),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("unknown verbose level '{0}' (expected 'xmpp')")]
    InvalidVerbosity(String),
}

/// Stderr logging level picked with `-v` / `--verbose[=xmpp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Default,
    /// Also log raw chat traffic.
    Xmpp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub config_url: String,
    pub affinity_url: String,
    /// 0 lets the OS pick.
    pub chat_port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub lobby_chat: bool,
    pub dangerous_insecure_tls: bool,
    pub verbose: Option<Verbosity>,
    pub log_file: Option<PathBuf>,
    pub help: bool,
}

impl Default for Options {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self {
            config_url: DEFAULT_CONFIG_URL.to_string(),
            affinity_url: DEFAULT_AFFINITY_URL.to_string(),
            chat_port: 0,
            cert_path: data_dir.join("cert.pem"),
            key_path: data_dir.join("key.pem"),
            lobby_chat: true,
            dangerous_insecure_tls: false,
            verbose: None,
            log_file: None,
            help: false,
        }
    }
}

fn non_empty(flag: &'static str, value: &str) -> Result<String, CliError> {
    if value.is_empty() {
        Err(CliError::MissingValue(flag))
    } else {
        Ok(value.to_string())
    }
}

impl Options {
    /// Parse arguments, program name excluded.
    pub fn parse<I, S>(args: I) -> Result<Self, CliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Options::default();

        for arg in args {
            let arg = arg.as_ref();
            match arg {
                "-h" | "--help" => options.help = true,
                "-v" | "--verbose" => options.verbose = Some(Verbosity::Default),
                "--no-lobby-chat" => options.lobby_chat = false,
                "--dangerous-insecure-tls" => options.dangerous_insecure_tls = true,
                _ => {
                    if let Some(level) = arg.strip_prefix("--verbose=") {
                        options.verbose = Some(match level {
                            "xmpp" => Verbosity::Xmpp,
                            "" | "default" => Verbosity::Default,
                            other => return Err(CliError::InvalidVerbosity(other.to_string())),
                        });
                    } else if let Some(url) = arg.strip_prefix("--config-url=") {
                        options.config_url = non_empty("--config-url", url)?;
                    } else if let Some(url) = arg.strip_prefix("--affinity-url=") {
                        options.affinity_url = non_empty("--affinity-url", url)?;
                    } else if let Some(port) = arg.strip_prefix("--chat-port=") {
                        options.chat_port = port
                            .parse()
                            .map_err(|_| CliError::InvalidPort(port.to_string()))?;
                    } else if let Some(path) = arg.strip_prefix("--cert=") {
                        options.cert_path = non_empty("--cert", path)?.into();
                    } else if let Some(path) = arg.strip_prefix("--key=") {
                        options.key_path = non_empty("--key", path)?.into();
                    } else if let Some(path) = arg.strip_prefix("--log-file=") {
                        options.log_file = Some(non_empty("--log-file", path)?.into());
                    } else {
                        return Err(CliError::UnknownOption(arg.to_string()));
                    }
                }
            }
        }

        Ok(options)
    }
}

pub fn usage() -> String {
    format!(
        "Veil v{version}

Usage: veil [OPTIONS]

Options:
      --config-url=URL      Real client config service (default: {config})
      --affinity-url=URL    Chat affinity service (default: {affinity})
      --chat-port=PORT      Local chat listener port (default: random)
      --cert=PATH           PEM certificate presented to the chat client
      --key=PATH            PEM private key for --cert
      --no-lobby-chat       Drop lobby presence broadcasts
      --dangerous-insecure-tls
                            Disable TLS certificate verification upstream (INSECURE!)
  -v, --verbose             Enable verbose logging to stderr (no chat traffic)
      --verbose=xmpp        Enable verbose logging including chat traffic
      --log-file=PATH       Override log file directory
  -h, --help                Show this help message

Console commands:
  online | offline | mobile   Pick the visibility shown to friends
  enable | disable | toggle   Turn masking on or off
  lobby on|off                Forward or drop lobby presence
  close                       Drop the current chat session
  status                      Show current settings
  quit                        Save and exit

Environment variables:
  RUST_LOG                  Override log filter (e.g. RUST_LOG=debug)",
        version = env!("CARGO_PKG_VERSION"),
        config = DEFAULT_CONFIG_URL,
        affinity = DEFAULT_AFFINITY_URL,
    )
}
