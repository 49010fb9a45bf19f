//! Configuration for the perch CLI.
//!
//! Config file lives at `~/.config/perch/config.toml` (or wherever
//! `--config` points). Connection settings sit at the top level; engine
//! sections (`[ctcp]`, `[notifications]`, `[sasl]`, ...) are read straight
//! into [`EngineConfig`]. The file is never written.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use perch_engine::EngineConfig;
use serde::Deserialize;

use crate::Cli;

/// Server used when none is given anywhere.
pub const DEFAULT_SERVER: &str = "irc.libera.chat";
pub const DEFAULT_TLS_PORT: u16 = 6697;
pub const DEFAULT_PLAIN_PORT: u16 = 6667;

/// The config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host` or `host:port`.
    pub server: Option<String>,
    pub port: Option<u16>,
    pub nick: Option<String>,
    pub realname: Option<String>,
    /// Defaults to true.
    pub tls: Option<bool>,
    /// Joined after registration.
    pub channels: Option<Vec<String>>,
    /// Prefix rendered lines with `[HH:MM:SS]`.
    pub timestamps: Option<bool>,
    /// Show every raw inbound line.
    pub show_raw: Option<bool>,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("perch")
        .join("config.toml")
}

impl Config {
    /// Load `path`, or the default location when `None`. A missing default
    /// file is fine; a missing explicit one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path(), false),
        };
        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Bad config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Effective settings after merging CLI args > config file > defaults.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub nick: String,
    pub realname: Option<String>,
    pub channels: Vec<String>,
    pub timestamps: bool,
    pub show_raw: bool,
    /// Handed to the engine; `autojoin` and credentials are filled in here.
    pub engine: EngineConfig,
}

/// `host:port` into its parts. IPv6 literals need brackets: `[::1]:6697`.
fn split_server(server: &str) -> (String, Option<u16>) {
    let server = server.trim();
    if let Some(rest) = server.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (server.to_string(), None),
        },
        _ => (server.to_string(), None),
    }
}

fn split_channels(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_nick() -> String {
    whoami::fallible::username()
        .ok()
        .map(|name| {
            name.chars()
                .filter(|c| c.is_ascii_alphanumeric() || "-_[]\\`^{}|".contains(*c))
                .collect::<String>()
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "perch".to_string())
}

impl Resolved {
    pub fn merge(cli: &Cli, config: &Config) -> Self {
        let server = cli
            .server
            .clone()
            .or_else(|| config.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());
        let (host, server_port) = split_server(&server);

        let tls = !cli.plain && config.tls.unwrap_or(true);
        let port = cli
            .port
            .or(server_port)
            .or(config.port)
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT });

        let nick = cli
            .nick
            .clone()
            .or_else(|| config.nick.clone())
            .unwrap_or_else(default_nick);
        let realname = cli.realname.clone().or_else(|| config.realname.clone());

        let channels = match (&cli.channels, &config.channels) {
            (Some(list), _) => split_channels(list),
            (None, Some(list)) => list.clone(),
            (None, None) => config.engine.autojoin.clone(),
        };

        let mut engine = config.engine.clone();
        engine.autojoin = channels.clone();
        if let Some(password) = &cli.server_password {
            engine.server_password = Some(password.clone());
        }
        if let Some(user) = &cli.sasl_user {
            engine.sasl.username = Some(user.clone());
            engine.sasl.enabled = true;
        }
        if let Some(password) = &cli.sasl_password {
            engine.sasl.password = Some(password.clone());
            engine.sasl.enabled = true;
        }

        Self {
            host,
            port,
            tls,
            nick,
            realname,
            channels,
            timestamps: config.timestamps.unwrap_or(true),
            show_raw: cli.raw || config.show_raw.unwrap_or(false),
            engine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("perch").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn server_parsing() {
        assert_eq!(split_server("irc.example.net"), ("irc.example.net".into(), None));
        assert_eq!(split_server("irc.example.net:6667"), ("irc.example.net".into(), Some(6667)));
        assert_eq!(split_server("[::1]:6697"), ("::1".into(), Some(6697)));
        assert_eq!(split_server("::1"), ("::1".into(), None));
    }

    #[test]
    fn defaults_without_file_or_flags() {
        let resolved = Resolved::merge(&cli(&["--nick", "me"]), &Config::default());
        assert_eq!(resolved.host, DEFAULT_SERVER);
        assert_eq!(resolved.port, DEFAULT_TLS_PORT);
        assert!(resolved.tls);
        assert!(resolved.channels.is_empty());
        assert!(!resolved.engine.sasl.enabled);
        assert!(!resolved.show_raw);
    }

    #[test]
    fn plain_switches_default_port() {
        let resolved = Resolved::merge(&cli(&["--plain", "--nick", "me"]), &Config::default());
        assert!(!resolved.tls);
        assert_eq!(resolved.port, DEFAULT_PLAIN_PORT);
    }

    #[test]
    fn cli_beats_file_beats_defaults() {
        let config = Config::parse(
            r##"
            server = "irc.file.example:7000"
            nick = "filenick"
            channels = ["#file"]
            timestamps = false

            [notifications]
            activity_summaries = false

            [sasl]
            username = "fileuser"
            "##,
        )
        .unwrap();

        let resolved = Resolved::merge(&cli(&[]), &config);
        assert_eq!(resolved.host, "irc.file.example");
        assert_eq!(resolved.port, 7000);
        assert_eq!(resolved.nick, "filenick");
        assert_eq!(resolved.channels, vec!["#file"]);
        assert_eq!(resolved.engine.autojoin, vec!["#file"]);
        assert!(!resolved.timestamps);
        assert!(!resolved.engine.notifications.activity_summaries);
        assert!(!resolved.engine.sasl.enabled);

        let resolved = Resolved::merge(
            &cli(&[
                "--server",
                "irc.cli.example",
                "--port",
                "6680",
                "--nick",
                "clinick",
                "--channels",
                "#a, #b,,",
                "--sasl-password",
                "pw",
            ]),
            &config,
        );
        assert_eq!(resolved.host, "irc.cli.example");
        assert_eq!(resolved.port, 6680);
        assert_eq!(resolved.nick, "clinick");
        assert_eq!(resolved.channels, vec!["#a", "#b"]);
        assert!(resolved.engine.sasl.enabled);
        assert_eq!(resolved.engine.sasl.username.as_deref(), Some("fileuser"));
        assert_eq!(resolved.engine.sasl.password.as_deref(), Some("pw"));
    }

    #[test]
    fn autojoin_from_engine_section_is_kept() {
        let config = Config::parse(r##"autojoin = ["#legacy"]"##).unwrap();
        let resolved = Resolved::merge(&cli(&[]), &config);
        assert_eq!(resolved.channels, vec!["#legacy"]);
    }

    #[test]
    fn bad_file_is_an_error() {
        assert!(Config::parse("server = [").is_err());
        let missing = Path::new("/nonexistent/perch/config.toml");
        let err = Config::load(Some(missing)).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
    }
}
