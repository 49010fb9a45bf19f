//! perch: a line-oriented IRC client.
//!
//! Reads slash commands and chat text from stdin and prints engine events
//! to stdout. Logs go to stderr (`RUST_LOG` controls the level).

mod app;
mod config;
mod input;

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use perch_engine::message::channel_name;
use perch_engine::{Engine, Event};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::app::View;
use crate::config::{Config, Resolved};
use crate::input::{Command, HELP, Input};

const QUIT_REASON: &str = "Bye";

#[derive(Parser, Debug)]
#[command(name = "perch", version, about = "Line-oriented IRC client")]
pub struct Cli {
    /// Config file (default: <config dir>/perch/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// IRC server, `host` or `host:port`
    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    nick: Option<String>,

    #[arg(long)]
    realname: Option<String>,

    /// Connect without TLS
    #[arg(long)]
    plain: bool,

    /// Comma-separated channels to join after registration
    #[arg(long)]
    channels: Option<String>,

    /// Print every raw line received
    #[arg(long)]
    raw: bool,

    /// SASL account name (defaults to the nick)
    #[arg(long)]
    sasl_user: Option<String>,

    #[arg(long, env = "PERCH_SASL_PASSWORD", hide_env_values = true)]
    sasl_password: Option<String>,

    /// Sent as PASS before registration
    #[arg(long, env = "PERCH_SERVER_PASSWORD", hide_env_values = true)]
    server_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perch_cli=info,perch_engine=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let resolved = Resolved::merge(&cli, &config);
    let view = View {
        timestamps: resolved.timestamps,
        show_raw: resolved.show_raw,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Arc::new(Engine::new(resolved.engine.clone(), Arc::new(tx)));
    let printer = tokio::spawn(print_events(rx, Arc::downgrade(&engine), view));

    tracing::info!(
        host = %resolved.host,
        port = resolved.port,
        tls = resolved.tls,
        nick = %resolved.nick,
        "connecting"
    );
    // Failure is already reported as a status line; stay up so the user can /quit.
    let _ = engine
        .connect(
            &resolved.host,
            resolved.port,
            &resolved.nick,
            resolved.realname.as_deref(),
            resolved.tls,
        )
        .await;

    let mut repl = Repl {
        engine: &engine,
        view,
        target: resolved.channels.first().map(String::as_str).map(channel_name),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                engine.quit(QUIT_REASON).await;
                break;
            }
        };
        let Some(line) = line else {
            engine.disconnect().await;
            break;
        };
        if !repl.handle(&line).await {
            break;
        }
    }

    drop(engine);
    if tokio::time::timeout(Duration::from_secs(2), printer).await.is_err() {
        tracing::debug!("event printer did not finish");
    }
    Ok(())
}

/// Print events until every sender is gone.
async fn print_events(mut rx: mpsc::UnboundedReceiver<Event>, engine: Weak<Engine>, view: View) {
    while let Some(event) = rx.recv().await {
        let me = engine.upgrade().map(|e| e.nick()).unwrap_or_default();
        if let Some(line) = view.render(&event, &me) {
            println!("{line}");
        }
    }
}

/// Input state: the engine plus the current target.
struct Repl<'a> {
    engine: &'a Engine,
    view: View,
    target: Option<String>,
}

impl Repl<'_> {
    /// Handle one input line. Returns false once the user quit.
    async fn handle(&mut self, line: &str) -> bool {
        let input = match input::parse(line) {
            Ok(Some(input)) => input,
            Ok(None) => return true,
            Err(e) => {
                self.note(&e.to_string());
                return true;
            }
        };
        match input {
            Input::Say(text) => self.say(&text).await,
            Input::Command(command) => return self.run(command).await,
        }
        true
    }

    async fn run(&mut self, command: Command) -> bool {
        match command {
            Command::Join { channel, key } => {
                self.engine.join_channel(&channel, key.as_deref()).await;
                self.target = Some(channel_name(&channel));
            }
            Command::Part { channel, reason } => {
                let Some(channel) = channel.or_else(|| self.target.clone()) else {
                    self.note("Usage: /part [channel] [reason]");
                    return true;
                };
                let channel = channel_name(&channel);
                self.engine.part_channel(&channel, reason.as_deref()).await;
                self.engine.forget_channel(&channel);
                if self.target.as_deref() == Some(channel.as_str()) {
                    self.target = None;
                }
            }
            Command::Nick(nick) => self.engine.change_nick(&nick).await,
            Command::Me(action) => match self.target.clone() {
                Some(target) => {
                    self.engine.send_action(&target, &action).await;
                    if self.engine.is_connected() {
                        let me = self.engine.nick();
                        println!("{}", self.view.own_action(&target, &me, &action));
                    }
                }
                None => self.no_target(),
            },
            Command::Notice { target, text } => self.engine.send_notice(&target, &text).await,
            Command::Topic { channel, text } => {
                let Some(channel) = channel.or_else(|| self.target.clone()) else {
                    self.note("Usage: /topic [channel] [text]");
                    return true;
                };
                self.engine.set_topic(&channel, text.as_deref()).await;
            }
            Command::Whois(nick) => self.engine.whois(&nick).await,
            Command::Raw(line) => self.engine.send_raw(&line).await,
            Command::Msg { target, text } => match text {
                Some(text) => self.send_to(&target, &text).await,
                None => {
                    self.note(&format!("Talking to {target}"));
                    self.target = Some(target);
                }
            },
            Command::Quit(reason) => {
                self.engine
                    .quit(reason.as_deref().unwrap_or(QUIT_REASON))
                    .await;
                return false;
            }
            Command::Help => {
                for line in HELP.lines() {
                    self.note(line);
                }
            }
        }
        true
    }

    async fn say(&mut self, text: &str) {
        match self.target.clone() {
            Some(target) => self.send_to(&target, text).await,
            None => self.no_target(),
        }
    }

    async fn send_to(&self, target: &str, text: &str) {
        self.engine.send_message(target, text).await;
        if self.engine.is_connected() {
            let me = self.engine.nick();
            println!("{}", self.view.own_message(target, &me, text));
        }
    }

    fn no_target(&self) {
        self.note("No target. /join a channel or /msg a nick first.");
    }

    fn note(&self, text: &str) {
        println!("{}", self.view.system(text));
    }
}
