//! Inbound message dispatch.
//!
//! Each connection gets a [`Session`]. The reader task feeds it every line;
//! the session looks the command up in [`HANDLERS`], lets the handler mutate
//! membership/activity/registration state and emit events, and hands back
//! whatever lines must be written to the server in reply.
//!
//! Commands and numerics without a handler are ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::activity::{ActivityBatcher, ActivityKind};
use crate::config::{CtcpConfig, EngineConfig, NotificationConfig};
use crate::ctcp;
use crate::error::{EngineError, Result};
use crate::event::{Event, EventSink, SYSTEM_SENDER};
use crate::membership::{MembershipTracker, RosterUpdate};
use crate::message::{Message, channel_name, is_channel};
use crate::registration::Registration;
#[cfg(test)]
use crate::registration::Phase;

/// Nick-in-use retries before registration completes.
const MAX_NICK_ATTEMPTS: u32 = 5;

/// NAMES entries may carry one or more membership prefixes.
const NAMES_MARKERS: &[char] = &['@', '+', '%', '~', '&'];

type Handler = fn(&mut Session, &Message, &mut Vec<String>) -> Result<()>;

static HANDLERS: Lazy<HashMap<&'static str, Handler>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Handler> = HashMap::new();
    table.insert("PING", on_ping);
    table.insert("ERROR", on_error);
    table.insert("NOTICE", on_notice);
    table.insert("PRIVMSG", on_privmsg);
    table.insert("JOIN", on_join);
    table.insert("PART", on_part);
    table.insert("KICK", on_kick);
    table.insert("QUIT", on_quit);
    table.insert("NICK", on_nick);
    table.insert("TOPIC", on_topic);
    table.insert("CAP", on_cap);
    table.insert("AUTHENTICATE", on_authenticate);
    table.insert("001", on_welcome);
    table.insert("311", on_whois_user);
    table.insert("312", on_whois_server);
    table.insert("317", on_whois_idle);
    table.insert("318", on_whois_end);
    table.insert("319", on_whois_channels);
    table.insert("330", on_whois_account);
    table.insert("331", on_no_topic);
    table.insert("332", on_topic_reply);
    table.insert("333", on_topic_who_time);
    table.insert("353", on_names);
    table.insert("366", on_names_end);
    table.insert("401", on_no_such_nick);
    table.insert("421", on_unknown_command);
    table.insert("433", on_nick_in_use);
    for numeric in ["903", "904", "905", "906"] {
        table.insert(numeric, on_sasl_result);
    }
    table
});

/// State shared between the engine handle and the reader task.
#[derive(Clone)]
pub(crate) struct Shared {
    pub sink: Arc<dyn EventSink>,
    pub config: Arc<RwLock<EngineConfig>>,
    pub members: Arc<Mutex<MembershipTracker>>,
    pub activity: Arc<ActivityBatcher>,
    /// Our current nick as the server knows it.
    pub nick: Arc<Mutex<String>>,
}

impl Shared {
    pub fn new(config: EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            activity: Arc::new(ActivityBatcher::new(Arc::clone(&sink))),
            sink,
            config: Arc::new(RwLock::new(config)),
            members: Arc::new(Mutex::new(MembershipTracker::new())),
            nick: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        self.sink.emit(Event::status(text));
    }
}

/// Per-connection protocol state.
pub(crate) struct Session {
    shared: Shared,
    registration: Registration,
    base_nick: String,
    nick_attempts: u32,
    welcomed: bool,
    /// Channels (lower-cased) with a NAMES reply in progress.
    names_open: HashSet<String>,
}

impl Session {
    pub fn new(shared: Shared, nick: &str, realname: Option<&str>) -> Self {
        let registration = Registration::new(nick, realname, &shared.config.read());
        *shared.nick.lock() = nick.to_string();
        Self {
            shared,
            registration,
            base_nick: nick.to_string(),
            nick_attempts: 0,
            welcomed: false,
            names_open: HashSet::new(),
        }
    }

    /// Lines to send as soon as the socket is up.
    pub fn begin(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        self.registration.begin(&mut out);
        out
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.registration.phase()
    }

    /// Process one inbound line and return the replies it calls for.
    pub fn handle_line(&mut self, line: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.status(format!("<- {line}"));

        let Some(msg) = Message::parse(line) else {
            tracing::debug!(line, "dropping unparsable line");
            return out;
        };
        if let Some(handler) = HANDLERS.get(msg.command.as_str()) {
            if let Err(e) = handler(self, &msg, &mut out) {
                self.status(format!("Parse error: {e}"));
            }
        }
        out
    }

    fn status(&self, text: impl Into<String>) {
        self.shared.status(text);
    }

    fn message(&self, target: &str, sender: &str, text: impl Into<String>) {
        self.shared.sink.emit(Event::message(target, sender, text));
    }

    fn users(&self, update: RosterUpdate) {
        self.shared.sink.emit(Event::Users {
            target: update.channel,
            nicks: update.nicks,
        });
    }

    fn is_me(&self, nick: &str) -> bool {
        let me = self.shared.nick.lock();
        !me.is_empty() && me.eq_ignore_ascii_case(nick)
    }

    fn ctcp_config(&self) -> CtcpConfig {
        self.shared.config.read().ctcp.clone()
    }

    fn notifications(&self) -> NotificationConfig {
        self.shared.config.read().notifications.clone()
    }

    /// A JOIN/PART/KICK either goes to the batcher or is shown right away.
    fn membership_notice(&self, channel: &str, kind: ActivityKind, nick: &str, line: String) {
        let notifications = self.notifications();
        if notifications.activity_summaries {
            self.shared
                .activity
                .record(channel, kind, nick, notifications.activity_window());
        } else if notifications.show_join_part {
            self.message(channel, SYSTEM_SENDER, line);
        }
    }
}

fn with_reason(text: String, reason: Option<&str>) -> String {
    match reason.filter(|r| !r.is_empty()) {
        Some(reason) => format!("{text} ({reason})"),
        None => text,
    }
}

/// Unix timestamp as local `YYYY-MM-DD HH:MM:SS`, or the raw text if it isn't one.
fn format_timestamp(raw: &str) -> String {
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|utc| {
            utc.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| raw.to_string())
}

fn on_ping(_session: &mut Session, msg: &Message, out: &mut Vec<String>) -> Result<()> {
    out.push(format!("PONG :{}", msg.text().unwrap_or("ping")));
    Ok(())
}

fn on_error(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    session.status(format!("Server error: {}", msg.text().unwrap_or("")));
    Ok(())
}

fn on_notice(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    let Some(text) = msg.trailing() else {
        return Ok(());
    };
    let target = msg.param(0).unwrap_or("");
    let sender = msg.source();

    if ctcp::is_ctcp(text) {
        if !session.ctcp_config().ignore {
            if let Some((command, args)) = ctcp::decode(text) {
                if !command.is_empty() {
                    session.status(format!("CTCP {command} reply from {sender}: {args}"));
                }
            }
        }
        return Ok(());
    }

    let addressed = is_channel(target) || session.is_me(target);
    if session.notifications().route_notices_inline && addressed {
        session.message(target, sender, format!("[notice] {text}"));
    } else {
        session.status(format!("NOTICE from {sender}: {text}"));
    }
    Ok(())
}

fn on_privmsg(session: &mut Session, msg: &Message, out: &mut Vec<String>) -> Result<()> {
    let target = msg
        .param(0)
        .ok_or_else(|| EngineError::malformed("PRIVMSG", "missing target"))?;
    let Some(text) = msg.trailing() else {
        return Ok(());
    };
    let sender = msg.source();

    let Some((command, args)) = ctcp::decode(text) else {
        session.message(target, sender, text);
        return Ok(());
    };

    // ACTION is shown even when CTCP is ignored.
    if command == "ACTION" {
        session.message(target, SYSTEM_SENDER, format!("{sender} {args}"));
        return Ok(());
    }

    let config = session.ctcp_config();
    if config.ignore || command.is_empty() {
        return Ok(());
    }
    session.status(format!("CTCP {command} from {sender} (target {target})"));
    match command.as_str() {
        "VERSION" if config.respond_to_version => {
            out.push(format!(
                "NOTICE {sender} :{}",
                ctcp::encode("VERSION", &config.version_string)
            ));
        }
        "PING" if !args.is_empty() => {
            out.push(format!("NOTICE {sender} :{}", ctcp::encode("PING", &args)));
        }
        _ => {}
    }
    Ok(())
}

fn on_join(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    let channel = msg
        .param(0)
        .or(msg.trailing())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| EngineError::malformed("JOIN", "missing channel"))?;
    let sender = msg.source();

    let update = session.shared.members.lock().add(channel, sender);
    if let Some(update) = update {
        session.users(update);
    }
    session.membership_notice(
        channel,
        ActivityKind::Join,
        sender,
        format!("{sender} joined {channel}"),
    );
    Ok(())
}

fn on_part(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    let channel = msg
        .param(0)
        .ok_or_else(|| EngineError::malformed("PART", "missing channel"))?;
    let sender = msg.source();

    let update = session.shared.members.lock().remove(channel, sender);
    if let Some(update) = update {
        session.users(update);
    }
    session.membership_notice(
        channel,
        ActivityKind::Part,
        sender,
        with_reason(format!("{sender} left {channel}"), msg.trailing()),
    );
    Ok(())
}

fn on_kick(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    let (Some(channel), Some(victim)) = (msg.param(0), msg.param(1)) else {
        return Err(EngineError::malformed("KICK", "expected channel and nick"));
    };
    let kicker = msg.source();

    let update = session.shared.members.lock().remove(channel, victim);
    if let Some(update) = update {
        session.users(update);
    }
    session.membership_notice(
        channel,
        ActivityKind::Kick,
        victim,
        with_reason(
            format!("{victim} was kicked from {channel} by {kicker}"),
            msg.trailing(),
        ),
    );
    Ok(())
}

fn on_quit(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    let sender = msg.source();
    if session.notifications().show_quit_nick {
        session.status(with_reason(format!("{sender} quit IRC"), msg.trailing()));
    }
    let updates = session.shared.members.lock().remove_everywhere(sender);
    for update in updates {
        session.users(update);
    }
    Ok(())
}

fn on_nick(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    let new_nick = msg
        .text()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| EngineError::malformed("NICK", "missing new nick"))?;
    let sender = msg.source();

    if session.is_me(sender) {
        *session.shared.nick.lock() = new_nick.to_string();
    }
    if session.notifications().show_quit_nick {
        session.status(format!("{sender} is now known as {new_nick}"));
    }
    let updates = session.shared.members.lock().rename(sender, new_nick);
    for update in updates {
        session.users(update);
    }
    Ok(())
}

fn on_topic(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    let channel = msg
        .param(0)
        .ok_or_else(|| EngineError::malformed("TOPIC", "missing channel"))?;
    let sender = msg.source();
    let text = match msg.trailing().filter(|t| !t.is_empty()) {
        Some(topic) => format!("{sender} changed the topic of {channel} to: {topic}"),
        None => format!("{sender} cleared the topic of {channel}"),
    };
    session.message(channel, SYSTEM_SENDER, text);
    Ok(())
}

fn on_cap(session: &mut Session, msg: &Message, out: &mut Vec<String>) -> Result<()> {
    session.registration.on_cap(msg, out)
}

fn on_authenticate(session: &mut Session, msg: &Message, out: &mut Vec<String>) -> Result<()> {
    session.registration.on_authenticate(msg, out);
    Ok(())
}

fn on_sasl_result(session: &mut Session, msg: &Message, out: &mut Vec<String>) -> Result<()> {
    if msg.command == "903" {
        session.status("SASL authentication successful");
    } else {
        session.status(format!(
            "SASL authentication failed ({}). Continuing without SASL.",
            msg.command
        ));
    }
    session.registration.on_sasl_result(out);
    Ok(())
}

/// `421 <me> <command> :Unknown command`. Only CAP matters here.
fn on_unknown_command(session: &mut Session, msg: &Message, out: &mut Vec<String>) -> Result<()> {
    if msg.param(1).is_some_and(|c| c.eq_ignore_ascii_case("CAP")) {
        session.status("Server does not support CAP; registering without SASL");
        session.registration.on_cap_unsupported(out);
    }
    Ok(())
}

fn on_welcome(session: &mut Session, msg: &Message, out: &mut Vec<String>) -> Result<()> {
    if let Some(nick) = msg.param(0) {
        *session.shared.nick.lock() = nick.to_string();
    }
    session.welcomed = true;
    session.status(format!("Registered as {}", session.shared.nick.lock()));

    let autojoin = session.shared.config.read().autojoin.clone();
    out.extend(
        autojoin
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(|c| format!("JOIN {}", channel_name(c))),
    );
    Ok(())
}

fn on_nick_in_use(session: &mut Session, msg: &Message, out: &mut Vec<String>) -> Result<()> {
    let taken = msg
        .param(1)
        .unwrap_or(session.registration.nick())
        .to_string();
    if session.welcomed {
        session.status(format!("Nick {taken} is already in use"));
        return Ok(());
    }

    session.nick_attempts += 1;
    if session.nick_attempts > MAX_NICK_ATTEMPTS {
        session.status(format!("Nick {taken} is in use; giving up. Pick one with /nick"));
        return Ok(());
    }
    let alt = format!("{}{}", session.base_nick, session.nick_attempts);
    session.status(format!("Nick {taken} is in use, trying {alt}"));
    *session.shared.nick.lock() = alt.clone();
    out.push(format!("NICK {alt}"));
    Ok(())
}

fn on_no_topic(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    if let Some(channel) = msg.param(1) {
        session.status(format!("No topic set for {channel}"));
    }
    Ok(())
}

fn on_topic_reply(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    if let (Some(channel), Some(topic)) = (msg.param(1), msg.trailing()) {
        session.status(format!("Topic for {channel}: {topic}"));
    }
    Ok(())
}

fn on_topic_who_time(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    if let (Some(channel), Some(set_by), Some(at)) = (msg.param(1), msg.param(2), msg.param(3)) {
        session.status(format!(
            "Topic for {channel} set by {set_by} at {}",
            format_timestamp(at)
        ));
    }
    Ok(())
}

fn on_whois_user(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    if let (Some(nick), Some(user), Some(host), Some(real)) =
        (msg.param(1), msg.param(2), msg.param(3), msg.trailing())
    {
        session.status(format!("WHOIS {nick}: {user}@{host} ({real})"));
    }
    Ok(())
}

fn on_whois_server(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    if let (Some(nick), Some(server), Some(info)) = (msg.param(1), msg.param(2), msg.trailing()) {
        session.status(format!("WHOIS {nick}: on {server} ({info})"));
    }
    Ok(())
}

fn on_whois_idle(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    let (Some(nick), Some(idle)) = (msg.param(1), msg.param(2)) else {
        return Ok(());
    };
    let mut line = format!("WHOIS {nick}: idle {idle}s");
    if let Some(signon) = msg.param(3) {
        line.push_str(&format!("; signon {}", format_timestamp(signon)));
    }
    session.status(line);
    Ok(())
}

fn on_whois_end(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    if let (Some(nick), Some(text)) = (msg.param(1), msg.trailing()) {
        session.status(format!("WHOIS {nick}: {text}"));
    }
    Ok(())
}

fn on_whois_channels(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    if let (Some(nick), Some(channels)) = (msg.param(1), msg.trailing()) {
        session.status(format!("WHOIS {nick}: channels: {}", channels.trim()));
    }
    Ok(())
}

/// `330 <me> <nick> <account> :is logged in as`
fn on_whois_account(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    if let (Some(nick), Some(account)) = (msg.param(1), msg.param(2)) {
        let text = msg.trailing().unwrap_or("is logged in as");
        session.status(format!("WHOIS {nick}: {text} {account}"));
    }
    Ok(())
}

fn on_no_such_nick(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    if let Some(nick) = msg.param(1) {
        let text = msg.trailing().unwrap_or("No such nick/channel");
        session.status(format!("{nick}: {text}"));
    }
    Ok(())
}

/// `353 <me> <type> <channel> :[@+]nick ...`
///
/// The first 353 for a channel replaces its roster; further 353s before the
/// matching 366 add to it.
fn on_names(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    let (Some(channel), Some(names)) = (msg.param(2), msg.trailing()) else {
        return Ok(());
    };
    let nicks: Vec<&str> = names
        .split_whitespace()
        .map(|n| n.trim_start_matches(NAMES_MARKERS))
        .filter(|n| !n.is_empty())
        .collect();

    let continuing = !session.names_open.insert(channel.to_lowercase());
    let update = {
        let mut members = session.shared.members.lock();
        if continuing {
            members.extend(channel, nicks)
        } else {
            members.set_roster(channel, nicks)
        }
    };
    session.users(update);
    Ok(())
}

fn on_names_end(session: &mut Session, msg: &Message, _out: &mut Vec<String>) -> Result<()> {
    if let Some(channel) = msg.param(1) {
        session.names_open.remove(&channel.to_lowercase());
    }
    Ok(())
}
