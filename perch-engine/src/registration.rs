//! Connection registration: PASS, CAP/SASL negotiation, NICK/USER.
//!
//! The state machine only produces outbound lines; the dispatcher feeds it
//! the relevant inbound messages and reports status. A fresh `Registration`
//! is built for every connection.
//!
//! SASL failure is never fatal: 904/905/906 end capability negotiation and
//! registration continues unauthenticated.

use base64::Engine as _;

use crate::config::{DEFAULT_REALNAME, EngineConfig};
use crate::error::{EngineError, Result};
use crate::message::Message;

/// AUTHENTICATE payloads are split into chunks of this many bytes.
const SASL_CHUNK: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    SocketOpen,
    CapNegotiating,
    SaslAuthenticating,
    Registered,
}

#[derive(Debug, Clone)]
struct SaslPlain {
    username: String,
    password: String,
}

#[derive(Debug)]
pub struct Registration {
    nick: String,
    realname: String,
    server_password: Option<String>,
    sasl: Option<SaslPlain>,
    started: bool,
    registration_sent: bool,
    cap_in_progress: bool,
    awaiting_continuation: bool,
    sasl_advertised: bool,
}

impl Registration {
    pub fn new(nick: &str, realname: Option<&str>, config: &EngineConfig) -> Self {
        let realname = realname
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REALNAME)
            .to_string();
        let server_password = config
            .server_password
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        let sasl = config.sasl.enabled.then(|| SaslPlain {
            username: config
                .sasl
                .username
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| nick.to_string()),
            password: config.sasl.password.clone().unwrap_or_default(),
        });

        Self {
            nick: nick.to_string(),
            realname,
            server_password,
            sasl,
            started: false,
            registration_sent: false,
            cap_in_progress: false,
            awaiting_continuation: false,
            sasl_advertised: false,
        }
    }

    pub fn phase(&self) -> Phase {
        if !self.started {
            Phase::Disconnected
        } else if self.awaiting_continuation {
            Phase::SaslAuthenticating
        } else if self.cap_in_progress {
            Phase::CapNegotiating
        } else if self.registration_sent {
            Phase::Registered
        } else {
            Phase::SocketOpen
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Opening lines for a freshly connected socket.
    pub fn begin(&mut self, out: &mut Vec<String>) {
        self.started = true;
        if let Some(password) = &self.server_password {
            out.push(format!("PASS {password}"));
        }
        if self.sasl.is_some() {
            self.cap_in_progress = true;
            out.push("CAP LS 302".to_string());
            out.push("CAP REQ :sasl".to_string());
        } else {
            self.send_registration(out);
        }
    }

    /// `CAP <target> <subcommand> [*] [:caps]`
    pub fn on_cap(&mut self, msg: &Message, out: &mut Vec<String>) -> Result<()> {
        let subcommand = msg
            .param(1)
            .ok_or_else(|| EngineError::malformed("CAP", "missing subcommand"))?
            .to_ascii_uppercase();
        let caps = match msg.trailing() {
            Some(caps) => caps.to_string(),
            None => msg.params.get(2..).unwrap_or_default().join(" "),
        };

        match subcommand.as_str() {
            "ACK" if cap_names(&caps).any(|c| c.eq_ignore_ascii_case("sasl")) => {
                if self.sasl.is_some() && self.cap_in_progress {
                    out.push("AUTHENTICATE PLAIN".to_string());
                    self.awaiting_continuation = true;
                }
            }
            "ACK" | "NAK" => {
                if !self.awaiting_continuation && self.cap_in_progress {
                    self.finish_caps(out);
                }
            }
            "LS" => {
                if self.awaiting_continuation || !self.cap_in_progress {
                    return Ok(());
                }
                if cap_names(&caps).any(|c| c.eq_ignore_ascii_case("sasl")) {
                    self.sasl_advertised = true;
                }
                // `CAP * LS * :...` means more LS lines follow.
                let more = msg.trailing.is_some() && msg.param(2) == Some("*");
                // With sasl on offer our `CAP REQ :sasl` is still pending, so
                // negotiation stays open for its ACK or NAK.
                if !more && !self.sasl_advertised {
                    self.finish_caps(out);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// `AUTHENTICATE +` is the server asking for our PLAIN payload.
    pub fn on_authenticate(&mut self, msg: &Message, out: &mut Vec<String>) {
        let arg = msg.param(0).or(msg.trailing()).unwrap_or("").trim();
        if arg != "+" || !self.awaiting_continuation {
            return;
        }
        let Some(sasl) = &self.sasl else {
            return;
        };
        let token = format!("\0{}\0{}", sasl.username, sasl.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(token.as_bytes());
        out.extend(authenticate_lines(&encoded));
    }

    /// 903 (success) or 904/905/906 (failure). Either way registration goes on.
    pub fn on_sasl_result(&mut self, out: &mut Vec<String>) {
        if self.cap_in_progress {
            out.push("CAP END".to_string());
            self.cap_in_progress = false;
        }
        self.awaiting_continuation = false;
        self.send_registration(out);
    }

    /// The server doesn't know CAP (`421 * CAP`): register without it.
    pub fn on_cap_unsupported(&mut self, out: &mut Vec<String>) {
        if self.cap_in_progress {
            self.cap_in_progress = false;
            self.awaiting_continuation = false;
            self.send_registration(out);
        }
    }

    fn finish_caps(&mut self, out: &mut Vec<String>) {
        out.push("CAP END".to_string());
        self.cap_in_progress = false;
        self.send_registration(out);
    }

    fn send_registration(&mut self, out: &mut Vec<String>) {
        if self.registration_sent || self.nick.is_empty() {
            return;
        }
        out.push(format!("NICK {}", self.nick));
        out.push(format!("USER {} 0 * :{}", self.nick, self.realname));
        self.registration_sent = true;
    }
}

/// Capability names from a CAP list, without `=value` suffixes.
fn cap_names(caps: &str) -> impl Iterator<Item = &str> {
    caps.split_whitespace()
        .map(|cap| cap.split_once('=').map_or(cap, |(name, _)| name))
}

fn authenticate_lines(encoded: &str) -> Vec<String> {
    let mut lines: Vec<String> = encoded
        .as_bytes()
        .chunks(SASL_CHUNK)
        .map(|chunk| format!("AUTHENTICATE {}", String::from_utf8_lossy(chunk)))
        .collect();
    if encoded.len() % SASL_CHUNK == 0 {
        // Empty payload, or a last chunk of exactly 400 bytes.
        lines.push("AUTHENTICATE +".to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sasl_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.sasl.enabled = true;
        config.sasl.password = Some("hunter2".into());
        config
    }

    fn feed(reg: &mut Registration, line: &str) -> Vec<String> {
        let msg = Message::parse(line).unwrap();
        let mut out = Vec::new();
        match msg.command.as_str() {
            "CAP" => reg.on_cap(&msg, &mut out).unwrap(),
            "AUTHENTICATE" => reg.on_authenticate(&msg, &mut out),
            "903" | "904" | "905" | "906" => reg.on_sasl_result(&mut out),
            other => panic!("unexpected {other}"),
        }
        out
    }

    fn count(lines: &[String], prefix: &str) -> usize {
        lines.iter().filter(|l| l.starts_with(prefix)).count()
    }

    #[test]
    fn plain_registration() {
        let mut reg = Registration::new("alice", Some("Alice A"), &EngineConfig::default());
        assert_eq!(reg.phase(), Phase::Disconnected);
        let mut out = Vec::new();
        reg.begin(&mut out);
        assert_eq!(out, vec!["NICK alice", "USER alice 0 * :Alice A"]);
        assert_eq!(reg.phase(), Phase::Registered);
    }

    #[test]
    fn default_realname_and_pass_first() {
        let mut config = EngineConfig::default();
        config.server_password = Some(" secret ".into());
        let mut reg = Registration::new("bob", Some("   "), &config);
        let mut out = Vec::new();
        reg.begin(&mut out);
        assert_eq!(out, vec!["PASS secret", "NICK bob", "USER bob 0 * :perch"]);
    }

    #[test]
    fn blank_server_password_is_not_sent() {
        let mut config = EngineConfig::default();
        config.server_password = Some("  ".into());
        let mut reg = Registration::new("bob", None, &config);
        let mut out = Vec::new();
        reg.begin(&mut out);
        assert_eq!(out[0], "NICK bob");
    }

    #[test]
    fn sasl_success_flow() {
        let mut reg = Registration::new("alice", None, &sasl_config());
        let mut out = Vec::new();
        reg.begin(&mut out);
        assert_eq!(out, vec!["CAP LS 302", "CAP REQ :sasl"]);
        assert_eq!(reg.phase(), Phase::CapNegotiating);

        assert_eq!(feed(&mut reg, ":srv CAP * LS :multi-prefix sasl=PLAIN"), Vec::<String>::new());
        assert_eq!(feed(&mut reg, ":srv CAP * ACK :sasl"), vec!["AUTHENTICATE PLAIN"]);
        assert_eq!(reg.phase(), Phase::SaslAuthenticating);

        let payload = base64::engine::general_purpose::STANDARD.encode(b"\0alice\0hunter2");
        assert_eq!(
            feed(&mut reg, "AUTHENTICATE +"),
            vec![format!("AUTHENTICATE {payload}")]
        );

        let out = feed(&mut reg, ":srv 903 alice :SASL authentication successful");
        assert_eq!(out, vec!["CAP END", "NICK alice", "USER alice 0 * :perch"]);
        assert_eq!(reg.phase(), Phase::Registered);
    }

    #[test]
    fn configured_sasl_username_is_used() {
        let mut config = sasl_config();
        config.sasl.username = Some("account".into());
        let mut reg = Registration::new("alice", None, &config);
        reg.begin(&mut Vec::new());
        feed(&mut reg, ":srv CAP * ACK :sasl");
        let payload = base64::engine::general_purpose::STANDARD.encode(b"\0account\0hunter2");
        assert_eq!(feed(&mut reg, "AUTHENTICATE +"), vec![format!("AUTHENTICATE {payload}")]);
    }

    #[test]
    fn sasl_failure_registers_exactly_once() {
        let mut reg = Registration::new("alice", None, &sasl_config());
        reg.begin(&mut Vec::new());
        feed(&mut reg, ":srv CAP * ACK :sasl");
        feed(&mut reg, "AUTHENTICATE +");
        assert_eq!(reg.phase(), Phase::SaslAuthenticating);

        let mut out = feed(&mut reg, ":srv 904 alice :SASL authentication failed");
        out.extend(feed(&mut reg, ":srv 906 alice :SASL authentication aborted"));

        assert_eq!(count(&out, "CAP END"), 1);
        assert_eq!(count(&out, "NICK "), 1);
        assert_eq!(count(&out, "USER "), 1);
        assert_eq!(reg.phase(), Phase::Registered);
    }

    #[test]
    fn nak_ends_negotiation() {
        let mut reg = Registration::new("alice", None, &sasl_config());
        reg.begin(&mut Vec::new());
        let out = feed(&mut reg, ":srv CAP * NAK :sasl");
        assert_eq!(out, vec!["CAP END", "NICK alice", "USER alice 0 * :perch"]);
        assert!(feed(&mut reg, ":srv CAP * NAK :sasl").is_empty());
    }

    #[test]
    fn ls_without_sasl_ends_negotiation() {
        let mut reg = Registration::new("alice", None, &sasl_config());
        reg.begin(&mut Vec::new());
        let out = feed(&mut reg, ":srv CAP * LS :multi-prefix away-notify");
        assert_eq!(count(&out, "CAP END"), 1);
        assert_eq!(count(&out, "NICK "), 1);
    }

    #[test]
    fn multiline_ls_waits_for_the_last_line() {
        let mut reg = Registration::new("alice", None, &sasl_config());
        reg.begin(&mut Vec::new());
        assert!(feed(&mut reg, ":srv CAP * LS * :multi-prefix").is_empty());
        assert!(feed(&mut reg, ":srv CAP * LS :sasl").is_empty());
        assert_eq!(reg.phase(), Phase::CapNegotiating);
    }

    #[test]
    fn ls_is_ignored_while_awaiting_continuation() {
        let mut reg = Registration::new("alice", None, &sasl_config());
        reg.begin(&mut Vec::new());
        feed(&mut reg, ":srv CAP * ACK :sasl");
        assert!(feed(&mut reg, ":srv CAP * LS :away-notify").is_empty());
        assert_eq!(reg.phase(), Phase::SaslAuthenticating);
    }

    #[test]
    fn authenticate_without_ack_is_ignored() {
        let mut reg = Registration::new("alice", None, &sasl_config());
        reg.begin(&mut Vec::new());
        assert!(feed(&mut reg, "AUTHENTICATE +").is_empty());
    }

    #[test]
    fn cap_unsupported_registers_without_cap_end() {
        let mut reg = Registration::new("alice", None, &sasl_config());
        reg.begin(&mut Vec::new());
        let mut out = Vec::new();
        reg.on_cap_unsupported(&mut out);
        assert_eq!(out, vec!["NICK alice", "USER alice 0 * :perch"]);
    }

    #[test]
    fn cap_without_subcommand_is_malformed() {
        let mut reg = Registration::new("alice", None, &sasl_config());
        let msg = Message::parse(":srv CAP").unwrap();
        assert!(reg.on_cap(&msg, &mut Vec::new()).is_err());
    }

    #[test]
    fn long_payloads_are_chunked() {
        let encoded = "A".repeat(800);
        let lines = authenticate_lines(&encoded);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), "AUTHENTICATE ".len() + 400);
        assert_eq!(lines[2], "AUTHENTICATE +");

        let lines = authenticate_lines(&"B".repeat(450));
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with(&"B".repeat(50)));
    }
}
