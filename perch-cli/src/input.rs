//! Typed input: plain text or a slash command.
//!
//! Parsing is pure; `main` decides what each command does against the
//! engine and the current target.

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Text for the current target. `//text` sends `/text`.
    Say(String),
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { channel: String, key: Option<String> },
    /// `None` parts the current target.
    Part { channel: Option<String>, reason: Option<String> },
    Nick(String),
    Me(String),
    Notice { target: String, text: String },
    /// No channel means the current target; no text queries the topic.
    Topic { channel: Option<String>, text: Option<String> },
    Whois(String),
    Raw(String),
    /// Without text this only switches the current target.
    Msg { target: String, text: Option<String> },
    Quit(Option<String>),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("Unknown command: /{0}")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &str = "\
/join <channel> [key]    (/j)
/part [channel] [reason] (/p)
/msg <nick> [text]       (/query, /pm)
/me <action>
/notice <target> <text>
/topic [channel] [text]
/nick <nick>
/whois <nick>
/raw <line>
/quit [reason]";

/// Split off the first word; the rest is returned trimmed, `None` if empty.
fn split_word(s: &str) -> (&str, Option<&str>) {
    let s = s.trim();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => {
            let rest = rest.trim();
            (word, (!rest.is_empty()).then_some(rest))
        }
        None => (s, None),
    }
}

fn is_channel(s: &str) -> bool {
    s.starts_with('#') || s.starts_with('&')
}

/// Parse one input line. Blank lines give `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Input>, InputError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    if let Some(escaped) = line.strip_prefix("//") {
        return Ok(Some(Input::Say(format!("/{escaped}"))));
    }
    let Some(body) = line.strip_prefix('/') else {
        return Ok(Some(Input::Say(line.to_string())));
    };

    let (name, args) = split_word(body);
    let command = match name.to_ascii_lowercase().as_str() {
        "join" | "j" => {
            let (channel, key) = split_word(args.ok_or(InputError::Usage("/join <channel> [key]"))?);
            Command::Join {
                channel: channel.to_string(),
                key: key.map(|k| split_word(k).0.to_string()),
            }
        }
        "part" | "p" => match args {
            None => Command::Part { channel: None, reason: None },
            Some(args) => {
                let (first, rest) = split_word(args);
                if is_channel(first) {
                    Command::Part {
                        channel: Some(first.to_string()),
                        reason: rest.map(str::to_string),
                    }
                } else {
                    Command::Part {
                        channel: None,
                        reason: Some(args.to_string()),
                    }
                }
            }
        },
        "nick" => {
            let nick = args.ok_or(InputError::Usage("/nick <nick>"))?;
            Command::Nick(split_word(nick).0.to_string())
        }
        "me" => Command::Me(args.ok_or(InputError::Usage("/me <action>"))?.to_string()),
        "notice" => {
            let usage = InputError::Usage("/notice <target> <text>");
            let (target, text) = split_word(args.ok_or(usage.clone())?);
            Command::Notice {
                target: target.to_string(),
                text: text.ok_or(usage)?.to_string(),
            }
        }
        "topic" => match args {
            None => Command::Topic { channel: None, text: None },
            Some(args) => {
                let (first, rest) = split_word(args);
                if is_channel(first) {
                    Command::Topic {
                        channel: Some(first.to_string()),
                        text: rest.map(str::to_string),
                    }
                } else {
                    Command::Topic {
                        channel: None,
                        text: Some(args.to_string()),
                    }
                }
            }
        },
        "whois" => {
            let nick = args.ok_or(InputError::Usage("/whois <nick>"))?;
            Command::Whois(split_word(nick).0.to_string())
        }
        "raw" | "quote" => Command::Raw(args.ok_or(InputError::Usage("/raw <line>"))?.to_string()),
        "msg" | "query" | "pm" => {
            let (target, text) = split_word(args.ok_or(InputError::Usage("/msg <nick> [text]"))?);
            Command::Msg {
                target: target.to_string(),
                text: text.map(str::to_string),
            }
        }
        "quit" | "exit" => Command::Quit(args.map(str::to_string)),
        "help" => Command::Help,
        _ => return Err(InputError::Unknown(name.to_string())),
    };
    Ok(Some(Input::Command(command)))
}
