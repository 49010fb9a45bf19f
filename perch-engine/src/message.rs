//! IRC message parsing.
//!
//! `[@tags] [:prefix] COMMAND [middle ...] [:trailing]`
//!
//! Tags are stripped and ignored. The trailing parameter is kept apart from
//! the middle parameters because handlers treat it differently (it is the
//! only one that may contain spaces).

/// The source of a message: `nick!user@host` or a bare server/nick name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    /// Nick, or server name when there is no `!`.
    pub name: String,
    /// `user@host`, present only for `nick!user@host` prefixes.
    pub userhost: Option<String>,
}

impl Prefix {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('!') {
            Some((nick, userhost)) => Prefix {
                name: nick.to_string(),
                userhost: Some(userhost.to_string()),
            },
            None => Prefix {
                name: raw.to_string(),
                userhost: None,
            },
        }
    }
}

/// One parsed inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<Prefix>,
    /// Upper-cased textual command or a numeric such as `"353"`.
    pub command: String,
    /// Middle parameters, in order.
    pub params: Vec<String>,
    /// Text after the first `" :"`, verbatim. May be empty.
    pub trailing: Option<String>,
}

impl Message {
    /// Parse a line without its CRLF. Returns `None` for empty or malformed
    /// lines; callers drop those.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line;

        if let Some(tagged) = rest.strip_prefix('@') {
            let (_tags, after) = tagged.split_once(' ')?;
            rest = after;
        }

        let mut prefix = None;
        if let Some(prefixed) = rest.strip_prefix(':') {
            let (raw, after) = prefixed.split_once(' ')?;
            prefix = Some(Prefix::parse(raw));
            rest = after;
        }

        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing.to_string())),
            None => (rest, None),
        };

        let mut words = head.split_whitespace();
        let command = words.next()?.to_ascii_uppercase();
        let params = words.map(str::to_string).collect();

        Some(Message {
            prefix,
            command,
            params,
            trailing,
        })
    }

    /// Nick (or server name) of the sender, empty when there is no prefix.
    pub fn source(&self) -> &str {
        self.prefix.as_ref().map(|p| p.name.as_str()).unwrap_or("")
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    pub fn trailing(&self) -> Option<&str> {
        self.trailing.as_deref()
    }

    /// Trailing text, or the last middle parameter when the sender didn't use
    /// a `:` marker (single-word payloads such as `NICK newnick`).
    pub fn text(&self) -> Option<&str> {
        self.trailing().or_else(|| self.params.last().map(String::as_str))
    }
}

/// True for `#chan` and `&chan`.
pub fn is_channel(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

/// `name` as a channel, with `#` prepended unless it already is one.
pub fn channel_name(name: &str) -> String {
    if is_channel(name) {
        name.to_string()
    } else {
        format!("#{name}")
    }
}
