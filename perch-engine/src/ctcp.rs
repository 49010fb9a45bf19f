//! CTCP framing over PRIVMSG/NOTICE payloads.
//!
//! A payload is CTCP when it is wrapped in `\x01 ... \x01`. Inside, the first
//! word is the CTCP command and the rest its arguments.

pub const DELIM: char = '\x01';

pub fn is_ctcp(text: &str) -> bool {
    text.len() >= 2 && text.starts_with(DELIM) && text.ends_with(DELIM)
}

/// Split a CTCP payload into `(COMMAND, args)`. The command is upper-cased.
/// Returns `None` when `text` is not CTCP-framed.
pub fn decode(text: &str) -> Option<(String, String)> {
    if !is_ctcp(text) {
        return None;
    }
    let inner = &text[1..text.len() - 1];
    let (command, args) = inner.split_once(' ').unwrap_or((inner, ""));
    Some((command.to_ascii_uppercase(), args.to_string()))
}

/// Wrap a CTCP command and optional arguments in delimiters.
pub fn encode(command: &str, args: &str) -> String {
    if args.is_empty() {
        format!("{DELIM}{command}{DELIM}")
    } else {
        format!("{DELIM}{command} {args}{DELIM}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection() {
        assert!(is_ctcp("\x01VERSION\x01"));
        assert!(is_ctcp("\x01\x01"));
        assert!(!is_ctcp("\x01"));
        assert!(!is_ctcp("\x01VERSION"));
        assert!(!is_ctcp("VERSION\x01"));
        assert!(!is_ctcp("hello"));
        assert!(!is_ctcp(""));
    }

    #[test]
    fn version_round_trip() {
        let wire = encode("VERSION", "");
        assert_eq!(wire, "\x01VERSION\x01");
        assert_eq!(decode(&wire), Some(("VERSION".into(), String::new())));
    }

    #[test]
    fn action_keeps_argument_spaces() {
        let wire = encode("ACTION", "waves at  everyone");
        assert_eq!(
            decode(&wire),
            Some(("ACTION".into(), "waves at  everyone".into()))
        );
    }

    #[test]
    fn empty_inner_text() {
        assert_eq!(decode("\x01\x01"), Some((String::new(), String::new())));
    }

    #[test]
    fn command_is_upper_cased() {
        assert_eq!(decode("\x01ping 123\x01"), Some(("PING".into(), "123".into())));
    }

    #[test]
    fn plain_text_is_not_decoded() {
        assert_eq!(decode("just words"), None);
    }
}
