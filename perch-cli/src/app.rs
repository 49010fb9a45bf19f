//! Rendering engine events as terminal lines.

use perch_engine::Event;
use perch_engine::event::SYSTEM_SENDER as SYSTEM;

/// How events are shown.
#[derive(Debug, Clone, Copy)]
pub struct View {
    pub timestamps: bool,
    /// Show the engine's `<- raw line` status echoes.
    pub show_raw: bool,
}

impl View {
    /// One printable line for `event`, or `None` if it is hidden.
    /// `me` is our current nick, used to name private conversations.
    pub fn render(&self, event: &Event, me: &str) -> Option<String> {
        let body = match event {
            Event::Status(text) => {
                if !self.show_raw && text.starts_with("<- ") {
                    return None;
                }
                format!("-- {}", sanitize_text(text))
            }
            Event::Message {
                target,
                sender,
                text,
            } => {
                let buffer = buffer_name(target, sender, me);
                self.chat_body(&buffer, sender, text)
            }
            Event::Users { target, nicks } => {
                format!("[{}] {} users", sanitize_text(target), nicks.len())
            }
        };
        Some(self.stamp(body))
    }

    /// Echo of a line we sent ourselves.
    pub fn own_message(&self, target: &str, me: &str, text: &str) -> String {
        self.stamp(self.chat_body(target, me, text))
    }

    pub fn own_action(&self, target: &str, me: &str, action: &str) -> String {
        self.stamp(self.chat_body(target, SYSTEM, &format!("{me} {action}")))
    }

    /// A local notice (usage errors, help).
    pub fn system(&self, text: &str) -> String {
        self.stamp(format!("-- {text}"))
    }

    fn chat_body(&self, buffer: &str, sender: &str, text: &str) -> String {
        let buffer = sanitize_text(buffer);
        let text = sanitize_text(text);
        if sender == SYSTEM {
            format!("[{buffer}] * {text}")
        } else {
            format!("[{buffer}] <{}> {text}", sanitize_text(sender))
        }
    }

    fn stamp(&self, body: String) -> String {
        if self.timestamps {
            format!("[{}] {body}", now_str())
        } else {
            body
        }
    }
}

/// Channel lines go to the channel; a private line addressed to us belongs
/// to the conversation with its sender.
fn buffer_name(target: &str, sender: &str, me: &str) -> String {
    let private = !target.starts_with('#') && !target.starts_with('&');
    if private && target.eq_ignore_ascii_case(me) && sender != SYSTEM {
        sender.to_string()
    } else {
        target.to_string()
    }
}

fn now_str() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// Strip terminal control characters (ESC sequences, C0/C1 controls) so
/// remote text can't drive the terminal.
pub fn sanitize_text(s: &str) -> String {
    s.chars()
        .filter(|&c| c == '\t' || (c >= ' ' && c != '\x7f' && !('\u{80}'..='\u{9f}').contains(&c)))
        .collect()
}
