//! Events emitted by the engine for a UI layer to consume.
//!
//! The engine knows nothing about how events are delivered. It is handed a
//! single [`EventSink`] at construction and calls it from whichever task
//! produced the event (the reader task or an activity timer), so consumers
//! must marshal onto their own thread if they need to.

use tokio::sync::mpsc;

/// Sender name used for synthetic lines (activity summaries, actions,
/// join/part notices).
pub const SYSTEM_SENDER: &str = "*";

/// Events that the engine emits to the consumer (CLI, GUI, bot, etc.)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Free-form diagnostic line. Every raw inbound line is also echoed here
    /// as `<- line`.
    Status(String),

    /// A chat-style line for a channel or query. `sender == "*"` marks a
    /// synthetic line.
    Message {
        target: String,
        sender: String,
        text: String,
    },

    /// Full roster replacement for a channel. Nicks are sorted.
    Users {
        target: String,
        nicks: Vec<String>,
    },
}

impl Event {
    pub fn status(text: impl Into<String>) -> Self {
        Event::Status(text.into())
    }

    pub fn message(
        target: impl Into<String>,
        sender: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Event::Message {
            target: target.into(),
            sender: sender.into(),
            text: text.into(),
        }
    }
}

/// Receiver of engine events.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        // A closed receiver means nobody is listening any more.
        let _ = self.send(event);
    }
}
