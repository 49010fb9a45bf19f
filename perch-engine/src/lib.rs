//! # perch-engine
//!
//! A single-connection IRC client engine: TCP/TLS transport, registration
//! with optional SASL PLAIN, CTCP handling, per-channel rosters and
//! join/part activity summaries.
//!
//! The engine is UI-agnostic. It is driven through [`Engine`]'s async methods
//! and reports everything through an [`EventSink`].
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use perch_engine::{Engine, EngineConfig, Event};
//!
//! # async fn example() -> Result<(), perch_engine::EngineError> {
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let engine = Engine::new(EngineConfig::default(), Arc::new(tx));
//! engine.connect("irc.libera.chat", 6697, "perchbot", None, true).await?;
//! engine.join_channel("#perch", None).await;
//!
//! while let Some(event) = rx.recv().await {
//!     if let Event::Message { target, sender, text } = event {
//!         println!("[{target}] <{sender}> {text}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod client;
pub mod codec;
pub mod config;
pub mod ctcp;
mod dispatch;
pub mod error;
pub mod event;
pub mod membership;
pub mod message;
pub mod registration;
pub mod transport;

pub use client::Engine;
pub use config::EngineConfig;
pub use error::EngineError;
pub use event::{Event, EventSink};
