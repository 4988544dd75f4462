//! Responders turn an inbound [`Message`] into reply text.
//!
//! The bridge treats a responder as stateless and possibly slow: it awaits the
//! reply without a timeout of its own and maps errors (and panics) to "no
//! reply". Conversation state, when a responder has any, lives inside it.
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::bridge::message::Message;
use crate::config::{ResponderConfig, ResponderKind};

pub mod conversation;
#[cfg(feature = "http-responder")]
pub mod http;

pub use conversation::{ConversationStore, Role, Turn};

/// Reply sent when the model produced nothing usable.
pub const APOLOGY: &str = "I'm sorry, I couldn't generate a response at this time.";

#[async_trait]
pub trait Responder: Send + Sync {
    /// `Ok(None)` means "stay silent".
    async fn respond(&self, message: &Message) -> Result<Option<String>>;
}

/// Text a model-backed responder should not answer: line noise and status
/// broadcasts from other bots.
pub fn is_ignorable(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.chars().count() < 2 || trimmed.starts_with('📢') || trimmed.starts_with("System:")
}

/// Replies with the received text. Handy for checking the radio path.
#[derive(Debug, Default, Clone)]
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, message: &Message) -> Result<Option<String>> {
        Ok(Some(format!("echo: {}", message.text().trim())))
    }
}

/// Adapts a plain closure.
pub struct FnResponder<F>(pub F);

#[async_trait]
impl<F> Responder for FnResponder<F>
where
    F: Fn(&Message) -> Result<Option<String>> + Send + Sync,
{
    async fn respond(&self, message: &Message) -> Result<Option<String>> {
        (self.0)(message)
    }
}

pub fn from_config(config: &ResponderConfig) -> Result<Arc<dyn Responder>> {
    match config.kind {
        ResponderKind::Echo => Ok(Arc::new(EchoResponder)),
        #[cfg(feature = "http-responder")]
        ResponderKind::Http => Ok(Arc::new(http::HttpResponder::new(config.clone())?)),
        #[cfg(not(feature = "http-responder"))]
        ResponderKind::Http => anyhow::bail!("built without the http-responder feature"),
    }
}
