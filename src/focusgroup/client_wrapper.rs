//! The text-generation seam used by every part of the orchestrator.
//!
//! A [`ClientWrapper`] is a wrapper around a specific cloud LLM service. It does not keep track
//! of a discussion; the orchestrator builds the instructions and content for each call and hands
//! them over as a short list of [`Message`]s (system instructions followed by user content).
//!
//! Two calling styles are supported:
//!
//! * [`ClientWrapper::send_message`] returns the completed text in one shot.
//! * [`ClientWrapper::send_message_stream`] returns a [`MessageChunkStream`]: zero or more
//!   [`StreamEvent::Delta`] items followed by exactly one [`StreamEvent::Completed`] that carries
//!   the final text and any citations. A stream item may be an `Err` at any point, which callers
//!   must treat as a transport failure distinct from normal completion.
//!
//! Implementations that cannot stream get a default `send_message_stream` that performs a
//! one-shot call and replays it as a single delta plus completion.
//!
//! ```rust
//! use async_trait::async_trait;
//! use focusgroup::client_wrapper::{ClientError, ClientWrapper, GenerationOptions, Message, Role};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ClientWrapper for Echo {
//!     fn model_name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn send_message(
//!         &self,
//!         messages: &[Message],
//!         _options: &GenerationOptions,
//!     ) -> Result<Message, ClientError> {
//!         let last = messages.last().map(|m| m.content.to_string()).unwrap_or_default();
//!         Ok(Message::new(Role::Assistant, last))
//!     }
//! }
//! ```

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;

/// Error type returned by generation backends.
pub type ClientError = Box<dyn Error + Send + Sync>;

/// Represents the possible roles for a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Instructions that steer the model (persona, rules, phase).
    System,
    /// The turn content: discussion so far plus the directive for this turn.
    User,
    /// Text produced by the model.
    Assistant,
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Represents a generic message to be sent to an LLM.
#[derive(Clone, Debug)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The actual content of the message. Stored as `Arc<str>` so cloning is cheap.
    pub content: Arc<str>,
}

impl Message {
    pub fn new(role: Role, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: Arc::from(content.as_ref()),
        }
    }

    pub fn system(content: impl AsRef<str>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl AsRef<str>) -> Self {
        Self::new(Role::User, content)
    }
}

/// A citation attached to a completed generation (for example a web-search annotation).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    #[serde(default)]
    pub title: String,
}

/// Per-request knobs forwarded to the backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationOptions {
    /// Whether the backend may use its own search augmentation for this request.
    pub search_enabled: bool,
    /// Upper bound on generated tokens, when the backend supports it.
    pub max_completion_tokens: Option<u32>,
    /// Sampling temperature, when the backend supports it.
    pub temperature: Option<f32>,
}

impl GenerationOptions {
    pub fn with_search(mut self, enabled: bool) -> Self {
        self.search_enabled = enabled;
        self
    }

    pub fn with_max_completion_tokens(mut self, tokens: u32) -> Self {
        self.max_completion_tokens = Some(tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// One item of a streaming generation.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Incremental text, in production order.
    Delta(String),
    /// Terminal event with the full text and any citations the backend reported.
    Completed {
        content: String,
        citations: Vec<Citation>,
    },
}

/// A boxed, `Send` stream of generation events.
pub type MessageChunkStream =
    Pin<Box<dyn Stream<Item = Result<StreamEvent, ClientError>> + Send>>;

/// Trait defining the interface to interact with various LLM services.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Model identifier used for logging.
    fn model_name(&self) -> &str;

    /// Send the messages and wait for the completed response.
    async fn send_message(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Message, ClientError>;

    /// Send the messages and receive the response incrementally.
    ///
    /// The default implementation performs a one-shot [`send_message`](Self::send_message)
    /// and replays the result as one delta followed by the completion event.
    async fn send_message_stream(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<MessageChunkStream, ClientError> {
        let reply = self.send_message(messages, options).await?;
        let content = reply.content.to_string();
        let mut events = Vec::with_capacity(2);
        if !content.is_empty() {
            events.push(Ok(StreamEvent::Delta(content.clone())));
        }
        events.push(Ok(StreamEvent::Completed {
            content,
            citations: Vec::new(),
        }));
        Ok(Box::pin(stream::iter(events)))
    }

    /// Usage reported by the most recent one-shot call, if the backend tracks it.
    async fn get_last_usage(&self) -> Option<TokenUsage> {
        None
    }
}
