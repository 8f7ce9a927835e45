// Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use focusgroup::client_wrapper::{
    Citation, ClientError, ClientWrapper, GenerationOptions, Message, MessageChunkStream, Role,
    StreamEvent,
};
use focusgroup::event::{DiscussionEvent, EventHandler};
use focusgroup::model::Agent;
use futures_util::stream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// What the scripted client does for one call.
#[derive(Clone, Debug)]
pub enum Step {
    /// Stream the text word by word, then complete.
    Reply(String),
    /// Stream the text and report citations on completion.
    Cited(String, Vec<Citation>),
    /// Fail before the stream opens.
    Refuse(String),
    /// Complete with no text.
    Empty,
    /// Emit one delta, then break the stream.
    Break(String),
    /// Open the stream and never produce anything.
    Hang,
    /// Never return from the call at all.
    Stall,
}

/// Replays a queue of [`Step`]s and records every request.
///
/// When the queue is empty every call answers with `fallback`.
pub struct ScriptedClient {
    steps: Mutex<VecDeque<Step>>,
    fallback: String,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedClient {
    pub fn new(fallback: &str) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: fallback.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_steps(self, steps: Vec<Step>) -> Self {
        self.steps.lock().unwrap().extend(steps);
        self
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }

    /// The user content of every recorded call.
    pub fn user_prompts(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|messages| {
                messages
                    .iter()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.to_string())
            })
            .collect()
    }

    /// The system instructions of every recorded call.
    pub fn system_prompts(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|messages| {
                messages
                    .iter()
                    .find(|m| m.role == Role::System)
                    .map(|m| m.content.to_string())
            })
            .collect()
    }

    fn next_step(&self, messages: &[Message]) -> Step {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Step::Reply(self.fallback.clone()))
    }
}

fn words(text: &str) -> Vec<Result<StreamEvent, ClientError>> {
    text.split_inclusive(' ')
        .map(|w| Ok(StreamEvent::Delta(w.to_string())))
        .collect()
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn send_message(
        &self,
        messages: &[Message],
        _options: &GenerationOptions,
    ) -> Result<Message, ClientError> {
        match self.next_step(messages) {
            Step::Reply(text) | Step::Cited(text, _) => Ok(Message::new(Role::Assistant, text)),
            Step::Empty => Ok(Message::new(Role::Assistant, "")),
            Step::Refuse(err) | Step::Break(err) => Err(err.into()),
            Step::Hang | Step::Stall => std::future::pending().await,
        }
    }

    async fn send_message_stream(
        &self,
        messages: &[Message],
        _options: &GenerationOptions,
    ) -> Result<MessageChunkStream, ClientError> {
        let events = match self.next_step(messages) {
            Step::Reply(text) => {
                let mut events = words(&text);
                events.push(Ok(StreamEvent::Completed {
                    content: text,
                    citations: Vec::new(),
                }));
                events
            }
            Step::Cited(text, citations) => {
                let mut events = words(&text);
                events.push(Ok(StreamEvent::Completed {
                    content: text,
                    citations,
                }));
                events
            }
            Step::Refuse(err) => return Err(err.into()),
            Step::Empty => vec![Ok(StreamEvent::Completed {
                content: String::new(),
                citations: Vec::new(),
            })],
            Step::Break(partial) => vec![
                Ok(StreamEvent::Delta(partial)),
                Err("connection reset".into()),
            ],
            Step::Hang => return Ok(Box::pin(stream::pending())),
            Step::Stall => std::future::pending().await,
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

/// Collects every event in arrival order.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<DiscussionEvent>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<DiscussionEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_discussion_event(&self, event: &DiscussionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn panel(names: &[&str]) -> Vec<Agent> {
    names
        .iter()
        .map(|name| {
            Agent::new(*name, format!("{} role", name))
                .with_background("field work")
                .with_perspective("pragmatic")
        })
        .collect()
}

/// Yield to the runtime until `condition` holds, failing after a bounded number of tries.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
