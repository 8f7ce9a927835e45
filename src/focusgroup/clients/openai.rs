//! The `OpenAIClient` struct implements `ClientWrapper` for OpenAI's Chat Completions API.
//!
//! # Key Features
//!
//! - **send_message(...)**: one-shot completion; the latest `TokenUsage` is stored and
//!   available from `get_last_usage()`.
//! - **send_message_stream(...)**: true incremental streaming (`stream: true`) decoded from the
//!   SSE body.
//!
//! Both build their request from `openai-rust2`'s `ChatArguments` and honour
//! `max_completion_tokens`, `temperature` and, for search-capable models, the provider's
//! built-in web search.
//!
//! # Example
//!
//! ```rust,no_run
//! use focusgroup::clients::openai::{OpenAIClient, Model};
//! use focusgroup::client_wrapper::{ClientWrapper, GenerationOptions, Message};
//!
//! #[tokio::main]
//! async fn main() {
//!     let secret_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
//!     let client = OpenAIClient::new_with_model_enum(&secret_key, Model::GPT5Mini);
//!
//!     let reply = client
//!         .send_message(
//!             &[Message::system("You are terse."), Message::user("Hello!")],
//!             &GenerationOptions::default(),
//!         )
//!         .await;
//!     if let Ok(reply) = reply {
//!         println!("{}", reply.content);
//!     }
//! }
//! ```

use async_trait::async_trait;
use openai_rust::chat;
use openai_rust2 as openai_rust;
use serde_json::{json, Value};
use std::sync::Mutex;

use crate::focusgroup::client_wrapper::{
    ClientError, ClientWrapper, GenerationOptions, Message, MessageChunkStream, Role, TokenUsage,
};
use crate::focusgroup::clients::common::{
    chat_completion_events, get_shared_http_client, send_and_track,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Model identifiers commonly used for panel discussions.
pub enum Model {
    /// `gpt-5` – high reasoning, medium latency.
    GPT5,
    /// `gpt-5-mini` – fast variant of GPT-5 with balanced cost and quality.
    GPT5Mini,
    /// `gpt-5-nano` – lowest latency GPT-5 configuration.
    GPT5Nano,
    /// `gpt-4.1` – general availability GPT-4.1.
    GPT41,
    /// `gpt-4.1-mini` – reduced cost GPT-4.1 tier.
    GPT41Mini,
    /// `gpt-4o` – Omni model.
    GPT4o,
    /// `gpt-4o-mini` – cost effective GPT-4o derivative.
    GPT4oMini,
    /// `gpt-4o-search-preview` – GPT-4o with built-in web search.
    GPT4oSearchPreview,
    /// `gpt-4o-mini-search-preview` – smaller search-enabled model.
    GPT4oMiniSearchPreview,
}

/// Convert a [`Model`] variant into the string identifier expected by the REST API.
pub fn model_to_string(model: Model) -> String {
    match model {
        Model::GPT5 => "gpt-5".to_string(),
        Model::GPT5Mini => "gpt-5-mini".to_string(),
        Model::GPT5Nano => "gpt-5-nano".to_string(),
        Model::GPT41 => "gpt-4.1".to_string(),
        Model::GPT41Mini => "gpt-4.1-mini".to_string(),
        Model::GPT4o => "gpt-4o".to_string(),
        Model::GPT4oMini => "gpt-4o-mini".to_string(),
        Model::GPT4oSearchPreview => "gpt-4o-search-preview".to_string(),
        Model::GPT4oMiniSearchPreview => "gpt-4o-mini-search-preview".to_string(),
    }
}

/// Client wrapper for OpenAI's Chat Completions API (or any compatible endpoint).
pub struct OpenAIClient {
    api_key: String,
    base_url: String,
    model: String,
    /// Whether `search_enabled` requests may ask the model for built-in web search.
    native_search: bool,
    token_usage: Mutex<Option<TokenUsage>>,
}

impl OpenAIClient {
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_string(secret_key, &model_to_string(model))
    }

    pub fn new_with_model_string(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, DEFAULT_BASE_URL)
    }

    /// Construct a client targeting a custom OpenAI compatible base URL.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        OpenAIClient {
            api_key: secret_key.to_string(),
            base_url,
            model: model_name.to_string(),
            native_search: model_name.contains("search"),
            token_usage: Mutex::new(None),
        }
    }

    /// Override whether the model is asked to search when a request enables search.
    pub fn with_native_search(mut self, enabled: bool) -> Self {
        self.native_search = enabled;
        self
    }

    fn role_name(role: &Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, CHAT_COMPLETIONS_PATH)
    }

    /// Serialize the request. `ChatArguments` has no `max_completion_tokens` (required by
    /// reasoning models instead of `max_tokens`) and no `web_search_options`, so those two are
    /// added to the JSON after serialization.
    fn request_body(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
        stream: bool,
    ) -> Result<Value, ClientError> {
        let formatted: Vec<chat::Message> = messages
            .iter()
            .map(|msg| chat::Message {
                role: Self::role_name(&msg.role).to_owned(),
                content: msg.content.to_string(),
            })
            .collect();
        let mut arguments = chat::ChatArguments::new(&self.model, formatted);
        arguments.temperature = options.temperature;
        if stream {
            arguments.stream = Some(true);
        }

        let mut body = serde_json::to_value(&arguments)?;
        if let Some(tokens) = options.max_completion_tokens {
            body["max_completion_tokens"] = json!(tokens);
        }
        if options.search_enabled && self.native_search {
            body["web_search_options"] = json!({});
        }
        Ok(body)
    }
}

#[async_trait]
impl ClientWrapper for OpenAIClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Message, ClientError> {
        let body = self.request_body(messages, options, false)?;
        let content = send_and_track(
            get_shared_http_client(),
            &self.endpoint(),
            &self.api_key,
            &body,
            &self.token_usage,
        )
        .await?;
        Ok(Message::new(Role::Assistant, content))
    }

    async fn send_message_stream(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<MessageChunkStream, ClientError> {
        let body = self.request_body(messages, options, true)?;
        let response = get_shared_http_client()
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            log::error!(
                "OpenAIClient::send_message_stream(...): OpenAI API Error {}: {}",
                status,
                detail
            );
            return Err(format!("OpenAI API Error {}: {}", status, detail).into());
        }

        Ok(chat_completion_events(Box::pin(response.bytes_stream())))
    }

    async fn get_last_usage(&self) -> Option<TokenUsage> {
        self.token_usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_body_carries_options() {
        let client = OpenAIClient::new_with_model_enum("k", Model::GPT4oSearchPreview);
        let options = GenerationOptions::default()
            .with_search(true)
            .with_max_completion_tokens(600);
        let body = client
            .request_body(&[Message::user("hi")], &options, true)
            .unwrap();
        assert_eq!(body["model"], "gpt-4o-search-preview");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_completion_tokens"], 600);
        assert!(body.get("web_search_options").is_some());
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn one_shot_body_carries_options() {
        let client = OpenAIClient::new_with_model_enum("k", Model::GPT4oMiniSearchPreview);
        let options = GenerationOptions::default()
            .with_search(true)
            .with_max_completion_tokens(600)
            .with_temperature(0.5);
        let body = client
            .request_body(&[Message::system("s"), Message::user("hi")], &options, false)
            .unwrap();
        assert!(body.get("stream").is_none());
        assert_eq!(body["max_completion_tokens"], 600);
        assert_eq!(body["temperature"], 0.5);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("web_search_options").is_some());
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn defaults_leave_optional_fields_out() {
        let client = OpenAIClient::new_with_model_enum("k", Model::GPT5Mini);
        let body = client
            .request_body(&[Message::user("hi")], &GenerationOptions::default(), false)
            .unwrap();
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn search_is_not_requested_from_plain_models() {
        let client = OpenAIClient::new_with_model_enum("k", Model::GPT5Mini);
        let body = client
            .request_body(
                &[Message::user("hi")],
                &GenerationOptions::default().with_search(true),
                true,
            )
            .unwrap();
        assert!(body.get("web_search_options").is_none());
    }
}
