//! Helpers shared by the provider clients: one pooled HTTP client for the whole process, the
//! one-shot chat call with usage tracking, and decoding of chat-completions SSE bodies into
//! [`StreamEvent`]s.

use futures_util::stream::{self, Stream, StreamExt};
use lazy_static::lazy_static;
use openai_rust::chat;
use openai_rust2 as openai_rust;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::focusgroup::client_wrapper::{
    Citation, ClientError, MessageChunkStream, StreamEvent, TokenUsage,
};
use crate::focusgroup::relay::{sse_data, SseLineDecoder};

lazy_static! {
    static ref SHARED_HTTP_CLIENT: reqwest::Client = build_http_client();
}

fn build_http_client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .unwrap_or_else(|err| {
            log::warn!(
                "focusgroup::clients::common: falling back to default HTTP client: {}",
                err
            );
            reqwest::Client::new()
        })
}

/// Process-wide pooled HTTP client. Connections are reused across every provider call.
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Post a one-shot chat request, record its usage, and return the assistant's content.
///
/// `body` is a serialized [`chat::ChatArguments`], possibly extended with fields the SDK type
/// has no slot for. The reply is decoded into the SDK's [`chat::ChatCompletion`].
pub async fn send_and_track(
    http: &reqwest::Client,
    url: &str,
    api_key: &str,
    body: &Value,
    usage_slot: &Mutex<Option<TokenUsage>>,
) -> Result<String, ClientError> {
    let response = http.post(url).bearer_auth(api_key).json(body).send().await?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        log::error!(
            "focusgroup::clients::common::send_and_track(...): OpenAI API Error {}: {}",
            status,
            detail
        );
        return Err(format!("OpenAI API Error {}: {}", status, detail).into());
    }

    let completion: chat::ChatCompletion = response.json().await?;
    let usage = TokenUsage {
        input_tokens: completion.usage.prompt_tokens as usize,
        output_tokens: completion.usage.completion_tokens as usize,
        total_tokens: completion.usage.total_tokens as usize,
    };
    *usage_slot
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(usage);

    completion
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| "chat completion returned no choices".into())
}

/// Decode a chat-completions SSE body into deltas plus one completion event.
///
/// `openai_rust2`'s chunk stream keeps only `delta.content` and is not `Send`, so it can
/// neither carry `url_citation` annotations nor be polled from a spawned discussion task.
///
/// The completion event is produced on `data: [DONE]`. A body that ends without it, an
/// `error` payload, or a transport error all surface as an `Err` item after which the stream
/// ends.
pub fn chat_completion_events<S, B, E>(body: S) -> MessageChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = ChunkState {
        body,
        decoder: SseLineDecoder::new(),
        assembled: String::new(),
        citations: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    for line in st.decoder.feed(bytes.as_ref()) {
                        st.handle_line(&line);
                    }
                }
                Some(Err(err)) => {
                    st.finished = true;
                    st.pending.push_back(Err(Box::new(err) as ClientError));
                }
                None => {
                    if let Some(line) = st.decoder.finish() {
                        st.handle_line(&line);
                    }
                    if !st.finished {
                        st.finished = true;
                        st.pending
                            .push_back(Err("stream ended before completion".into()));
                    }
                }
            }
        }
    }))
}

struct ChunkState<S> {
    body: S,
    decoder: SseLineDecoder,
    assembled: String,
    citations: Vec<Citation>,
    pending: VecDeque<Result<StreamEvent, ClientError>>,
    finished: bool,
}

impl<S> ChunkState<S> {
    fn handle_line(&mut self, line: &str) {
        if self.finished {
            return;
        }
        let data = match sse_data(line) {
            Some(data) => data.trim(),
            None => return,
        };
        if data == "[DONE]" {
            self.finished = true;
            self.pending.push_back(Ok(StreamEvent::Completed {
                content: std::mem::take(&mut self.assembled),
                citations: std::mem::take(&mut self.citations),
            }));
            return;
        }

        let payload: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(err) => {
                log::warn!(
                    "focusgroup::clients::common: skipping unparsable chunk ({}): {}",
                    err,
                    data
                );
                return;
            }
        };

        if let Some(error) = payload.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error")
                .to_string();
            self.finished = true;
            self.pending.push_back(Err(message.into()));
            return;
        }

        let delta = &payload["choices"][0]["delta"];
        if let Some(annotations) = delta.get("annotations").and_then(Value::as_array) {
            self.citations.extend(annotations.iter().filter_map(url_citation));
        }
        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                self.assembled.push_str(content);
                self.pending
                    .push_back(Ok(StreamEvent::Delta(content.to_string())));
            }
        }
    }
}

fn url_citation(annotation: &Value) -> Option<Citation> {
    if annotation.get("type").and_then(Value::as_str) != Some("url_citation") {
        return None;
    }
    let inner = annotation.get("url_citation").unwrap_or(annotation);
    Some(Citation {
        url: inner.get("url")?.as_str()?.to_string(),
        title: inner
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}
