//! OpenAI Chat Completions adapter: builds `POST /v1/chat/completions` with
//! `stream: true` and normalizes the `choices[0].delta` event shape into
//! `DomainChunk`s.

use std::collections::HashMap;

use async_trait::async_trait;
use panelstream_core::{
    ChatRole, DomainChunk, ProviderErrorKind, RequestError, StopReason, StreamRequest, ToolCall,
    Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::adapter::{CancelHandle, PanelistStream, ProviderAdapter};
use crate::retry::connect_with_retry;
use crate::sse::SseLineBuffer;

pub struct OpenAiAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: Url,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        OpenAiAdapter {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            base_url: Url::parse("https://api.openai.com").expect("static URL"),
        }
    }

    #[cfg(test)]
    fn with_base_url(api_key: impl Into<String>, base_url: &str) -> Self {
        OpenAiAdapter {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            base_url: Url::parse(base_url).expect("valid test base URL"),
        }
    }
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    stream: bool,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<Choice>,
    usage: Option<RawUsage>,
}

#[derive(Deserialize)]
struct Choice {
    delta: ChoiceDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChoiceDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct RawUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_id(&self) -> &str {
        "openai"
    }

    fn validate_api_key(&self, key: &str) -> bool {
        key.starts_with("sk-") && key.len() > 8
    }

    #[tracing::instrument(skip(self, request), fields(thread_id = %request.thread_id))]
    async fn stream(&self, request: StreamRequest) -> Result<PanelistStream, RequestError> {
        let panelist = request
            .panelists
            .first()
            .ok_or(RequestError::NoPanelists)?
            .clone();

        let system = request.merged_system_message();
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(OpenAiMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(request.messages.iter().filter(|m| m.role != ChatRole::System).map(
            |m| OpenAiMessage {
                role: match m.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                    ChatRole::System => unreachable!("filtered above"),
                },
                content: m.content.clone(),
            },
        ));

        let tools = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let body = OpenAiRequest {
            model: panelist.model.clone(),
            stream: true,
            messages,
            tools,
            max_tokens: request.options.max_tokens,
            temperature: request.options.temperature,
            top_p: request.options.top_p,
            stop: request.options.stop.clone(),
        };

        let cancel = CancelHandle::new();
        let cancel_token = cancel.token();
        let (tx, rx) = mpsc::channel(32);

        let client = self.client.clone();
        let url = self
            .base_url
            .join("v1/chat/completions")
            .expect("base_url is a valid absolute URL")
            .to_string();
        let api_key = self.api_key.clone();
        let body_value = serde_json::to_value(&body).unwrap_or(Value::Null);

        tokio::spawn(async move {
            run_stream(client, url, api_key, body_value, tx, cancel_token).await;
        });

        Ok(PanelistStream {
            chunks: Box::pin(ReceiverStream::new(rx)),
            cancel,
        })
    }
}

#[derive(Default)]
struct ToolAccumulator {
    call_id: String,
    name: String,
    arguments: String,
}

async fn run_stream(
    client: reqwest::Client,
    url: String,
    api_key: String,
    body: Value,
    tx: mpsc::Sender<DomainChunk>,
    cancel_token: tokio_util::sync::CancellationToken,
) {
    let mut seq: u64 = 0;
    let mut usage = Usage::default();
    let mut tool_calls: HashMap<usize, ToolAccumulator> = HashMap::new();

    let resp = match connect_with_retry("openai", || {
        client
            .post(&url)
            .bearer_auth(api_key.clone())
            .json(&body)
            .send()
    })
    .await
    {
        Ok(r) => r,
        Err((kind, message)) => {
            let _ = tx
                .send(DomainChunk::Error {
                    seq,
                    kind,
                    retryable: kind.retryable(),
                    message,
                })
                .await;
            return;
        }
    };

    log::debug!("openai stream connected");
    let mut body_stream = resp.bytes_stream();
    let mut buf = SseLineBuffer::new();

    loop {
        let next = tokio::select! {
            _ = cancel_token.cancelled() => {
                let _ = tx.send(DomainChunk::Error {
                    seq,
                    kind: ProviderErrorKind::Cancelled,
                    message: "cancelled".to_string(),
                    retryable: false,
                }).await;
                return;
            }
            chunk = futures::StreamExt::next(&mut body_stream) => chunk,
        };

        let bytes = match next {
            Some(Ok(b)) => b,
            Some(Err(e)) => {
                log::warn!("openai stream read error after connect: {e}");
                let _ = tx
                    .send(DomainChunk::Error {
                        seq,
                        kind: ProviderErrorKind::Network,
                        message: format!("openai stream read error: {e}"),
                        retryable: ProviderErrorKind::Network.retryable(),
                    })
                    .await;
                return;
            }
            None => break,
        };

        for payload in buf.push(&bytes) {
            let event: ChatCompletionChunk = match serde_json::from_str(&payload) {
                Ok(e) => e,
                Err(_) => continue,
            };

            if let Some(u) = event.usage {
                usage = usage.merge_max(Usage {
                    prompt_tokens: u.prompt_tokens.unwrap_or(0),
                    completion_tokens: u.completion_tokens.unwrap_or(0),
                    estimated: false,
                });
                seq += 1;
                let _ = tx.send(DomainChunk::Usage { seq, usage }).await;
            }

            let Some(choice) = event.choices.into_iter().next() else {
                continue;
            };

            if let Some(text) = choice.delta.content {
                seq += 1;
                let _ = tx.send(DomainChunk::Text { seq, delta: text }).await;
            }

            if let Some(deltas) = choice.delta.tool_calls {
                for d in deltas {
                    let acc = tool_calls.entry(d.index).or_default();
                    if let Some(id) = d.id {
                        acc.call_id = id;
                    }
                    if let Some(f) = d.function {
                        if let Some(name) = f.name {
                            acc.name = name;
                        }
                        if let Some(args) = f.arguments {
                            acc.arguments.push_str(&args);
                        }
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                for (_, acc) in tool_calls.drain() {
                    let arguments = serde_json::from_str(&acc.arguments)
                        .unwrap_or(Value::Object(Default::default()));
                    seq += 1;
                    let _ = tx
                        .send(DomainChunk::ToolUse {
                            seq,
                            call: ToolCall {
                                call_id: acc.call_id,
                                name: acc.name,
                                arguments,
                            },
                        })
                        .await;
                }
                seq += 1;
                let stop = match reason.as_str() {
                    "tool_calls" => StopReason::ToolUse,
                    "length" => StopReason::Length,
                    _ => StopReason::Stop,
                };
                let _ = tx.send(DomainChunk::End { seq, reason: stop }).await;
                return;
            }
        }
    }

    seq += 1;
    let _ = tx
        .send(DomainChunk::End {
            seq,
            reason: StopReason::Stop,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_validation_rejects_obviously_wrong_shapes() {
        let adapter = OpenAiAdapter::new("sk-abc123456789");
        assert!(adapter.validate_api_key("sk-abc123456789"));
        assert!(!adapter.validate_api_key("not-a-key"));
        assert!(!adapter.validate_api_key("sk-"));
    }

    #[test]
    fn base_url_override_is_used_for_tests() {
        let adapter = OpenAiAdapter::with_base_url("sk-test", "http://127.0.0.1:1");
        assert_eq!(adapter.base_url.as_str(), "http://127.0.0.1:1/");
    }
}
