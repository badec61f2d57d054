//! Anthropic Messages API adapter: builds the `POST /v1/messages` request
//! with `stream: true` and normalizes the `content_block_*`/`message_delta`
//! SSE event taxonomy into `DomainChunk`s.

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

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: Url,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        AnthropicAdapter {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            base_url: Url::parse("https://api.anthropic.com").expect("static URL"),
        }
    }

    #[cfg(test)]
    fn with_base_url(api_key: impl Into<String>, base_url: &str) -> Self {
        AnthropicAdapter {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            base_url: Url::parse(base_url).expect("valid test base URL"),
        }
    }
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    index: Option<usize>,
    content_block: Option<ContentBlock>,
    delta: Option<Delta>,
    usage: Option<RawUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct RawUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn validate_api_key(&self, key: &str) -> bool {
        key.starts_with("sk-ant-") && key.len() > 12
    }

    #[tracing::instrument(skip(self, request), fields(thread_id = %request.thread_id))]
    async fn stream(&self, request: StreamRequest) -> Result<PanelistStream, RequestError> {
        let panelist = request
            .panelists
            .first()
            .ok_or(RequestError::NoPanelists)?
            .clone();

        let system = request.merged_system_message();
        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| AnthropicMessage {
                role: match m.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "user",
                    ChatRole::System => unreachable!("filtered above"),
                },
                content: m.content.clone(),
            })
            .collect();

        let tools = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let body = AnthropicRequest {
            model: panelist.model.clone(),
            max_tokens: request.options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            stream: true,
            system: if system.is_empty() { None } else { Some(system) },
            messages,
            tools,
            temperature: request.options.temperature,
            top_p: request.options.top_p,
            stop_sequences: request.options.stop.clone(),
        };

        let cancel = CancelHandle::new();
        let cancel_token = cancel.token();
        let (tx, rx) = mpsc::channel(32);

        let client = self.client.clone();
        let url = self
            .base_url
            .join("v1/messages")
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
    json_buffer: String,
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
    let mut tool_blocks: HashMap<usize, ToolAccumulator> = HashMap::new();

    let resp = match connect_with_retry("anthropic", || {
        client
            .post(&url)
            .header("x-api-key", api_key.clone())
            .header("anthropic-version", ANTHROPIC_VERSION)
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

    log::debug!("anthropic stream connected");
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
                log::warn!("anthropic stream read error after connect: {e}");
                let _ = tx
                    .send(DomainChunk::Error {
                        seq,
                        kind: ProviderErrorKind::Network,
                        message: format!("anthropic stream read error: {e}"),
                        retryable: ProviderErrorKind::Network.retryable(),
                    })
                    .await;
                return;
            }
            None => break,
        };

        for payload in buf.push(&bytes) {
            let event: StreamEvent = match serde_json::from_str(&payload) {
                Ok(e) => e,
                Err(_) => continue,
            };

            match event.event_type.as_str() {
                "message_start" => {
                    if let Some(u) = event.usage {
                        usage = usage.merge_max(Usage {
                            prompt_tokens: u.input_tokens.unwrap_or(0),
                            completion_tokens: u.output_tokens.unwrap_or(0),
                            estimated: false,
                        });
                    }
                }
                "content_block_start" => {
                    if let (Some(idx), Some(block)) = (event.index, event.content_block) {
                        if block.block_type == "tool_use" {
                            tool_blocks.insert(
                                idx,
                                ToolAccumulator {
                                    call_id: block.id.unwrap_or_default(),
                                    name: block.name.unwrap_or_default(),
                                    json_buffer: String::new(),
                                },
                            );
                        }
                    }
                }
                "content_block_delta" => {
                    if let Some(delta) = event.delta {
                        match delta.delta_type.as_deref() {
                            Some("text_delta") => {
                                if let Some(text) = delta.text {
                                    seq += 1;
                                    let _ = tx.send(DomainChunk::Text { seq, delta: text }).await;
                                }
                            }
                            Some("thinking_delta") => {
                                if let Some(text) = delta.thinking {
                                    seq += 1;
                                    let _ =
                                        tx.send(DomainChunk::Thinking { seq, delta: text }).await;
                                }
                            }
                            Some("input_json_delta") => {
                                if let (Some(idx), Some(partial)) =
                                    (event.index, delta.partial_json)
                                {
                                    if let Some(acc) = tool_blocks.get_mut(&idx) {
                                        acc.json_buffer.push_str(&partial);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                "content_block_stop" => {
                    if let Some(idx) = event.index {
                        if let Some(acc) = tool_blocks.remove(&idx) {
                            let arguments = serde_json::from_str(&acc.json_buffer)
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
                    }
                }
                "message_delta" => {
                    if let Some(u) = event.usage {
                        usage = usage.merge_max(Usage {
                            prompt_tokens: u.input_tokens.unwrap_or(0),
                            completion_tokens: u.output_tokens.unwrap_or(0),
                            estimated: false,
                        });
                        seq += 1;
                        let _ = tx.send(DomainChunk::Usage { seq, usage }).await;
                    }
                    if let Some(delta) = event.delta {
                        if let Some(stop_reason) = delta.stop_reason {
                            seq += 1;
                            let reason = match stop_reason.as_str() {
                                "tool_use" => StopReason::ToolUse,
                                "max_tokens" => StopReason::Length,
                                _ => StopReason::Stop,
                            };
                            let _ = tx.send(DomainChunk::End { seq, reason }).await;
                            return;
                        }
                    }
                }
                _ => {}
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
