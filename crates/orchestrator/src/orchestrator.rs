use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use panelstream_adapters::{CancelHandle, PanelistStream, ProviderAdapter};
use panelstream_core::{DomainChunk, RequestError, StreamRequest};
use panelstream_tools::ToolExecutor;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Composes a `ProviderAdapter` with a `ToolExecutor`. `run` validates the
/// request, then drives the adapter's chunk stream, executing any
/// `ToolUse` chunk against the tool executor and emitting its matching
/// `ToolResult` immediately afterward — before forwarding anything else —
/// so the strict `tool_use` -> `tool_result` adjacency invariant holds
/// regardless of what the adapter does internally.
pub struct Orchestrator {
    adapter: Arc<dyn ProviderAdapter>,
    tools: Arc<ToolExecutor>,
}

impl Orchestrator {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, tools: Arc<ToolExecutor>) -> Self {
        Orchestrator { adapter, tools }
    }

    pub fn validate(request: &StreamRequest) -> Result<(), RequestError> {
        if request.thread_id.is_empty() {
            return Err(RequestError::EmptyThreadId);
        }
        if request.panelists.is_empty() {
            return Err(RequestError::NoPanelists);
        }
        if request.messages.is_empty() {
            return Err(RequestError::EmptyMessages);
        }
        let mut seen = HashSet::new();
        for p in &request.panelists {
            if !seen.insert(p.panelist_id.clone()) {
                return Err(RequestError::DuplicatePanelistId(p.panelist_id.clone()));
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, request), fields(thread_id = %request.thread_id))]
    pub async fn run(&self, request: StreamRequest) -> Result<PanelistStream, RequestError> {
        Self::validate(&request)?;

        let upstream = self.adapter.stream(request).await?;
        let cancel = upstream.cancel.clone();
        let tools = self.tools.clone();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(drain(upstream.chunks, tools, tx));

        Ok(PanelistStream {
            chunks: Box::pin(ReceiverStream::new(rx)),
            cancel,
        })
    }
}

async fn drain(
    mut chunks: std::pin::Pin<Box<dyn futures::Stream<Item = DomainChunk> + Send>>,
    tools: Arc<ToolExecutor>,
    tx: mpsc::Sender<DomainChunk>,
) {
    let mut next_seq = 0u64;
    while let Some(chunk) = chunks.next().await {
        next_seq = next_seq.max(chunk.seq()) + 1;
        let is_tool_use = matches!(chunk, DomainChunk::ToolUse { .. });
        let call = if let DomainChunk::ToolUse { ref call, .. } = chunk {
            Some(call.clone())
        } else {
            None
        };

        if tx.send(chunk).await.is_err() {
            return;
        }

        if is_tool_use {
            if let Some(call) = call {
                let call_id = call.call_id.clone();
                let result = tools.execute(call).await;
                let result_chunk = DomainChunk::ToolResult {
                    seq: next_seq,
                    call_id,
                    result,
                };
                next_seq += 1;
                if tx.send(result_chunk).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelstream_adapters::mock::MockAdapter;
    use panelstream_core::{ChatMessage, ChatRole, Panelist, StopReason, ToolCall, ToolResult};
    use panelstream_tools::{ToolExecutorConfig, ToolRegistry};
    use serde_json::json;

    fn req() -> StreamRequest {
        StreamRequest {
            thread_id: "t".into(),
            message_id: "m".into(),
            panelists: vec![Panelist {
                panelist_id: "p1".into(),
                ..Default::default()
            }],
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: "hi".into(),
            }],
            tools: vec![],
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn inserts_a_tool_result_immediately_after_its_tool_use_chunk() {
        let script = vec![
            DomainChunk::Text {
                seq: 1,
                delta: "before".into(),
            },
            DomainChunk::ToolUse {
                seq: 2,
                call: ToolCall {
                    call_id: "c1".into(),
                    name: "unregistered".into(),
                    arguments: json!({}),
                },
            },
            DomainChunk::End {
                seq: 3,
                reason: StopReason::ToolUse,
            },
        ];
        let adapter = Arc::new(MockAdapter::new(script));
        let registry = Arc::new(ToolRegistry::new());
        let tools = Arc::new(ToolExecutor::new(registry, ToolExecutorConfig::default()));
        let orchestrator = Orchestrator::new(adapter, tools);

        let mut stream = orchestrator.run(req()).await.unwrap().chunks;
        let mut collected = Vec::new();
        while let Some(c) = stream.next().await {
            collected.push(c);
        }

        assert!(matches!(collected[0], DomainChunk::Text { .. }));
        assert!(matches!(collected[1], DomainChunk::ToolUse { .. }));
        match &collected[2] {
            DomainChunk::ToolResult { call_id, result, .. } => {
                assert_eq!(call_id, "c1");
                assert!(!result.ok);
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }
        assert!(matches!(collected[3], DomainChunk::End { .. }));
    }

    #[tokio::test]
    async fn rejects_duplicate_panelist_ids_before_touching_the_adapter() {
        let adapter = Arc::new(MockAdapter::new(vec![]));
        let registry = Arc::new(ToolRegistry::new());
        let tools = Arc::new(ToolExecutor::new(registry, ToolExecutorConfig::default()));
        let orchestrator = Orchestrator::new(adapter, tools);

        let mut request = req();
        request.panelists.push(Panelist {
            panelist_id: "p1".into(),
            ..Default::default()
        });

        let err = orchestrator.run(request).await.unwrap_err();
        assert_eq!(err, RequestError::DuplicatePanelistId("p1".into()));
    }

    #[tokio::test]
    async fn rejects_requests_with_no_messages() {
        let adapter = Arc::new(MockAdapter::new(vec![]));
        let registry = Arc::new(ToolRegistry::new());
        let tools = Arc::new(ToolExecutor::new(registry, ToolExecutorConfig::default()));
        let orchestrator = Orchestrator::new(adapter, tools);

        let mut request = req();
        request.messages.clear();

        let err = orchestrator.run(request).await.unwrap_err();
        assert_eq!(err, RequestError::EmptyMessages);
    }

    #[tokio::test]
    async fn successful_tool_result_carries_the_tool_payload() {
        struct Echo;
        #[async_trait::async_trait]
        impl panelstream_tools::Tool for Echo {
            fn name(&self) -> &str {
                "echo"
            }
            async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, String> {
                Ok(arguments)
            }
        }

        let script = vec![
            DomainChunk::ToolUse {
                seq: 1,
                call: ToolCall {
                    call_id: "c1".into(),
                    name: "echo".into(),
                    arguments: json!({"x": 1}),
                },
            },
            DomainChunk::End {
                seq: 2,
                reason: StopReason::ToolUse,
            },
        ];
        let adapter = Arc::new(MockAdapter::new(script));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(Echo));
        let tools = Arc::new(ToolExecutor::new(registry, ToolExecutorConfig::default()));
        let orchestrator = Orchestrator::new(adapter, tools);

        let mut stream = orchestrator.run(req()).await.unwrap().chunks;
        let mut collected = Vec::new();
        while let Some(c) = stream.next().await {
            collected.push(c);
        }
        match &collected[1] {
            DomainChunk::ToolResult { result, .. } => {
                assert_eq!(result, &ToolResult::ok(json!({"x": 1})));
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }
    }
}
