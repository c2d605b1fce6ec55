//! Gemini reasoning-details replay.
//!
//! Gemini models served through OpenAI-compatible aggregators attach
//! encrypted thought signatures to tool-calling turns as `reasoning_details`
//! entries. The upstream 400s on the *next* turn unless those entries are
//! replayed verbatim on the assistant message that carried the tool calls.
//! This middleware captures them per stream and re-attaches them on the way
//! out.

use std::collections::HashSet;

use dashmap::DashMap;
use serde_json::Value;

use super::{Middleware, StreamMetadata};
use crate::protocol::openai::{ChatRequest, ChunkDelta};

/// Process-wide cache of reasoning details keyed by a generated message id.
///
/// Injected into the middleware rather than held as a global so tests can
/// hand it a fresh instance.
#[derive(Debug, Default)]
pub struct ReplayCache {
    entries: DashMap<String, CachedReasoning>,
}

#[derive(Debug, Clone)]
struct CachedReasoning {
    details: Vec<Value>,
    tool_call_ids: HashSet<String>,
}

impl ReplayCache {
    /// Stores the reasoning captured for one completed assistant turn.
    pub fn store(&self, message_id: String, details: Vec<Value>, tool_call_ids: HashSet<String>) {
        self.entries.insert(
            message_id,
            CachedReasoning {
                details,
                tool_call_ids,
            },
        );
    }

    /// Finds the cached details whose tool-call ids intersect `ids`.
    pub fn lookup(&self, ids: &[&str]) -> Option<Vec<Value>> {
        self.entries.iter().find_map(|entry| {
            ids.iter()
                .any(|id| entry.tool_call_ids.contains(*id))
                .then(|| entry.details.clone())
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The sole concrete middleware: captures `reasoning_details` during a
/// stream and replays them onto later requests.
pub struct ReasoningReplay {
    cache: std::sync::Arc<ReplayCache>,
}

impl ReasoningReplay {
    pub fn new(cache: std::sync::Arc<ReplayCache>) -> Self {
        Self { cache }
    }
}

impl Middleware for ReasoningReplay {
    fn before_request(&self, outbound: &mut ChatRequest) {
        for message in &mut outbound.messages {
            let Some(tool_calls) = &message.tool_calls else {
                continue;
            };

            let ids: Vec<&str> = tool_calls.iter().map(|call| call.id.as_str()).collect();

            if let Some(details) = self.cache.lookup(&ids) {
                log::debug!("Replaying {} reasoning detail(s) onto assistant message", details.len());
                message.reasoning_details = Some(details);
            }
        }
    }

    fn after_stream_chunk(&self, delta: &ChunkDelta, meta: &mut StreamMetadata) {
        if let Some(details) = &delta.reasoning_details {
            meta.reasoning_details.extend(details.iter().cloned());
        }

        for call in delta.tool_calls.iter().flatten() {
            if let Some(id) = &call.id {
                meta.tool_call_ids.insert(id.clone());
            }
        }
    }

    fn after_stream_complete(&self, meta: &StreamMetadata) {
        if meta.reasoning_details.is_empty() || meta.tool_call_ids.is_empty() {
            return;
        }

        let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        log::debug!(
            "Caching {} reasoning detail(s) for {} tool call(s) under {message_id}",
            meta.reasoning_details.len(),
            meta.tool_call_ids.len()
        );

        self.cache.store(
            message_id,
            meta.reasoning_details.clone(),
            meta.tool_call_ids.clone(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::protocol::openai::{ChatMessage, ChatRole, FunctionCall, ToolCall};

    fn delta_with_reasoning() -> ChunkDelta {
        serde_json::from_value(json!({
            "reasoning_details": [{"type": "reasoning.encrypted", "data": "sig=="}],
            "tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "Read", "arguments": "{}"}}]
        }))
        .unwrap()
    }

    #[test]
    fn capture_and_replay_round_trip() {
        let cache = Arc::new(ReplayCache::default());
        let middleware = ReasoningReplay::new(cache.clone());

        let mut meta = StreamMetadata::default();
        middleware.after_stream_chunk(&delta_with_reasoning(), &mut meta);
        middleware.after_stream_complete(&meta);

        assert_eq!(cache.len(), 1);

        let mut outbound = ChatRequest::default();
        outbound.messages.push(ChatMessage {
            role: ChatRole::Assistant,
            content: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_1".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: "Read".to_string(),
                    arguments: "{}".to_string(),
                },
            }]),
            tool_call_id: None,
            reasoning_details: None,
        });

        middleware.before_request(&mut outbound);

        let replayed = outbound.messages[0].reasoning_details.as_ref().unwrap();
        assert_eq!(replayed[0]["type"], "reasoning.encrypted");
        assert_eq!(replayed[0]["data"], "sig==");
    }

    #[test]
    fn streams_without_tool_calls_are_not_cached() {
        let cache = Arc::new(ReplayCache::default());
        let middleware = ReasoningReplay::new(cache.clone());

        let mut meta = StreamMetadata::default();
        let delta: ChunkDelta = serde_json::from_value(json!({
            "reasoning_details": [{"type": "reasoning.text", "text": "hmm"}]
        }))
        .unwrap();

        middleware.after_stream_chunk(&delta, &mut meta);
        middleware.after_stream_complete(&meta);

        assert!(cache.is_empty());
    }

    #[test]
    fn unrelated_messages_are_left_alone() {
        let cache = Arc::new(ReplayCache::default());
        cache.store(
            "msg_x".to_string(),
            vec![json!({"type": "reasoning.encrypted", "data": "zzz"})],
            HashSet::from(["call_other".to_string()]),
        );

        let middleware = ReasoningReplay::new(cache);
        let mut outbound = ChatRequest::default();
        outbound.messages.push(ChatMessage::assistant("plain text"));

        middleware.before_request(&mut outbound);
        assert!(outbound.messages[0].reasoning_details.is_none());
    }
}
