//! Cross-cutting per-request hooks.
//!
//! Middleware runs in registration order at three points: before the
//! outbound request is sent, after every parsed stream chunk, and once when
//! the stream completes. Hooks are synchronous; anything long-running
//! belongs in a handler, not here.

mod reasoning_replay;

pub use reasoning_replay::{ReasoningReplay, ReplayCache};

use std::{collections::HashSet, sync::Arc};

use serde_json::Value;

use crate::protocol::openai::{ChatRequest, ChunkDelta};

/// Per-stream scratch state shared between the chunk and completion hooks.
#[derive(Debug, Default)]
pub struct StreamMetadata {
    /// Structured reasoning entries accumulated over the stream.
    pub reasoning_details: Vec<Value>,
    /// Every tool-call id observed on the stream.
    pub tool_call_ids: HashSet<String>,
}

/// A cross-cutting hook.
pub trait Middleware: Send + Sync {
    /// Runs before the outbound request is serialized.
    fn before_request(&self, _outbound: &mut ChatRequest) {}

    /// Runs after each upstream chunk is parsed.
    fn after_stream_chunk(&self, _delta: &ChunkDelta, _meta: &mut StreamMetadata) {}

    /// Runs exactly once when the stream finalizes.
    fn after_stream_complete(&self, _meta: &StreamMetadata) {}
}

/// Ordered middleware list.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    list: Arc<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
    pub fn new(list: Vec<Arc<dyn Middleware>>) -> Self {
        Self { list: Arc::new(list) }
    }

    pub fn before_request(&self, outbound: &mut ChatRequest) {
        for middleware in self.list.iter() {
            middleware.before_request(outbound);
        }
    }

    pub fn after_stream_chunk(&self, delta: &ChunkDelta, meta: &mut StreamMetadata) {
        for middleware in self.list.iter() {
            middleware.after_stream_chunk(delta, meta);
        }
    }

    pub fn after_stream_complete(&self, meta: &StreamMetadata) {
        for middleware in self.list.iter() {
            middleware.after_stream_complete(meta);
        }
    }
}
