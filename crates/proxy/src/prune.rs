//! Conversation pruning.
//!
//! When the estimated context usage crosses the threshold, mid-conversation
//! turns are dropped while keeping the anchors an agent session needs: the
//! system prompt (separate field, never touched), the first user message,
//! the most recent window, and a sample of tool-use/tool-result pairs from
//! the middle so the model retains examples of its own tool usage.

use std::collections::BTreeSet;

use crate::protocol::anthropic::{MessagesRequest, Role, SystemPrompt};

/// Usage fraction of the context window that triggers pruning.
const PRUNE_THRESHOLD: f64 = 0.8;

/// Most recent messages always kept.
const KEEP_RECENT: usize = 12;

/// One in every this-many middle tool pairs is kept.
const PAIR_SAMPLE_RATE: usize = 3;

/// Below this many messages pruning never triggers.
const MIN_MESSAGES: usize = 5;

const DISCLOSURE_NOTE: &str = "\n\nNote: earlier turns of this conversation were removed to fit the model's context window. Ask the user to repeat anything important that seems to be missing.";

/// Drops middle turns when `used_tokens` exceeds the threshold.
///
/// Returns true when anything was removed. The disclosure note is appended
/// to the system prompt exactly once.
pub fn maybe_prune(request: &mut MessagesRequest, used_tokens: u64, context_window: u32) -> bool {
    let threshold = (f64::from(context_window) * PRUNE_THRESHOLD) as u64;

    if used_tokens <= threshold || request.messages.len() <= MIN_MESSAGES {
        return false;
    }

    let total = request.messages.len();
    let recent_start = total.saturating_sub(KEEP_RECENT);

    let mut keep: BTreeSet<usize> = (recent_start..total).collect();

    // The opening of the conversation anchors the task definition.
    keep.insert(0);
    if let Some(first_user) = request.messages.iter().position(|m| m.role == Role::User) {
        keep.insert(first_user);
    }

    // Sample every third tool pair from the middle section.
    let middle_end = recent_start;
    let mut pair_counter = 0usize;

    for index in 1..middle_end {
        let message = &request.messages[index];
        if message.role != Role::Assistant || !message.has_tool_use() {
            continue;
        }

        if pair_counter % PAIR_SAMPLE_RATE == 0 {
            keep.insert(index);
            for result_index in tool_result_indices(request, index) {
                keep.insert(result_index);
            }
        }
        pair_counter += 1;
    }

    // A kept tool result without its assistant parent would be rejected by
    // every upstream; pull the parent in too.
    let kept_snapshot: Vec<usize> = keep.iter().copied().collect();
    for index in kept_snapshot {
        let message = &request.messages[index];
        if message.role != Role::User {
            continue;
        }

        for result_id in message.tool_result_ids() {
            if let Some(parent) = request
                .messages
                .iter()
                .position(|candidate| candidate.role == Role::Assistant && candidate.tool_use_ids().contains(&result_id))
            {
                keep.insert(parent);
            }
        }
    }

    if keep.len() == total {
        return false;
    }

    let dropped = total - keep.len();
    log::info!(
        "Pruning conversation: dropping {dropped} of {total} messages (estimated {used_tokens} tokens \
         against a {context_window}-token window)"
    );

    let mut index = 0;
    request.messages.retain(|_| {
        let retained = keep.contains(&index);
        index += 1;
        retained
    });

    append_disclosure(request);

    true
}

/// Indices of the user messages carrying results for the assistant turn at
/// `assistant_index`.
fn tool_result_indices(request: &MessagesRequest, assistant_index: usize) -> Vec<usize> {
    let ids: Vec<&str> = request.messages[assistant_index].tool_use_ids();
    if ids.is_empty() {
        return Vec::new();
    }

    request
        .messages
        .iter()
        .enumerate()
        .skip(assistant_index + 1)
        .filter(|(_, message)| {
            message.role == Role::User && message.tool_result_ids().iter().any(|id| ids.contains(id))
        })
        .map(|(index, _)| index)
        .collect()
}

fn append_disclosure(request: &mut MessagesRequest) {
    let current = request.system_text().unwrap_or_default();
    if current.contains(DISCLOSURE_NOTE.trim_start()) {
        return;
    }

    request.system = Some(SystemPrompt::Text(format!("{current}{DISCLOSURE_NOTE}")));
}
