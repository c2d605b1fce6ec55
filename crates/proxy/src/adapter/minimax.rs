//! MiniMax adapter: asks the backend to separate reasoning from answer text.
//!
//! MiniMax is served over the Anthropic-compatible surface, so the
//! `reasoning_split` parameter is spliced into the forwarded Messages body
//! rather than into an OpenAI-style request.

use serde_json::{Value, json};

use super::Adapter;

#[derive(Debug)]
pub struct MiniMaxAdapter;

impl Adapter for MiniMaxAdapter {
    fn name(&self) -> &'static str {
        "minimax"
    }

    fn should_handle(&self, model_id: &str) -> bool {
        model_id.contains("minimax") || model_id.contains("abab")
    }

    fn reset(&mut self) {}

    fn prepare_anthropic(&self, raw_body: &[u8]) -> Option<Vec<u8>> {
        let mut body: Value = match serde_json::from_slice(raw_body) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) | Err(_) => {
                log::warn!("MiniMax request body is not a JSON object, forwarding unchanged");
                return None;
            }
        };

        body["reasoning_split"] = json!(true);
        serde_json::to_vec(&body).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_split_is_spliced_into_the_body() {
        let adapter = MiniMaxAdapter;
        let raw = serde_json::json!({
            "model": "MiniMax-M2",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hi"}]
        })
        .to_string();

        let rewritten = adapter.prepare_anthropic(raw.as_bytes()).expect("rewritten body");
        let body: Value = serde_json::from_slice(&rewritten).expect("valid json");

        assert_eq!(body["reasoning_split"], true);
        // The rest of the request is untouched.
        assert_eq!(body["model"], "MiniMax-M2");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn non_object_bodies_are_left_alone() {
        let adapter = MiniMaxAdapter;
        assert_eq!(adapter.prepare_anthropic(b"[1,2,3]"), None);
        assert_eq!(adapter.prepare_anthropic(b"not json"), None);
    }
}
