//! Tool-call validation and recovery.
//!
//! Local and aggregated models frequently emit tool calls with missing
//! required parameters, or embed the whole call in plain text instead of the
//! structured channel. This module validates arguments against the declared
//! schema, infers missing parameters from nearby text, and extracts
//! fully-formed calls out of text envelopes.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use crate::protocol::anthropic::Tool;

/// A tool call recovered from free text or adapter buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ExtractedToolCall {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            id: mint_tool_id(),
            name: name.into(),
            input,
        }
    }
}

/// Mints a fresh `toolu_` id.
pub fn mint_tool_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}

/// Outcome of validating (and possibly repairing) one tool call.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// True when all required parameters are present after repair.
    pub valid: bool,
    /// Required parameters still missing after inference.
    pub missing_params: Vec<String>,
    /// The (possibly repaired) arguments object.
    pub args: Value,
    /// True when inference filled in at least one parameter.
    pub repaired: bool,
}

/// Validates `args_str` against the schema declared for `name`.
///
/// Unparsable or non-object arguments are treated as an empty object, then
/// missing required parameters are inferred from `nearby_text`.
pub fn validate_and_repair(name: &str, args_str: &str, tools: &[Tool], nearby_text: &str) -> ValidationOutcome {
    let mut args = match serde_json::from_str::<Value>(args_str) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(other) => {
            log::debug!("Tool {name} arguments were non-object JSON ({other}), replacing with empty object");
            json!({})
        }
        Err(_) if args_str.trim().is_empty() => json!({}),
        Err(e) => {
            log::debug!("Tool {name} arguments failed to parse ({e}), replacing with empty object");
            json!({})
        }
    };

    let Some(tool) = tools.iter().find(|tool| tool.name == name) else {
        // Unknown tool: nothing to validate against, forward as-is.
        return ValidationOutcome {
            valid: true,
            missing_params: Vec::new(),
            args,
            repaired: false,
        };
    };

    let missing: Vec<String> = tool
        .required_params()
        .into_iter()
        .filter(|param| args.get(param.as_str()).is_none_or(is_empty_value))
        .collect();

    if missing.is_empty() {
        return ValidationOutcome {
            valid: true,
            missing_params: Vec::new(),
            args,
            repaired: false,
        };
    }

    let mut still_missing = Vec::new();
    let mut repaired = false;

    for param in &missing {
        match infer_parameter(name, param, nearby_text) {
            Some(value) => {
                log::info!("Inferred missing parameter '{param}' for tool {name} from surrounding text");
                args[param.as_str()] = Value::String(value);
                repaired = true;
            }
            None => still_missing.push(param.clone()),
        }
    }

    ValidationOutcome {
        valid: still_missing.is_empty(),
        missing_params: still_missing,
        args,
        repaired,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

static FENCED_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:bash|sh|shell|zsh)?\s*\n?(.+?)```").expect("valid regex"));
static BACKTICK_COMMAND: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`\n]+)`").expect("valid regex"));
static PATH_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:~|\.{1,2})?/[\w.@-]+(?:/[\w.@-]+)*").expect("valid regex"));
static QUOTED_PHRASE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"\n]{2,})""#).expect("valid regex"));

/// Per-tool heuristics for filling one missing required parameter from the
/// text surrounding the call. Returns `None` when nothing plausible is found.
fn infer_parameter(tool_name: &str, param: &str, nearby_text: &str) -> Option<String> {
    let text = nearby_text.trim();
    if text.is_empty() {
        return None;
    }

    let tool = tool_name.to_ascii_lowercase();
    let param_lower = param.to_ascii_lowercase();

    let inferred = if param_lower == "command" || ((tool.contains("bash") || tool.contains("shell")) && param_lower == "cmd") {
        FENCED_COMMAND
            .captures(text)
            .or_else(|| BACKTICK_COMMAND.captures(text))
            .map(|caps| caps[1].trim().to_string())
    } else if param_lower.contains("path") || param_lower == "file" {
        PATH_TOKEN.find(text).map(|m| m.as_str().to_string())
    } else if param_lower == "query" || param_lower == "pattern" || param_lower == "search" {
        QUOTED_PHRASE
            .captures(text)
            .map(|caps| caps[1].to_string())
            .or_else(|| BACKTICK_COMMAND.captures(text).map(|caps| caps[1].to_string()))
    } else if param_lower == "description" || param_lower == "title" {
        first_sentence(text)
    } else {
        None
    };

    inferred.filter(|value| !value.trim().is_empty())
}

/// First sentence of the text, capped at 100 characters.
fn first_sentence(text: &str) -> Option<String> {
    let cleaned = text.trim();
    let end = cleaned
        .char_indices()
        .find(|&(_, c)| c == '.' || c == '\n')
        .map(|(i, _)| i)
        .unwrap_or(cleaned.len());

    let sentence: String = cleaned[..end].chars().take(100).collect();
    let sentence = sentence.trim().to_string();
    (!sentence.is_empty()).then_some(sentence)
}

static FUNCTION_ENVELOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<function=([\w-]+)>\s*(\{.*?\})\s*</function(?:=[\w-]+)?>").expect("valid regex"));
static TOOL_CALL_ENVELOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>\s*(\{.*?\})\s*</tool_call>").expect("valid regex"));

/// True when the accumulated text looks like it contains (or is starting to
/// contain) a structured tool-call signature.
///
/// The streaming machine uses this to withhold text that will be converted
/// into a tool-use block at finalize time. This structured detection is
/// authoritative; the natural-language extractor only runs at finalize.
pub fn detect_structured_signature(accumulated: &str, tools: &[Tool]) -> bool {
    if accumulated.contains("<function=") || accumulated.contains("<tool_call>") {
        return true;
    }

    let trimmed = accumulated.trim_start();
    if !trimmed.starts_with('{') {
        return false;
    }

    tools.iter().any(|tool| {
        trimmed.contains(&format!("\"name\": \"{}\"", tool.name))
            || trimmed.contains(&format!("\"name\":\"{}\"", tool.name))
            || trimmed.contains(&format!("\"tool\": \"{}\"", tool.name))
            || trimmed.contains(&format!("\"tool\":\"{}\"", tool.name))
    })
}

/// Extracts fully-formed tool calls embedded in plain text.
///
/// Recognised envelopes: `<function=Name>{json}</function=Name>`,
/// `<tool_call>{json}</tool_call>`, and bare JSON objects whose top-level
/// `name`/`tool` matches a known tool.
pub fn extract_embedded_calls(text: &str, tools: &[Tool]) -> Vec<ExtractedToolCall> {
    let mut calls = Vec::new();

    for caps in FUNCTION_ENVELOPE.captures_iter(text) {
        let name = caps[1].to_string();
        if let Ok(input) = serde_json::from_str::<Value>(&caps[2]) {
            calls.push(ExtractedToolCall::new(name, input));
        }
    }

    for caps in TOOL_CALL_ENVELOPE.captures_iter(text) {
        if let Some(call) = parse_named_call(&caps[1], tools) {
            calls.push(call);
        }
    }

    if calls.is_empty()
        && let Some(call) = extract_bare_json_call(text, tools)
    {
        calls.push(call);
    }

    calls
}

/// Parses `{"name": ..., "arguments": {...}}`-shaped JSON against known tools.
fn parse_named_call(json_text: &str, tools: &[Tool]) -> Option<ExtractedToolCall> {
    let value: Value = serde_json::from_str(json_text).ok()?;
    let name = value
        .get("name")
        .or_else(|| value.get("tool"))
        .and_then(Value::as_str)?;

    if !tools.iter().any(|tool| tool.name == name) {
        return None;
    }

    let input = value
        .get("arguments")
        .or_else(|| value.get("args"))
        .or_else(|| value.get("input"))
        .or_else(|| value.get("parameters"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    input.is_object().then(|| ExtractedToolCall::new(name, input))
}

/// Finds a bare JSON object in the text whose `name`/`tool` matches a known
/// tool. Scans balanced braces from each `{` so surrounding prose is fine.
fn extract_bare_json_call(text: &str, tools: &[Tool]) -> Option<ExtractedToolCall> {
    for (start, _) in text.match_indices('{') {
        let Some(candidate) = balanced_json_slice(&text[start..]) else {
            continue;
        };

        if let Some(call) = parse_named_call(candidate, tools) {
            return Some(call);
        }
    }

    None
}

/// Returns the shortest balanced `{...}` prefix of the input, if any.
fn balanced_json_slice(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash_tool() -> Tool {
        Tool {
            name: "Bash".to_string(),
            description: Some("Run a shell command".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "description": {"type": "string"}
                },
                "required": ["command", "description"]
            }),
        }
    }

    fn read_tool() -> Tool {
        Tool {
            name: "Read".to_string(),
            description: None,
            input_schema: json!({
                "type": "object",
                "properties": {"file_path": {"type": "string"}},
                "required": ["file_path"]
            }),
        }
    }

    #[test]
    fn complete_args_pass_unchanged() {
        let outcome = validate_and_repair(
            "Read",
            r#"{"file_path":"/tmp/a"}"#,
            &[read_tool()],
            "",
        );
        assert!(outcome.valid);
        assert!(!outcome.repaired);
        assert_eq!(outcome.args["file_path"], "/tmp/a");
    }

    #[test]
    fn missing_description_is_inferred_from_nearby_text() {
        let outcome = validate_and_repair(
            "Bash",
            r#"{"command":"ls"}"#,
            &[bash_tool()],
            "Running `ls` to list files. Then we move on.",
        );

        assert!(outcome.valid, "missing: {:?}", outcome.missing_params);
        assert!(outcome.repaired);
        assert_eq!(outcome.args["command"], "ls");
        let description = outcome.args["description"].as_str().unwrap();
        assert!(!description.is_empty());
    }

    #[test]
    fn missing_command_comes_from_fenced_block() {
        let outcome = validate_and_repair(
            "Bash",
            "{}",
            &[bash_tool()],
            "Let me check the status.\n```bash\ngit status\n```\n",
        );

        assert_eq!(outcome.args["command"], "git status");
    }

    #[test]
    fn uninferable_parameter_fails_repair() {
        let tool = Tool {
            name: "Deploy".to_string(),
            description: None,
            input_schema: json!({
                "type": "object",
                "properties": {"region": {"type": "string"}},
                "required": ["region"]
            }),
        };

        let outcome = validate_and_repair("Deploy", "{}", &[tool], "Deploying now.");
        assert!(!outcome.valid);
        assert_eq!(outcome.missing_params, vec!["region"]);
    }

    #[test]
    fn garbage_args_become_empty_object() {
        let outcome = validate_and_repair("Read", "not json at all", &[read_tool()], "reading /tmp/a now");
        // file_path inferred from the path token in the text
        assert!(outcome.valid);
        assert_eq!(outcome.args["file_path"], "/tmp/a");
    }

    #[test]
    fn function_envelope_extraction() {
        let calls = extract_embedded_calls(
            r#"I'll read it now. <function=Read>{"file_path": "/tmp/a"}</function=Read>"#,
            &[read_tool()],
        );

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Read");
        assert_eq!(calls[0].input["file_path"], "/tmp/a");
        assert!(calls[0].id.starts_with("toolu_"));
    }

    #[test]
    fn tool_call_envelope_extraction() {
        let calls = extract_embedded_calls(
            "<tool_call>\n{\"name\": \"Bash\", \"arguments\": {\"command\": \"ls\", \"description\": \"list\"}}\n</tool_call>",
            &[bash_tool()],
        );

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Bash");
        assert_eq!(calls[0].input["command"], "ls");
    }

    #[test]
    fn bare_json_extraction_requires_known_tool() {
        let text = r#"Sure: {"name": "Bash", "arguments": {"command": "pwd"}}"#;

        let known = extract_embedded_calls(text, &[bash_tool()]);
        assert_eq!(known.len(), 1);

        let unknown = extract_embedded_calls(text, &[read_tool()]);
        assert!(unknown.is_empty());
    }

    #[test]
    fn structured_signature_detection() {
        let tools = [bash_tool()];

        assert!(detect_structured_signature("<function=Bash>", &tools));
        assert!(detect_structured_signature("prefix <tool_call>", &tools));
        assert!(detect_structured_signature(r#"{"name": "Bash", "argu"#, &tools));
        assert!(!detect_structured_signature("plain prose about bash", &tools));
        assert!(!detect_structured_signature(r#"{"name": "Other"}"#, &tools));
    }

    #[test]
    fn balanced_slice_handles_nesting_and_strings() {
        assert_eq!(
            balanced_json_slice(r#"{"a": {"b": "}"}} trailing"#),
            Some(r#"{"a": {"b": "}"}}"#)
        );
        assert_eq!(balanced_json_slice("{unclosed"), None);
    }
}
