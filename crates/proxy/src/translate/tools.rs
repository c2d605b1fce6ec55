//! Tool-schema conversion and sanitisation.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::ToolSummarization;
use crate::protocol::{
    anthropic::Tool,
    google::{FunctionDeclaration, ToolDecl},
    openai::{FunctionDef, ToolDef},
};

const SUMMARY_MAX: usize = 150;
const PROPERTY_DESCRIPTION_MAX: usize = 80;
const ENUM_MAX: usize = 5;

static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

/// Converts Anthropic tools to OpenAI function definitions.
pub fn to_openai_tools(tools: &[Tool], mode: ToolSummarization) -> Vec<ToolDef> {
    tools
        .iter()
        .map(|tool| ToolDef {
            def_type: "function".to_string(),
            function: FunctionDef {
                name: tool.name.clone(),
                description: converted_description(tool, mode),
                parameters: sanitize_schema(&tool.input_schema, mode),
            },
        })
        .collect()
}

/// Converts Anthropic tools to a Gemini functionDeclarations wrapper.
pub fn to_google_tools(tools: &[Tool], mode: ToolSummarization) -> Option<Vec<ToolDecl>> {
    if tools.is_empty() {
        return None;
    }

    let declarations = tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name.clone(),
            description: converted_description(tool, mode),
            parameters: sanitize_schema(&tool.input_schema, mode),
        })
        .collect();

    Some(vec![ToolDecl {
        function_declarations: declarations,
    }])
}

fn converted_description(tool: &Tool, mode: ToolSummarization) -> Option<String> {
    match mode {
        ToolSummarization::Off => tool.description.clone(),
        ToolSummarization::Summarize => tool.description.as_deref().map(summarize),
    }
}

/// Compresses a tool description: markup stripped, first sentence, capped.
pub fn summarize(description: &str) -> String {
    let stripped = MARKUP.replace_all(description, "");
    let trimmed = stripped.trim();

    let end = trimmed
        .char_indices()
        .find(|&(_, c)| c == '.' || c == '\n')
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());

    let sentence = trimmed[..end].trim();
    if sentence.chars().count() <= SUMMARY_MAX {
        sentence.to_string()
    } else {
        sentence.chars().take(SUMMARY_MAX).collect()
    }
}

/// Recursively sanitises a JSON schema for picky backends.
///
/// `format: "uri"` declarations are dropped everywhere. Under summarisation,
/// enum lists are capped and property descriptions trimmed.
pub fn sanitize_schema(schema: &Value, mode: ToolSummarization) -> Value {
    match schema {
        Value::Object(map) => {
            let mut sanitized = serde_json::Map::with_capacity(map.len());

            for (key, value) in map {
                if key == "format" && value.as_str() == Some("uri") {
                    continue;
                }

                if mode == ToolSummarization::Summarize {
                    if key == "enum"
                        && let Value::Array(options) = value
                        && options.len() > ENUM_MAX
                    {
                        sanitized.insert(key.clone(), Value::Array(options[..ENUM_MAX].to_vec()));
                        continue;
                    }

                    if key == "description"
                        && let Value::String(text) = value
                        && text.chars().count() > PROPERTY_DESCRIPTION_MAX
                    {
                        let trimmed: String = text.chars().take(PROPERTY_DESCRIPTION_MAX).collect();
                        sanitized.insert(key.clone(), Value::String(trimmed));
                        continue;
                    }
                }

                sanitized.insert(key.clone(), sanitize_schema(value, mode));
            }

            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| sanitize_schema(item, mode)).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool() -> Tool {
        Tool {
            name: "WebFetch".to_string(),
            description: Some("<b>Fetches</b> a URL. Performs an HTTP GET and returns the body text.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "format": "uri", "description": "The URL"},
                    "mode": {"type": "string", "enum": ["a", "b", "c", "d", "e", "f", "g"]}
                },
                "required": ["url"]
            }),
        }
    }

    #[test]
    fn uri_format_is_always_removed() {
        let defs = to_openai_tools(&[tool()], ToolSummarization::Off);
        let params = &defs[0].function.parameters;

        assert!(params["properties"]["url"].get("format").is_none());
        // Everything else survives untouched.
        assert_eq!(params["properties"]["url"]["description"], "The URL");
        assert_eq!(params["properties"]["mode"]["enum"].as_array().unwrap().len(), 7);
    }

    #[test]
    fn summarisation_compresses_descriptions_and_enums() {
        let defs = to_openai_tools(&[tool()], ToolSummarization::Summarize);

        let description = defs[0].function.description.as_deref().unwrap();
        assert_eq!(description, "Fetches a URL");

        let params = &defs[0].function.parameters;
        assert_eq!(params["properties"]["mode"]["enum"].as_array().unwrap().len(), ENUM_MAX);
    }

    #[test]
    fn long_sentence_is_capped() {
        let long = "word ".repeat(100);
        assert_eq!(summarize(&long).chars().count(), SUMMARY_MAX);
    }

    #[test]
    fn google_tools_wrap_declarations() {
        let decls = to_google_tools(&[tool()], ToolSummarization::Off).unwrap();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].function_declarations[0].name, "WebFetch");

        assert!(to_google_tools(&[], ToolSummarization::Off).is_none());
    }
}
