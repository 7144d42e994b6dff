//! Text fallback for models that print tool calls instead of emitting them
//!
//! Some local models answer with `{"name": "...", "arguments": {...}}` in the
//! message body rather than using the native tool-call field. This scans the
//! text for such objects and keeps the ones that name an offered tool.

use serde_json::Value;

use super::service::ToolCall;

/// Extract tool calls written as JSON in `content`
///
/// `known` limits results to tools that were actually offered. Each call
/// gets a fresh `text_call_<uuid>` id so calls from separate answers never
/// collide within one exchange.
pub fn parse_tool_calls_from_text(content: &str, known: &[&str]) -> Vec<ToolCall> {
    let content = strip_fences(content.trim());

    let mut found = Vec::new();
    if let Some(value) = parse_lenient(content) {
        collect(&value, &mut found);
    } else {
        for candidate in balanced_objects(content) {
            if let Some(value) = parse_lenient(candidate) {
                collect(&value, &mut found);
            }
        }
    }

    found
        .into_iter()
        .filter(|(name, _)| known.is_empty() || known.contains(&name.as_str()))
        .map(|(name, arguments)| ToolCall {
            id: format!("text_call_{}", uuid::Uuid::now_v7().simple()),
            name,
            arguments,
        })
        .collect()
}

/// Drop a surrounding ```json fence if the whole answer is one block
fn strip_fences(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Top-level `{...}` spans, respecting string literals
fn balanced_objects(content: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in content.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        spans.push(&content[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    spans
}

/// Parse JSON, retrying once with trailing commas removed
fn parse_lenient(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return Some(v);
    }
    let cleaned = text.replace(",}", "}").replace(",]", "]").replace(", }", " }");
    serde_json::from_str::<Value>(&cleaned).ok()
}

/// Accept `{name, arguments}`, `{name, parameters}`, `{function: {...}}`,
/// `{tool_calls: [...]}` and arrays of any of these
fn collect(value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect(item, out)),
        Value::Object(map) => {
            if let Some(calls) = map.get("tool_calls") {
                collect(calls, out);
                return;
            }
            if let Some(function) = map.get("function").filter(|f| f.is_object()) {
                collect(function, out);
                return;
            }
            let Some(name) = map.get("name").and_then(Value::as_str) else {
                return;
            };
            let arguments = map
                .get("arguments")
                .or_else(|| map.get("parameters"))
                .cloned()
                .unwrap_or(Value::Object(Default::default()));
            // Arguments sometimes arrive double-encoded as a JSON string
            let arguments = match arguments {
                Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                other => other,
            };
            out.push((name.to_string(), arguments));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_whole_answer_is_a_call() {
        let calls = parse_tool_calls_from_text(r#"{"name": "Add", "arguments": {"A": 1, "B": 2}}"#, &["Add"]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Add");
        assert_eq!(calls[0].arguments, json!({"A": 1, "B": 2}));
        assert!(calls[0].id.starts_with("text_call_"));
    }

    #[test]
    fn test_ids_unique_across_answers() {
        let text = r#"{"name": "Add", "arguments": {}} {"name": "Add", "arguments": {}}"#;
        let first = parse_tool_calls_from_text(text, &["Add"]);
        let second = parse_tool_calls_from_text(text, &["Add"]);
        assert_eq!(first.len(), 2);
        assert_ne!(first[0].id, first[1].id);
        assert_ne!(first[0].id, second[0].id);
    }

    #[test]
    fn test_calls_embedded_in_prose() {
        let text = r#"Let me add them. {"name": "Add", "parameters": {"A": 1, "B": "}"}} then
        {"function": {"name": "Sub", "arguments": "{\"A\": 5}"}}"#;
        let calls = parse_tool_calls_from_text(text, &[]);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments["B"], "}");
        assert_eq!(calls[1].name, "Sub");
        assert_eq!(calls[1].arguments, json!({"A": 5}));
    }

    #[test]
    fn test_fenced_block_and_unknown_tools() {
        let text = "```json\n[{\"name\": \"Add\", \"arguments\": {}}, {\"name\": \"rm\", \"arguments\": {}},]\n```";
        let calls = parse_tool_calls_from_text(text, &["Add"]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Add");
    }

    #[test]
    fn test_plain_text_yields_nothing() {
        assert!(parse_tool_calls_from_text("The answer is 3.", &["Add"]).is_empty());
    }
}
