//! Chat exchange - the ordered turns of one agent conversation

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::llm::{Message, ToolCall};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    User {
        text: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reasoning: String,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatExchange {
    pub turns: Vec<Turn>,
}

impl ChatExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::User { text: text.into() });
    }

    pub fn push_assistant(&mut self, reasoning: impl Into<String>, text: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.turns.push(Turn::Assistant {
            reasoning: reasoning.into(),
            text: text.into(),
            tool_calls,
        });
    }

    pub fn push_tool_result(&mut self, call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) {
        self.turns.push(Turn::ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            content: content.into(),
        });
    }

    /// Tool-call ids without exactly one result, in call order
    pub fn unresolved_calls(&self) -> Vec<&str> {
        let mut results: HashMap<&str, usize> = HashMap::new();
        for turn in &self.turns {
            if let Turn::ToolResult { call_id, .. } = turn {
                *results.entry(call_id.as_str()).or_default() += 1;
            }
        }
        self.turns
            .iter()
            .filter_map(|t| match t {
                Turn::Assistant { tool_calls, .. } => Some(tool_calls),
                _ => None,
            })
            .flatten()
            .map(|c| c.id.as_str())
            .filter(|id| results.get(id) != Some(&1))
            .collect()
    }

    /// Every tool call has exactly one result
    pub fn is_resolved(&self) -> bool {
        self.unresolved_calls().is_empty()
    }

    /// Text of the most recent assistant turn
    pub fn last_answer(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|t| match t {
            Turn::Assistant { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Flatten into service messages behind `system`
    pub fn to_messages(&self, system: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        if !system.is_empty() {
            messages.push(Message::system(system));
        }
        for turn in &self.turns {
            messages.push(match turn {
                Turn::User { text } => Message::user(text.clone()),
                Turn::Assistant {
                    reasoning,
                    text,
                    tool_calls,
                } => Message {
                    reasoning: (!reasoning.is_empty()).then(|| reasoning.clone()),
                    tool_calls: tool_calls.clone(),
                    ..Message::assistant(text.clone())
                },
                Turn::ToolResult { call_id, content, .. } => Message::tool_result(call_id.clone(), content.clone()),
            });
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "Calc__Add".into(),
            arguments: json!({"A": 1, "B": 2}),
        }
    }

    #[test]
    fn test_resolution_needs_exactly_one_result() {
        let mut exchange = ChatExchange::new();
        exchange.push_user("add");
        exchange.push_assistant("", "", vec![call("a"), call("b")]);
        assert_eq!(exchange.unresolved_calls(), vec!["a", "b"]);

        exchange.push_tool_result("a", "Calc__Add", "3");
        assert_eq!(exchange.unresolved_calls(), vec!["b"]);
        exchange.push_tool_result("b", "Calc__Add", "3");
        assert!(exchange.is_resolved());

        exchange.push_tool_result("b", "Calc__Add", "again");
        assert!(!exchange.is_resolved());
    }

    #[test]
    fn test_messages_carry_call_ids() {
        let mut exchange = ChatExchange::new();
        exchange.push_user("add");
        exchange.push_assistant("thinking", "", vec![call("a")]);
        exchange.push_tool_result("a", "Calc__Add", "3");
        exchange.push_assistant("", "It is 3.", vec![]);

        let messages = exchange.to_messages("sys");
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[2].reasoning.as_deref(), Some("thinking"));
        assert_eq!(messages[2].tool_calls.len(), 1);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("a"));
        assert_eq!(exchange.last_answer(), Some("It is 3."));
    }

    #[test]
    fn test_serde_shape() {
        let mut exchange = ChatExchange::new();
        exchange.push_user("hi");
        let json = serde_json::to_value(&exchange).unwrap();
        assert_eq!(json, json!({"turns": [{"kind": "user", "text": "hi"}]}));
    }
}
