//! Tool invocation seam between the agent loop and running guests

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::registry::JobId;
use crate::supervisor::schema::OUTPUT_PREFIX;
use crate::supervisor::{OutputField, ToolSchema, UnitTree};

/// What a successful tool call produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// JSON of the tool after `run`, outputs included
    pub data: Vec<u8>,
    pub ui: Vec<u8>,
    pub cmds: Vec<u8>,
}

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Run `tool` with `arguments`; `Err` carries the tool's error text
    async fn invoke(&self, tool: &ToolSchema, arguments: &Value) -> Result<ToolOutput, String>;
}

/// Invokes tools on the supervisors of a [`UnitTree`]
pub struct SupervisorInvoker {
    tree: Arc<UnitTree>,
    parent: Option<JobId>,
}

impl SupervisorInvoker {
    pub fn new(tree: Arc<UnitTree>) -> Self {
        Self { tree, parent: None }
    }

    /// Nest every call under `job`, so stopping it stops them
    pub fn with_parent(mut self, job: JobId) -> Self {
        self.parent = Some(job);
        self
    }
}

#[async_trait]
impl ToolInvoker for SupervisorInvoker {
    async fn invoke(&self, tool: &ToolSchema, arguments: &Value) -> Result<ToolOutput, String> {
        let supervisor = self
            .tree
            .find(&tool.unit)
            .ok_or_else(|| format!("unknown unit: {}", tool.unit))?;
        let params = serde_json::to_vec(arguments).map_err(|e| e.to_string())?;
        let reply = supervisor
            .invoke(self.parent, &tool.name, params)
            .await
            .map_err(|e| e.to_string())?;
        if reply.is_error() {
            return Err(reply.error);
        }
        Ok(ToolOutput {
            data: reply.data,
            ui: reply.ui,
            cmds: reply.cmds,
        })
    }
}

/// Human-readable view of a tool's `Out_*` fields
///
/// One output gives its raw value; several give `Name(type): value` lines
/// with the prefix stripped. Data without outputs is returned as text.
pub fn summarize_outputs(data: &[u8], outputs: &[OutputField]) -> String {
    let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(data) else {
        return String::from_utf8_lossy(data).into_owned();
    };

    let mut found: Vec<(&str, String, &Value)> = Vec::new();
    for declared in outputs {
        if let Some(value) = fields.get(&declared.name) {
            found.push((declared.name.as_str(), declared.ty.clone(), value));
        }
    }
    for (name, value) in &fields {
        if name.starts_with(OUTPUT_PREFIX) && !found.iter().any(|(n, _, _)| *n == name.as_str()) {
            found.push((name.as_str(), json_type_name(value).to_string(), value));
        }
    }

    match found.as_slice() {
        [] => String::from_utf8_lossy(data).into_owned(),
        [(_, _, value)] => raw_value(value),
        many => many
            .iter()
            .map(|(name, ty, value)| {
                let short = name.strip_prefix(OUTPUT_PREFIX).unwrap_or(*name);
                format!("{short}({ty}): {}", raw_value(value))
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn raw_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "f64",
        Value::Number(_) => "i64",
        Value::String(_) => "String",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, ty: &str) -> OutputField {
        OutputField {
            name: name.into(),
            ty: ty.into(),
        }
    }

    #[test]
    fn test_single_output_is_raw() {
        let data = br#"{"A":1,"B":2,"Out_Sum":3}"#;
        assert_eq!(summarize_outputs(data, &[field("Out_Sum", "f64")]), "3");
        assert_eq!(summarize_outputs(br#"{"Out_Text":"hi"}"#, &[]), "hi");
    }

    #[test]
    fn test_multiple_outputs_are_typed_lines() {
        let data = br#"{"Out_Sum":3,"Out_Label":"three","Out_Extra":true}"#;
        let declared = [field("Out_Sum", "f64"), field("Out_Label", "String")];
        assert_eq!(
            summarize_outputs(data, &declared),
            "Sum(f64): 3\nLabel(String): three\nExtra(bool): true"
        );
    }

    #[test]
    fn test_no_outputs_falls_back_to_text() {
        assert_eq!(summarize_outputs(b"plain", &[]), "plain");
        assert_eq!(summarize_outputs(br#"{"A":1}"#, &[]), r#"{"A":1}"#);
    }
}
