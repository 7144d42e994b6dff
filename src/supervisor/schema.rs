//! Tool surface discovery
//!
//! Generated sources declare tools by convention instead of being parsed in
//! full: a tool is a `pub struct` that has an `impl Tool for <Name>` in the
//! same file. Its `pub` fields are the parameters, fields prefixed `Out_` are
//! outputs, and `///` comments become descriptions. Module-level
//! `pub fn init()` / `pub fn destroy()` are lifecycle hooks.
//!
//! The convention lives behind [`SchemaExtractor`] so another parser can be
//! swapped in per target language.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const OUTPUT_PREFIX: &str = "Out_";

/// An output field of a tool, e.g. `Out_Sum: f64`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// Everything the agent and supervisor need to know about one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub unit: String,
    pub name: String,
    pub description: String,
    /// JSON Schema of the input parameters
    pub parameters: Value,
    pub outputs: Vec<OutputField>,
}

/// What one source file contributes to its unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceSurface {
    pub tools: Vec<ToolSchema>,
    pub has_init: bool,
    pub has_destroy: bool,
}

pub trait SchemaExtractor: Send + Sync {
    fn extract(&self, unit: &str, source: &str) -> SourceSurface;
}

/// Regex-based reader for the naming convention described above
#[derive(Debug, Clone, Copy, Default)]
pub struct ConventionExtractor;

struct Patterns {
    tool_impl: Regex,
    struct_head: Regex,
    field: Regex,
    init: Regex,
    destroy: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static P: OnceLock<Option<Patterns>> = OnceLock::new();
    P.get_or_init(|| {
        Some(Patterns {
            tool_impl: Regex::new(r"impl\s+(?:[\w:]+::)?Tool\s+for\s+(\w+)").ok()?,
            struct_head: Regex::new(r"^\s*pub\s+struct\s+(\w+)\s*\{").ok()?,
            field: Regex::new(r"^\s*pub\s+(\w+)\s*:\s*([^,]+?)\s*,?\s*$").ok()?,
            init: Regex::new(r"(?m)^pub\s+fn\s+init\s*\(\s*\)").ok()?,
            destroy: Regex::new(r"(?m)^pub\s+fn\s+destroy\s*\(\s*\)").ok()?,
        })
    })
    .as_ref()
}

impl SchemaExtractor for ConventionExtractor {
    fn extract(&self, unit: &str, source: &str) -> SourceSurface {
        let Some(p) = patterns() else {
            return SourceSurface::default();
        };

        let implemented: Vec<&str> = p
            .tool_impl
            .captures_iter(source)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();

        let mut surface = SourceSurface {
            tools: Vec::new(),
            has_init: p.init.is_match(source),
            has_destroy: p.destroy.is_match(source),
        };

        let lines: Vec<&str> = source.lines().collect();
        let mut i = 0;
        while i < lines.len() {
            let Some(head) = p.struct_head.captures(lines[i]) else {
                i += 1;
                continue;
            };
            let name = head[1].to_string();
            let description = doc_above(&lines, i);
            let mut properties = Map::new();
            let mut required = Vec::new();
            let mut outputs = Vec::new();
            let mut field_doc = Vec::new();

            i += 1;
            while i < lines.len() && !lines[i].trim_start().starts_with('}') {
                let line = lines[i].trim();
                if let Some(doc) = line.strip_prefix("///") {
                    field_doc.push(doc.trim().to_string());
                } else if let Some(f) = p.field.captures(lines[i]) {
                    let field = f[1].to_string();
                    let ty = f[2].trim().to_string();
                    if field.starts_with(OUTPUT_PREFIX) {
                        outputs.push(OutputField { name: field, ty });
                    } else {
                        let (mut schema, optional) = json_type(&ty);
                        if !field_doc.is_empty() {
                            schema["description"] = Value::String(field_doc.join(" "));
                        }
                        if !optional {
                            required.push(Value::String(field.clone()));
                        }
                        properties.insert(field, schema);
                    }
                    field_doc.clear();
                } else if !line.starts_with("#[") {
                    field_doc.clear();
                }
                i += 1;
            }

            if implemented.contains(&name.as_str()) {
                surface.tools.push(ToolSchema {
                    unit: unit.to_string(),
                    name,
                    description,
                    parameters: json!({
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    }),
                    outputs,
                });
            }
        }

        surface
    }
}

/// `///` lines directly above line `at`, skipping attributes
fn doc_above(lines: &[&str], at: usize) -> String {
    let mut docs = Vec::new();
    for line in lines[..at].iter().rev() {
        let t = line.trim();
        if let Some(doc) = t.strip_prefix("///") {
            docs.push(doc.trim());
        } else if t.starts_with("#[") {
            continue;
        } else {
            break;
        }
    }
    docs.reverse();
    docs.join(" ")
}

/// JSON Schema for a Rust field type, and whether the field may be omitted
fn json_type(ty: &str) -> (Value, bool) {
    let ty = ty.trim();
    if let Some(inner) = generic_arg(ty, "Option") {
        return (json_type(inner).0, true);
    }
    if let Some(inner) = generic_arg(ty, "Vec") {
        return (json!({"type": "array", "items": json_type(inner).0}), false);
    }
    let base = ty.rsplit("::").next().unwrap_or(ty);
    let schema = match base {
        "f32" | "f64" => json!({"type": "number"}),
        "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64" | "u128"
        | "usize" => json!({"type": "integer"}),
        "bool" => json!({"type": "boolean"}),
        "String" | "&str" | "str" | "char" => json!({"type": "string"}),
        _ => json!({"type": "object"}),
    };
    (schema, false)
}

fn generic_arg<'a>(ty: &'a str, outer: &str) -> Option<&'a str> {
    let (head, rest) = ty.split_once('<')?;
    let head = head.trim_end();
    if head.rsplit("::").next() != Some(outer) {
        return None;
    }
    rest.strip_suffix('>').map(str::trim)
}

impl ToolSchema {
    /// Human summary of the tool for prompts
    pub fn signature(&self) -> String {
        let params = self.parameters["properties"]
            .as_object()
            .map(|props| props.keys().cloned().collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        let outputs = self
            .outputs
            .iter()
            .map(|o| o.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}.{}({}) -> ({})", self.unit, self.name, params, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD: &str = r#"
use serde::{Deserialize, Serialize};
use toolsmith::guest::{Tool, ToolContext};

/// Adds two numbers.
#[derive(Default, Serialize, Deserialize)]
pub struct Add {
    /// First operand
    pub A: f64,
    pub B: f64,
    /// Optional label
    pub Label: Option<String>,
    pub Out_Sum: f64,
}

impl Tool for Add {
    fn run(&mut self, _ctx: &ToolContext) -> Result<(), String> {
        self.Out_Sum = self.A + self.B;
        Ok(())
    }
}

pub struct Helper {
    pub x: i32,
}

pub fn init() {}
"#;

    #[test]
    fn test_tool_struct_with_impl_is_discovered() {
        let surface = ConventionExtractor.extract("Calc", ADD);
        assert_eq!(surface.tools.len(), 1);
        let add = &surface.tools[0];
        assert_eq!(add.name, "Add");
        assert_eq!(add.unit, "Calc");
        assert_eq!(add.description, "Adds two numbers.");
        assert_eq!(add.parameters["properties"]["A"]["type"], "number");
        assert_eq!(add.parameters["properties"]["A"]["description"], "First operand");
        assert_eq!(add.parameters["properties"]["Label"]["type"], "string");
        assert_eq!(add.parameters["required"], json!(["A", "B"]));
        assert_eq!(
            add.outputs,
            vec![OutputField {
                name: "Out_Sum".into(),
                ty: "f64".into()
            }]
        );
        assert!(surface.has_init);
        assert!(!surface.has_destroy);
    }

    #[test]
    fn test_vec_and_unknown_types() {
        let (schema, optional) = json_type("Vec<u32>");
        assert_eq!(schema, json!({"type": "array", "items": {"type": "integer"}}));
        assert!(!optional);
        assert_eq!(json_type("storage::Note").0, json!({"type": "object"}));
        assert!(json_type("std::option::Option<bool>").1);
    }

    #[test]
    fn test_signature() {
        let surface = ConventionExtractor.extract("Calc", ADD);
        assert_eq!(surface.tools[0].signature(), "Calc.Add(A, B, Label) -> (Out_Sum)");
    }
}
