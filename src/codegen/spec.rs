//! Tool specs - one prompt, its generated source and how far it got

use serde::{Deserialize, Serialize};

use crate::llm::{Message, Usage};
use crate::supervisor::{CodeError, SchemaExtractor, ToolSchema};

/// Name of the shared spec generated before all others
pub const STORAGE_SPEC: &str = "Storage";

/// Idle → Generating → CompileClean | CompileError → [Generating] → Done | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenState {
    #[default]
    Idle,
    Generating,
    CompileClean,
    CompileError,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub prompt: String,
    pub source: String,
    /// Rebuilt whenever `source` changes
    pub tools: Vec<ToolSchema>,
    pub errors: Vec<CodeError>,
    /// Raw compiler output when the build failed without per-file diagnostics
    pub build_output: String,
    pub usage: Usage,
    /// Messages of the last generation, replayed on retry
    pub conversation: Vec<Message>,
    pub state: GenState,
    pub attempts: u32,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn is_storage(&self) -> bool {
        self.name == STORAGE_SPEC
    }

    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{}", self.name, extension)
    }

    /// Replace the source and rediscover its tools
    pub fn set_source(&mut self, unit: &str, source: String, extractor: &dyn SchemaExtractor) {
        self.tools = extractor.extract(unit, &source).tools;
        self.source = source;
    }

    pub fn needs_fix(&self) -> bool {
        self.state == GenState::CompileError
    }

    /// Source with each diagnostic appended to its line as a comment
    ///
    /// `let x = foo; //Error(Col 13): undefined: foo`. Diagnostics pointing
    /// past the last line are appended at the end.
    pub fn annotated_source(&self, comment_prefix: &str) -> String {
        let mut lines: Vec<String> = self.source.lines().map(str::to_string).collect();
        let mut trailing = Vec::new();
        for e in &self.errors {
            let note = format!("{comment_prefix}Error(Col {}): {}", e.col, e.message);
            match (e.line as usize).checked_sub(1).and_then(|i| lines.get_mut(i)) {
                Some(line) => {
                    line.push(' ');
                    line.push_str(&note);
                }
                None => trailing.push(note),
            }
        }
        lines.extend(trailing);
        let mut out = lines.join("\n");
        if self.source.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

/// First fenced code block of an answer, or the whole answer trimmed
pub fn extract_code(answer: &str) -> String {
    let Some(start) = answer.find("```") else {
        return answer.trim().to_string();
    };
    let after = &answer[start + 3..];
    // Skip the info string (```rust)
    let body = after.split_once('\n').map_or("", |(_, rest)| rest);
    match body.find("```") {
        Some(end) => body[..end].trim_end().to_string() + "\n",
        None => body.trim_end().to_string() + "\n",
    }
}

/// Split a prompt file into specs on `# Name` headings
///
/// Text before the first heading is ignored; empty sections are dropped.
pub fn parse_prompt_file(text: &str) -> Vec<ToolSpec> {
    let mut specs = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        if let Some(heading) = line.strip_prefix("# ") {
            if let Some((name, body)) = current.take() {
                push_spec(&mut specs, name, &body);
            }
            current = Some((heading.trim().to_string(), Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((name, body)) = current {
        push_spec(&mut specs, name, &body);
    }
    specs
}

fn push_spec(specs: &mut Vec<ToolSpec>, name: String, body: &[&str]) {
    let prompt = body.join("\n").trim().to_string();
    if name.is_empty() || prompt.is_empty() {
        return;
    }
    specs.push(ToolSpec::new(name, prompt));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(line: u32, col: u32, message: &str) -> CodeError {
        CodeError {
            file: "X.rs".into(),
            line,
            col,
            message: message.into(),
        }
    }

    #[test]
    fn test_annotation_lands_on_line() {
        let mut spec = ToolSpec::new("X", "p");
        spec.source = (1..=12).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n") + "\n";
        spec.errors = vec![error(10, 5, "undefined: foo"), error(40, 1, "unexpected EOF")];

        let annotated = spec.annotated_source("//");
        let lines: Vec<&str> = annotated.lines().collect();
        assert_eq!(lines[9], "line10 //Error(Col 5): undefined: foo");
        assert_eq!(lines[8], "line9");
        assert_eq!(*lines.last().unwrap(), "//Error(Col 1): unexpected EOF");
        assert!(annotated.ends_with('\n'));
    }

    #[test]
    fn test_extract_first_fenced_block() {
        let answer = "Here you go:\n```rust\nfn a() {}\n```\nand\n```rust\nfn b() {}\n```";
        assert_eq!(extract_code(answer), "fn a() {}\n");
        assert_eq!(extract_code("  fn raw() {}  "), "fn raw() {}");
        assert_eq!(extract_code("```\nunterminated\n"), "unterminated\n");
    }

    #[test]
    fn test_prompt_file_sections() {
        let text = "preamble\n# Storage\nA note type.\n\n# Add\nAdd A and B.\n# Empty\n\n";
        let specs = parse_prompt_file(text);
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Storage", "Add"]);
        assert!(specs[0].is_storage());
        assert_eq!(specs[1].prompt, "Add A and B.");
        assert_eq!(specs[1].file_name("rs"), "Add.rs");
    }
}
