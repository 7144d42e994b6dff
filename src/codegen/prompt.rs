//! Prompt assembly for the code generation loop

use crate::llm::Message;

use super::spec::ToolSpec;

/// Guest SDK surface generated code is written against
pub const GUEST_API: &str = r#"Each file is one Rust module of a standalone binary. The entry point is generated for you; never write `fn main`.

A tool is a `pub struct` with `#[derive(Default, Serialize, Deserialize)]` and `#[serde(default)]` that implements `toolsmith::guest::Tool`:

    pub trait Tool: Serialize + DeserializeOwned + Send + 'static {
        fn run(&mut self, ctx: &ToolContext) -> Result<(), String>;
        fn ui(&self) -> Vec<u8> { Vec::new() }
        fn change(&mut self, ctx: &ToolContext, change: &serde_json::Value) -> Result<(), String> { Ok(()) }
        fn update(&mut self, ctx: &ToolContext, sub_id: u64) -> Result<Vec<u8>, String> { Ok(Vec::new()) }
    }

- `pub` fields are the tool's parameters; `///` comments on the struct and fields describe them to the caller.
- Fields named `Out_<Name>` are outputs: set them in `run`.
- Module-level `pub fn init()` and `pub fn destroy()` run once at process start and exit.

ToolContext (all calls block until the supervisor answers):

    ctx.progress(done: f64, label: &str) -> bool          // false once the call was cancelled; stop promptly
    ctx.print(text: &str)
    ctx.add_cmds(cmds: &[u8])
    ctx.secret(alias: &str) -> String                      // never hard-code credentials
    ctx.call_tool(unit: &str, tool: &str, params: serde_json::Value) -> Result<serde_json::Value, String>
    ctx.complete(prompt: &str) -> Result<String, String>   // ask the language model
    ctx.report_violation(kind: &str, detail: &str) -> bool // true means the operation must not proceed

Types shared between tools live in the `Storage` module and are reached as `crate::storage::TypeName`."#;

/// Complete example of a generated tool file
pub const EXAMPLE_TOOL: &str = r#"use serde::{Deserialize, Serialize};
use toolsmith::guest::{Tool, ToolContext};

/// Adds two numbers.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Add {
    /// First operand
    pub A: f64,
    /// Second operand
    pub B: f64,
    pub Out_Sum: f64,
}

impl Tool for Add {
    fn run(&mut self, ctx: &ToolContext) -> Result<(), String> {
        if !ctx.progress(0.5, "adding") {
            return Err("cancelled".into());
        }
        self.Out_Sum = self.A + self.B;
        Ok(())
    }
}
"#;

/// Static reference material plus the Storage module a tool may build on
pub fn system_prompt(spec: &ToolSpec, storage: Option<&str>, secret_aliases: &[String]) -> String {
    let mut prompt = format!(
        "You write one Rust source file named `{file}` for a tool unit.\n\n\
         {GUEST_API}\n\nExample:\n```rust\n{EXAMPLE_TOOL}```\n",
        file = spec.file_name("rs"),
    );
    if spec.is_storage() {
        prompt.push_str(
            "\nThis is the Storage module: declare the shared `pub` types and optional \
             `init`/`destroy` hooks. It declares no tools.\n",
        );
    } else if let Some(storage) = storage.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\nThe Storage module (`crate::storage`):\n```rust\n{storage}\n```\n"));
    }
    if !secret_aliases.is_empty() {
        prompt.push_str(&format!(
            "\nSecrets available through `ctx.secret`: {}. Read them inside `run` or another \
             function that has `ctx` in scope; a quoted secret value anywhere else is replaced \
             by `&ctx.secret(..)` and will not compile.\n",
            secret_aliases.join(", ")
        ));
    }
    prompt.push_str("\nAnswer with the complete file in a single ```rust block.");
    prompt
}

/// Messages for the next generation of `spec`
///
/// First attempt: system prompt and the user's request. Retry: the previous
/// conversation followed by the annotated source and a fix instruction.
pub fn generation_messages(
    spec: &ToolSpec,
    storage: Option<&str>,
    secret_aliases: &[String],
    comment_prefix: &str,
) -> Vec<Message> {
    if !spec.needs_fix() || spec.conversation.is_empty() {
        return vec![
            Message::system(system_prompt(spec, storage, secret_aliases)),
            Message::user(spec.prompt.clone()),
        ];
    }

    let mut messages = spec.conversation.clone();
    messages.push(Message::user(fix_instruction(spec, comment_prefix)));
    messages
}

fn fix_instruction(spec: &ToolSpec, comment_prefix: &str) -> String {
    let mut text = format!(
        "The file `{}` failed to compile. Compiler errors are appended to the offending lines as `{comment_prefix}Error(Col N): message` comments:\n\n```rust\n{}\n```\n",
        spec.file_name("rs"),
        spec.annotated_source(comment_prefix).trim_end(),
    );
    if spec.errors.is_empty() && !spec.build_output.trim().is_empty() {
        text.push_str(&format!("\nBuild output:\n```\n{}\n```\n", spec.build_output.trim()));
    }
    text.push_str("\nFix every error and answer with the complete corrected file. Do not include the error comments.");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::spec::GenState;
    use crate::llm::Role;
    use crate::supervisor::CodeError;

    #[test]
    fn test_first_attempt_messages() {
        let spec = ToolSpec::new("Add", "Add A and B");
        let messages = generation_messages(&spec, Some("pub struct Note;"), &["mail".into()], "//");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("pub struct Note;"));
        assert!(messages[0].content.contains("Secrets available through `ctx.secret`: mail."));
        assert!(messages[0].content.contains("replaced by `&ctx.secret(..)`"));
        assert_eq!(messages[1].content, "Add A and B");
    }

    #[test]
    fn test_storage_prompt_omits_itself() {
        let spec = ToolSpec::new("Storage", "Notes with a title");
        let prompt = system_prompt(&spec, Some("ignored"), &[]);
        assert!(prompt.contains("This is the Storage module"));
        assert!(!prompt.contains("ignored"));
    }

    #[test]
    fn test_retry_replays_conversation_with_annotations() {
        let mut spec = ToolSpec::new("X", "do x");
        spec.source = "fn a() {\n    foo\n}\n".into();
        spec.state = GenState::CompileError;
        spec.errors = vec![CodeError {
            file: "X.rs".into(),
            line: 2,
            col: 5,
            message: "undefined: foo".into(),
        }];
        spec.conversation = vec![
            Message::system("sys"),
            Message::user("do x"),
            Message::assistant("```rust\nfn a() {\n    foo\n}\n```"),
        ];

        let messages = generation_messages(&spec, None, &[], "//");
        assert_eq!(messages.len(), 4);
        let fix = &messages[3].content;
        assert!(fix.contains("    foo //Error(Col 5): undefined: foo"));
        assert!(fix.contains("Fix every error"));
    }
}
