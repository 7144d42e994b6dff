//! Toolchain - how a unit's sources become a binary
//!
//! The supervisor only knows the [`Toolchain`] trait: write the synthetic
//! entry point, fix imports, ensure build metadata, build, and the textual
//! conventions generated code must follow. [`CargoToolchain`] builds units as
//! standalone Cargo packages depending on this crate's guest SDK.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::SupervisorError;

/// One compiler diagnostic attached to a source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeError {
    pub file: String,
    pub line: u32,
    pub col: u32,
    pub message: String,
}

fn diagnostic_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<file>[^:\s][^:]*):(?P<line>\d+):(?P<col>\d+):\s*(?P<msg>.+)$").ok()
    })
    .as_ref()
}

/// Parse `file:line:col: message` lines; everything else is dropped
///
/// Warnings are dropped as well, and a leading `error:`/`error[E..]:` is
/// stripped from the message. Only the file name is kept.
pub fn parse_diagnostics(stderr: &str) -> Vec<CodeError> {
    let Some(re) = diagnostic_re() else {
        return Vec::new();
    };
    stderr
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim_end())?;
            let msg = caps["msg"].trim();
            if msg.starts_with("warning") {
                return None;
            }
            let message = strip_error_prefix(msg).to_string();
            let file = Path::new(&caps["file"])
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| caps["file"].to_string());
            Some(CodeError {
                file,
                line: caps["line"].parse().ok()?,
                col: caps["col"].parse().ok()?,
                message,
            })
        })
        .collect()
}

fn strip_error_prefix(msg: &str) -> &str {
    let Some(rest) = msg.strip_prefix("error") else {
        return msg;
    };
    let rest = match rest.strip_prefix('[') {
        Some(code) => code.split_once(']').map_or(rest, |(_, tail)| tail),
        None => rest,
    };
    rest.strip_prefix(':').map_or(msg, str::trim_start)
}

/// One source module of a unit as the entry point sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryModule {
    /// File name inside the unit dir, e.g. `Add.rs`
    pub file: String,
    pub tools: Vec<String>,
    pub has_init: bool,
    pub has_destroy: bool,
}

/// Outcome of running the build command
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub success: bool,
    pub stderr: String,
}

#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Extension of tool source files, without the dot
    fn source_extension(&self) -> &str;

    fn comment_prefix(&self) -> &str;

    /// Files the toolchain writes itself; excluded from the content hash
    fn generated_files(&self) -> &[&str];

    /// Source form that reads secret `alias` at run time
    fn secret_lookup(&self, alias: &str) -> String;

    fn write_entry_point(&self, dir: &Path, unit: &str, modules: &[EntryModule]) -> std::io::Result<()>;

    /// Best-effort cleanup of imports/formatting; failures are not fatal
    async fn fix_imports(&self, dir: &Path, files: &[String]);

    fn ensure_metadata(&self, dir: &Path, unit: &str) -> std::io::Result<()>;

    /// Build the unit and place the binary at `output`
    async fn build(&self, dir: &Path, unit: &str, output: &Path) -> Result<BuildOutput, SupervisorError>;
}

/// Builds units with `cargo build --release`
#[derive(Debug, Clone)]
pub struct CargoToolchain {
    /// Path of this crate, which generated units depend on for the guest SDK
    pub sdk_path: PathBuf,
    /// Shared target dir; defaults to `<unit>/target`
    pub target_dir: Option<PathBuf>,
    pub cargo: String,
    pub rustfmt: String,
}

impl CargoToolchain {
    pub fn new(sdk_path: impl Into<PathBuf>) -> Self {
        Self {
            sdk_path: sdk_path.into(),
            target_dir: None,
            cargo: "cargo".to_string(),
            rustfmt: "rustfmt".to_string(),
        }
    }

    pub fn with_target_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_dir = Some(dir.into());
        self
    }

    fn package_name(unit: &str) -> String {
        format!("unit_{}", module_name(unit))
    }
}

const RUST_KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum", "extern",
    "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub",
    "ref", "return", "self", "static", "struct", "super", "trait", "true", "type", "unsafe", "use",
    "where", "while", "main",
];

/// `CamelCase.rs` → `camel_case`, safe as a module identifier
pub fn module_name(stem: &str) -> String {
    let stem = stem.rsplit_once('.').map_or(stem, |(s, _)| s);
    let mut out = String::with_capacity(stem.len() + 4);
    for (i, c) in stem.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) || RUST_KEYWORDS.contains(&out.as_str()) {
        out.insert_str(0, "m_");
    }
    out
}

#[async_trait]
impl Toolchain for CargoToolchain {
    fn source_extension(&self) -> &str {
        "rs"
    }

    fn comment_prefix(&self) -> &str {
        "//"
    }

    fn generated_files(&self) -> &[&str] {
        &["main.rs", "Cargo.toml", "Cargo.lock"]
    }

    /// Borrowed so it stands in for a `&str` literal where `ctx` is in scope
    fn secret_lookup(&self, alias: &str) -> String {
        format!("&ctx.secret({alias:?})")
    }

    fn write_entry_point(&self, dir: &Path, unit: &str, modules: &[EntryModule]) -> std::io::Result<()> {
        let mut src = String::from("// Generated by toolsmith. Do not edit.\n#![allow(non_snake_case)]\n\n");
        for m in modules {
            src.push_str(&format!("#[path = {:?}]\nmod {};\n", m.file, module_name(&m.file)));
        }
        src.push_str("\nfn main() -> std::process::ExitCode {\n");
        src.push_str(&format!("    let mut host = toolsmith::guest::ToolHost::new({unit:?});\n"));
        for m in modules {
            let module = module_name(&m.file);
            for tool in &m.tools {
                src.push_str(&format!("    host.register::<{module}::{tool}>({tool:?});\n"));
            }
            if m.has_init {
                src.push_str(&format!("    host.on_init({module}::init);\n"));
            }
            if m.has_destroy {
                src.push_str(&format!("    host.on_destroy({module}::destroy);\n"));
            }
        }
        src.push_str("    host.run_from_args()\n}\n");
        std::fs::write(dir.join("main.rs"), src)
    }

    async fn fix_imports(&self, dir: &Path, files: &[String]) {
        if files.is_empty() {
            return;
        }
        let result = Command::new(&self.rustfmt)
            .arg("--edition")
            .arg("2021")
            .args(files)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        match result {
            Ok(out) if out.status.success() => {}
            Ok(out) => tracing::debug!(
                dir = %dir.display(),
                stderr = %String::from_utf8_lossy(&out.stderr),
                "rustfmt reported problems"
            ),
            Err(e) => tracing::debug!(error = %e, "rustfmt unavailable"),
        }
    }

    fn ensure_metadata(&self, dir: &Path, unit: &str) -> std::io::Result<()> {
        let manifest = dir.join("Cargo.toml");
        if manifest.exists() {
            return Ok(());
        }
        let name = Self::package_name(unit);
        let sdk = self.sdk_path.display().to_string().replace('\\', "/");
        let toml = format!(
            "[package]\nname = \"{name}\"\nversion = \"0.1.0\"\nedition = \"2021\"\n\n\
             [[bin]]\nname = \"{name}\"\npath = \"main.rs\"\n\n\
             [dependencies]\ntoolsmith = {{ path = \"{sdk}\" }}\n\
             serde = {{ version = \"1.0\", features = [\"derive\"] }}\nserde_json = \"1.0\"\n\n\
             [workspace]\n"
        );
        std::fs::write(manifest, toml)
    }

    async fn build(&self, dir: &Path, unit: &str, output: &Path) -> Result<BuildOutput, SupervisorError> {
        let target_dir = self.target_dir.clone().unwrap_or_else(|| dir.join("target"));
        let out = Command::new(&self.cargo)
            .args(["build", "--release", "--message-format=short", "--quiet"])
            .env("CARGO_TARGET_DIR", &target_dir)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SupervisorError::Toolchain(format!("{}: {e}", self.cargo)))?;

        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        if !out.status.success() {
            return Ok(BuildOutput { success: false, stderr });
        }

        let built = target_dir.join("release").join(Self::package_name(unit));
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&built, output)?;
        Ok(BuildOutput { success: true, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_errors_drops_noise() {
        let stderr = "\
Add.rs:10:5: error[E0425]: cannot find value `foo` in this scope
src/Storage.rs:3:1: warning: unused import: `std::fmt`
error: could not compile `unit_notes` (bin \"unit_notes\") due to 1 previous error
Sub.rs:2:14: error: expected `;`, found `}`
";
        let errors = parse_diagnostics(stderr);
        assert_eq!(
            errors,
            vec![
                CodeError {
                    file: "Add.rs".into(),
                    line: 10,
                    col: 5,
                    message: "cannot find value `foo` in this scope".into(),
                },
                CodeError {
                    file: "Sub.rs".into(),
                    line: 2,
                    col: 14,
                    message: "expected `;`, found `}`".into(),
                },
            ]
        );
    }

    #[test]
    fn test_plain_message_kept_verbatim() {
        let errors = parse_diagnostics("X.rs:10:5: undefined: foo");
        assert_eq!(errors[0].message, "undefined: foo");
    }

    #[test]
    fn test_module_names() {
        assert_eq!(module_name("Add.rs"), "add");
        assert_eq!(module_name("SendEmail.rs"), "send_email");
        assert_eq!(module_name("Type.rs"), "m_type");
        assert_eq!(module_name("3d-Plot"), "m_3d_plot");
    }

    #[test]
    fn test_entry_point_wires_tools_and_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = CargoToolchain::new("/sdk");
        let modules = vec![
            EntryModule {
                file: "Storage.rs".into(),
                tools: vec![],
                has_init: true,
                has_destroy: true,
            },
            EntryModule {
                file: "Add.rs".into(),
                tools: vec!["Add".into()],
                has_init: false,
                has_destroy: false,
            },
        ];
        toolchain.write_entry_point(dir.path(), "Notes", &modules).unwrap();
        let main = std::fs::read_to_string(dir.path().join("main.rs")).unwrap();
        assert!(main.contains("#[path = \"Add.rs\"]\nmod add;"));
        assert!(main.contains("host.register::<add::Add>(\"Add\");"));
        assert!(main.contains("host.on_init(storage::init);"));
        assert!(main.contains("ToolHost::new(\"Notes\")"));
    }

    #[test]
    fn test_metadata_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = CargoToolchain::new("/opt/toolsmith");
        toolchain.ensure_metadata(dir.path(), "Notes").unwrap();
        let manifest = std::fs::read_to_string(dir.path().join("Cargo.toml")).unwrap();
        assert!(manifest.contains("name = \"unit_notes\""));
        assert!(manifest.contains("toolsmith = { path = \"/opt/toolsmith\" }"));

        std::fs::write(dir.path().join("Cargo.toml"), "custom").unwrap();
        toolchain.ensure_metadata(dir.path(), "Notes").unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("Cargo.toml")).unwrap(), "custom");
    }
}
