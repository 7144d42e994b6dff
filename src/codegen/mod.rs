//! Code generation loop
//!
//! Turns natural-language [`ToolSpec`]s into tool sources through the
//! Completion Service, compiles them with the unit's [`Supervisor`] and feeds
//! compiler errors back until the unit builds or the attempt bound is hit.
//!
//! [`Supervisor`]: crate::supervisor::Supervisor

pub mod generator;
pub mod prompt;
pub mod secrets;
pub mod spec;

pub use generator::{CodeGenerator, CodegenError, GenerationReport, GeneratorSettings};
pub use secrets::{SecretStore, SecretsError};
pub use spec::{extract_code, parse_prompt_file, GenState, ToolSpec, STORAGE_SPEC};
