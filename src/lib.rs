//! toolsmith - LLM-authored tools run as supervised subprocesses
//!
//! A language model writes small tools, toolsmith compiles each unit of
//! tools into a standalone binary, runs it as a child process and talks to
//! it over a private length-prefixed protocol.
//!
//! # Modules
//!
//! - `wire` - frame transport, typed verbs, RPC server and clients
//! - `supervisor` - compile, spawn, hot-restart and stop unit processes
//! - `registry` - jobs, cancellation, progress and buffered outputs
//! - `codegen` - generate → compile → fix loop over tool specs
//! - `agent` - multi-turn tool-calling loop over unit tools
//! - `llm` - the completion service seam and its adapters
//! - `guest` - runtime linked into every unit binary
//! - `config`, `services`, `metrics`, `tracing` - ambient stack
//!
//! # Quick Start
//!
//! ```ignore
//! use toolsmith::{config::Config, services::Services};
//!
//! let services = Services::new(Config::load(None)?)?;
//! let unit = services.open_unit("Math").await?;
//! let reply = unit.invoke(None, "Add", br#"{"A":1,"B":2}"#.to_vec()).await?;
//! ```

pub mod agent;
pub mod codegen;
pub mod config;
pub mod guest;
pub mod llm;
pub mod metrics;
pub mod registry;
pub mod services;
pub mod supervisor;
pub mod tracing;
pub mod wire;

pub use config::Config;
pub use registry::{JobId, MessageRegistry};
pub use services::Services;
pub use supervisor::{Supervisor, UnitTree};
