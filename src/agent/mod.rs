//! Agentic loop over unit tools
//!
//! ```text
//! prompt → AgentController → CompletionService (with tool definitions)
//!                 ↓
//!          tool call `Unit__Tool`
//!                 ↓
//!          ToolInvoker → Supervisor::invoke → guest `build`
//!                 ↓
//!          summarized outputs appended → loop or answer
//! ```

pub mod controller;
pub mod exchange;
pub mod invoker;
pub mod sessions;

pub use controller::{
    tool_name, AgentConfig, AgentController, AgentError, AgentEvent, AgentRequest, AgentResult, StopReason,
    DEFAULT_AGENT_SYSTEM_PROMPT,
};
pub use exchange::{ChatExchange, Turn};
pub use invoker::{summarize_outputs, SupervisorInvoker, ToolInvoker, ToolOutput};
pub use sessions::{Session, SessionStore, SessionSummary};
