//! Private point-to-point protocol between the supervisor and its guests
//!
//! - [`frame`]: the two wire primitives (int and array frames)
//! - [`verb`]: typed verbs, their fields and replies, and the handler traits
//! - [`server`]: accept loop spawning one task per connection
//! - [`client`]: one-connection-per-call clients for both directions

pub mod client;
pub mod frame;
pub mod server;
pub mod verb;

pub use client::{Endpoint, GuestClient, HostClient, RpcError};
pub use frame::{FrameConn, FrameError, WireStats};
pub use server::{Dispatch, GuestEndpoint, HostEndpoint, RpcServer};
pub use verb::{
    BuildReply, BuildRequest, CallToolRequest, ChangeReply, ChangeRequest, CompletionReply,
    GuestHandler, GuestVerb, HostHandler, HostVerb, ProgressRequest, Served, UpdateReply,
    UpdateRequest, ViolationRequest,
};
