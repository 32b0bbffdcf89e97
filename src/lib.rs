//! # quill-session — Client-session core for the Quill document server
//!
//! The per-connection layer of a realtime collaborative-document server:
//! it sits between one client's duplex message stream and the shared
//! storage/OT/query Backend, and owns everything that belongs to that one
//! connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌─────────────┐
//! │   Client    │ ◄──────────────► │    Agent    │  (one per connection)
//! │             │    JSON records  │             │
//! └─────────────┘                  └──────┬──────┘
//!                                         │ subscribe / fetch / submit / query
//!                                         ▼
//!                                  ┌─────────────┐
//!                                  │   Backend   │  (shared: OT + storage
//!                                  │             │   + live queries)
//!                                  └──────┬──────┘
//!                                         │ DocStreams / QuerySubscriptions
//!                                         ▼
//!                                   back through the Agent to the client
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol: validation, reply framing, op and
//!   query-result translation
//! - [`backend`] — the Backend trait and the streams it hands out
//! - [`stream`] — the duplex message-stream abstraction and an in-process
//!   pipe
//! - [`agent`] — the per-connection session core
//! - [`server`] — WebSocket accept loop, one agent per connection

pub mod agent;
pub mod backend;
pub mod protocol;
pub mod server;
pub mod stream;

// Re-exports for convenience
pub use agent::{Agent, AgentContext};
pub use backend::{
    Backend, BulkSubscription, DocEvent, DocStream, Op, OpContent, QueryDiff, QueryEvent,
    QueryOptions, QueryResult, QuerySubscription, Snapshot, StreamHandle, SubmitResult,
};
pub use protocol::{ProtocolError, WireError, ERR_MESSAGE_BADLY_FORMED, ERR_OP_ALREADY_SUBMITTED};
pub use server::{ServerConfig, ServerStats, SessionServer};
pub use stream::{pipe, MessageStream, PipeHandle, PipeStream, WireMessage};
