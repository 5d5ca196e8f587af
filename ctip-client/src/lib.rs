//! # ctip-client
//!
//! Client protocol engine for CTIP/2.0.
//!
//! This crate contains:
//! - **Session**: the client state machine — connect/authenticate, set
//!   properties and resources, run transcodes with interleaved upload and
//!   result assembly, abort, join, reset, close
//! - **Sources**: `Source` / `SourceResolver` with in-memory and file
//!   implementations for uploads and server-initiated resource pulls

pub mod session;
pub mod source;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use session::{AbortHandle, MessageHandler, ProgressHandler, Session, SessionState};
pub use source::{CHUNK_SIZE, FileSource, MemorySource, Source, SourceResolver};
