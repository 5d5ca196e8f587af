//! # ctip-core
//!
//! Core protocol library for CTIP/2.0, the binary document-transcoding
//! session protocol.
//!
//! This crate contains:
//! - **Transport**: `ByteChannel` + `ChannelIo` — readiness-multiplexed,
//!   deadline-armed frame I/O over plain TCP or TLS
//! - **TLS**: `TlsChannel` driving the rustls record engine directly,
//!   with a configurable `TrustPolicy`
//! - **Packets**: `ClientPacket` / `ServerPacket` — the direction-specific
//!   wire vocabulary and its codec
//! - **Sessions**: `Charset` negotiation, `ServerUri` addresses,
//!   `MetaSource` payload metadata
//! - **Messages**: advisory `Message` / `Severity` and well-known codes
//! - **Sink**: `BlockBuilder` / `Results` — deterministic reassembly of
//!   out-of-order result blocks
//! - **Error**: `CtipError` — typed, `thiserror`-based error hierarchy

pub mod charset;
pub mod error;
pub mod io;
pub mod message;
pub mod meta;
pub mod packet;
pub mod sink;
pub mod tls;
pub mod uri;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use charset::Charset;
pub use error::{AbortState, CtipError};
pub use io::{ByteChannel, ChannelIo};
pub use message::{Message, Severity};
pub use meta::MetaSource;
pub use packet::{AbortMode, ClientPacket, MAX_PAYLOAD, ServerPacket};
pub use sink::{BlockBuilder, MemoryBuilder, NopBuilder, NopResults, Results, SingleResult};
pub use tls::{TlsChannel, TrustPolicy};
pub use uri::{DEFAULT_PORT, ServerUri};
