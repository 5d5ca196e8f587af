//! Server-side CTIP/2.0 session processing.
//!
//! - [`Processor`] drives one accepted connection: handshake, auth, and the
//!   command loop.
//! - [`TranscodeEngine`] is the seam to an actual document-transcoding
//!   implementation; [`EngineSink`] is its handle back into the protocol.
//! - [`MessageFilter`] applies the client's include/exclude patterns to
//!   advisory messages.
//! - [`ProcessorConfig`] carries I/O and output tuning, loadable from TOML.
//!
//! Listening, accepting, and TLS termination are the embedding
//! application's concern; `Processor::process` takes any established
//! [`ByteChannel`](ctip_core::ByteChannel).

pub mod config;
pub mod engine;
pub mod filter;
pub mod processor;

pub use config::ProcessorConfig;
pub use engine::{
    AuthProps, ClientResource, EngineError, EngineSink, MainDocument, TranscodeEngine,
};
pub use filter::MessageFilter;
pub use processor::Processor;
