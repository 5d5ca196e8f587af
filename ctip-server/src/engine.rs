//! The transcoding engine adapter.
//!
//! The protocol processor knows nothing about document processing; it hands
//! each operation to a [`TranscodeEngine`]. During a transcode the engine
//! runs concurrently with the processor's protocol pump on the same task,
//! joined by a command channel: the engine emits output through an
//! [`EngineSink`] and suspends on it whenever it needs main-document bytes
//! or a client-held resource, resuming when the processor has pumped the
//! answer off the wire.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use ctip_core::{CtipError, Message, MetaSource};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Failures an engine reports to the processor.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A document or resource could not be located.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Processing failed; `code` follows the message-code convention.
    #[error("engine failure [{code:#06x}]: {message}")]
    Failed { code: u16, message: String },

    /// The transcode was cancelled by an abort.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Protocol(#[from] CtipError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity material parsed from the auth line, plus the peer address.
#[derive(Debug, Clone, Default)]
pub struct AuthProps {
    pub user: Option<String>,
    pub password: Option<String>,
    /// Extra key/value pairs from an `OPTIONS:` auth line.
    pub options: HashMap<String, String>,
    pub peer: Option<SocketAddr>,
}

/// How the main document reaches the engine.
#[derive(Debug, Clone)]
pub enum MainDocument {
    /// Streamed by the client; pull chunks via [`EngineSink::pull_main`].
    Client(MetaSource),
    /// Fetch the document at `uri` directly.
    Server { uri: String },
}

/// A resource the client supplied in answer to a pull.
#[derive(Debug, Clone)]
pub struct ClientResource {
    pub meta: MetaSource,
    pub data: Bytes,
}

/// Commands the engine sends to the protocol pump.
pub enum SinkCommand {
    /// Open a new result unit.
    StartUnit(MetaSource),
    /// Open a block adjacent to the last opened one.
    AddBlock,
    /// Open a block spliced before `anchor`.
    InsertBlockBefore { anchor: i32 },
    /// Append bytes to an open block.
    Write { id: i32, data: Bytes },
    /// No further writes to `anchor`.
    CloseBlock { anchor: i32 },
    /// Finalize the current unit (flush and EOF).
    FinishUnit,
    /// Advisory message, subject to the session's filter.
    Message(Message),
    /// Total main-document length became known.
    MainLength(i64),
    /// Main-document bytes consumed so far.
    MainRead(i64),
    /// Demand the next main-document chunk; `None` means end of stream.
    PullMain(oneshot::Sender<Option<Bytes>>),
    /// Demand a resource only the client can supply; `None` means the
    /// client could not resolve it.
    NeedResource {
        uri: String,
        reply: oneshot::Sender<Option<ClientResource>>,
    },
}

/// The engine's handle onto the protocol pump.
#[derive(Clone)]
pub struct EngineSink {
    tx: mpsc::Sender<SinkCommand>,
    cancel: CancellationToken,
}

impl EngineSink {
    pub(crate) fn new(tx: mpsc::Sender<SinkCommand>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Set once the client aborts; the engine should return
    /// [`EngineError::Cancelled`] at its next convenient point.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn start_unit(&self, meta: MetaSource) -> Result<(), EngineError> {
        self.send(SinkCommand::StartUnit(meta)).await
    }

    pub async fn add_block(&self) -> Result<(), EngineError> {
        self.send(SinkCommand::AddBlock).await
    }

    pub async fn insert_block_before(&self, anchor: i32) -> Result<(), EngineError> {
        self.send(SinkCommand::InsertBlockBefore { anchor }).await
    }

    pub async fn write(&self, id: i32, data: Bytes) -> Result<(), EngineError> {
        self.send(SinkCommand::Write { id, data }).await
    }

    pub async fn close_block(&self, anchor: i32) -> Result<(), EngineError> {
        self.send(SinkCommand::CloseBlock { anchor }).await
    }

    pub async fn finish_unit(&self) -> Result<(), EngineError> {
        self.send(SinkCommand::FinishUnit).await
    }

    pub async fn message(&self, message: Message) -> Result<(), EngineError> {
        self.send(SinkCommand::Message(message)).await
    }

    pub async fn main_length(&self, length: i64) -> Result<(), EngineError> {
        self.send(SinkCommand::MainLength(length)).await
    }

    pub async fn main_read(&self, read: i64) -> Result<(), EngineError> {
        self.send(SinkCommand::MainRead(read)).await
    }

    /// Pull the next main-document chunk, suspending until the pump has it.
    pub async fn pull_main(&self) -> Result<Option<Bytes>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(SinkCommand::PullMain(reply)).await?;
        rx.await
            .map_err(|_| EngineError::Protocol(CtipError::ChannelClosed))
    }

    /// Pull a client-held resource, suspending until the pump has the
    /// client's answer.
    pub async fn need_resource(&self, uri: &str) -> Result<Option<ClientResource>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(SinkCommand::NeedResource {
            uri: uri.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::Protocol(CtipError::ChannelClosed))
    }

    async fn send(&self, cmd: SinkCommand) -> Result<(), EngineError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::Protocol(CtipError::ChannelClosed))
    }
}

/// Adapter to an actual document-transcoding implementation.
#[async_trait]
pub trait TranscodeEngine: Send {
    /// Decide whether the presented identity may open a session.
    async fn authenticate(&mut self, props: &AuthProps) -> Result<bool, EngineError>;

    /// A processing property, set before the transcode.
    async fn property(&mut self, name: &str, value: &str) -> Result<(), EngineError>;

    /// An auxiliary resource pushed by the client ahead of the transcode.
    async fn resource(&mut self, meta: &MetaSource, data: Bytes) -> Result<(), EngineError>;

    /// Run one transcode, emitting output through `sink`.
    async fn transcode(&mut self, main: MainDocument, sink: EngineSink) -> Result<(), EngineError>;

    /// Continuous (multi-document) mode was toggled.
    async fn set_continuous(&mut self, enabled: bool) -> Result<(), EngineError>;

    /// Fold the results accumulated in continuous mode into one unit.
    async fn join(&mut self, sink: EngineSink) -> Result<(), EngineError>;

    /// Clear per-session engine state.
    async fn reset(&mut self) -> Result<(), EngineError>;

    /// Server information for `uri`.
    async fn server_info(&mut self, uri: &str) -> Result<Bytes, EngineError>;
}
