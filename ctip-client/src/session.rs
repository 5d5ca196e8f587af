//! The client-side session state machine.
//!
//! A [`Session`] owns one connection and drives every operation of the
//! protocol. While a transcode upload is in flight the server may interleave
//! traffic in the other direction (resource pulls, result blocks, messages,
//! progress), so the upload loop waits on the readable-or-writable readiness
//! set and drains one inbound packet before resuming the write.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Bytes, BytesMut};
use ctip_core::io::ByteChannel;
use ctip_core::{
    AbortMode, AbortState, Charset, ChannelIo, ClientPacket, CtipError, Message, Results,
    ServerPacket, ServerUri, TlsChannel, TrustPolicy,
    sink::BlockBuilder,
};
use tokio::net::TcpStream;

use crate::source::{Source, SourceResolver};

/// Receives advisory messages. Never raises.
pub type MessageHandler = Box<dyn FnMut(&Message) + Send>;

/// Receives `(bytes_read, total_length)` progress updates.
pub type ProgressHandler = Box<dyn FnMut(u64, Option<u64>) + Send>;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Ready,
    Transcoding,
    Closed,
}

/// Requests an abort of the in-flight transcode from another call context.
///
/// The session observes the request at its next drain point, sends ABORT,
/// and keeps draining until the server's reply arrives.
#[derive(Clone, Default)]
pub struct AbortHandle(Arc<AtomicU8>);

impl AbortHandle {
    pub fn abort(&self, mode: AbortMode) {
        let v = match mode {
            AbortMode::Graceful => 1,
            AbortMode::Forced => 2,
        };
        self.0.store(v, Ordering::SeqCst);
    }

    fn take(&self) -> Option<AbortMode> {
        match self.0.swap(0, Ordering::SeqCst) {
            1 => Some(AbortMode::Graceful),
            2 => Some(AbortMode::Forced),
            _ => None,
        }
    }
}

/// What an inbound packet did to the current operation.
enum Flow {
    Continue,
    /// EOF: the current result unit was finalized.
    UnitEnd,
    /// NEXT: the operation is complete.
    OperationEnd,
}

/// One authenticated connection to a transcoding server.
pub struct Session {
    io: ChannelIo<Box<dyn ByteChannel>>,
    charset: Charset,
    state: SessionState,
    continuous: bool,
    abort: AbortHandle,
    results: Option<Box<dyn Results>>,
    resolver: Option<Box<dyn SourceResolver>>,
    message_handler: Option<MessageHandler>,
    progress_handler: Option<ProgressHandler>,
    builder: Option<Box<dyn BlockBuilder>>,
    blocks_created: i32,
    main_total: Option<u64>,
    main_read: u64,
    /// Resource pulls received while an outbound frame was mid-write.
    pending_pulls: Vec<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("charset", &self.charset)
            .field("state", &self.state)
            .field("continuous", &self.continuous)
            .field("blocks_created", &self.blocks_created)
            .field("main_total", &self.main_total)
            .field("main_read", &self.main_read)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect and authenticate with the default charset and trust policy.
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, CtipError> {
        Self::connect_with(uri, user, password, Charset::default(), TrustPolicy::default()).await
    }

    /// Connect and authenticate.
    ///
    /// The URI selects plain TCP (`ctip://`) or TLS (`ctips://`) and may
    /// carry a `timeout=<ms>` query arming every subsequent I/O wait.
    pub async fn connect_with(
        uri: &str,
        user: &str,
        password: &str,
        charset: Charset,
        trust: TrustPolicy,
    ) -> Result<Self, CtipError> {
        let server: ServerUri = uri.parse()?;
        tracing::debug!(%server, "connecting");

        let connect = TcpStream::connect((server.host.as_str(), server.port));
        let stream = if server.timeout.is_zero() {
            connect.await?
        } else {
            tokio::time::timeout(server.timeout, connect)
                .await
                .map_err(|_| CtipError::Timeout(server.timeout))??
        };
        let channel: Box<dyn ByteChannel> = if server.tls {
            Box::new(TlsChannel::connect(stream, &server.host, trust, server.timeout).await?)
        } else {
            Box::new(stream)
        };
        let mut io = ChannelIo::new(channel, server.timeout);

        // The header travels in Latin-1; the charset it names applies to
        // everything after it.
        let header = format!("CTIP/2.0 {}\n", charset.label());
        io.write_all(&Charset::Latin1.encode(&header)?).await?;
        let auth = format!("PLAIN: {user} {password}\n");
        io.write_all(&charset.encode(&auth)?).await?;

        let mut reply = [0u8; 4];
        io.read_exact(&mut reply).await?;
        match &reply {
            b"OK \n" => {}
            b"NG \n" => return Err(CtipError::AuthenticationFailed),
            _ => return Err(CtipError::ProtocolViolation("malformed authentication reply")),
        }

        Ok(Self {
            io,
            charset,
            state: SessionState::Ready,
            continuous: false,
            abort: AbortHandle::default(),
            results: None,
            resolver: None,
            message_handler: None,
            progress_handler: None,
            builder: None,
            blocks_created: 0,
            main_total: None,
            main_read: 0,
            pending_pulls: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Handle for aborting an in-flight transcode from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn set_results(&mut self, results: Box<dyn Results>) {
        self.results = Some(results);
    }

    pub fn set_message_handler(&mut self, handler: MessageHandler) {
        self.message_handler = Some(handler);
    }

    pub fn set_progress_handler(&mut self, handler: ProgressHandler) {
        self.progress_handler = Some(handler);
    }

    /// Set a processing property. Only valid before a transcode starts.
    pub async fn property(&mut self, name: &str, value: &str) -> Result<(), CtipError> {
        self.require_ready()?;
        self.send(ClientPacket::Property {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Push an auxiliary resource ahead of the transcode.
    pub async fn resource(&mut self, source: &mut dyn Source) -> Result<(), CtipError> {
        self.require_ready()?;
        self.stream_source(source).await
    }

    /// Enable or disable client-side resource resolution.
    pub async fn set_source_resolver(
        &mut self,
        resolver: Option<Box<dyn SourceResolver>>,
    ) -> Result<(), CtipError> {
        self.require_ready()?;
        self.send(ClientPacket::ClientResource {
            enabled: resolver.is_some(),
        })
        .await?;
        self.resolver = resolver;
        Ok(())
    }

    /// Enable or disable continuous (multi-document) mode.
    pub async fn set_continuous(&mut self, enabled: bool) -> Result<(), CtipError> {
        self.require_ready()?;
        self.send(ClientPacket::Continuous { enabled }).await?;
        self.continuous = enabled;
        Ok(())
    }

    /// Transcode a document streamed by this client.
    pub async fn transcode(&mut self, source: &mut dyn Source) -> Result<(), CtipError> {
        self.begin_transcode()?;
        let result = self.run_transcode(Some(source), None).await;
        self.settle(result)
    }

    /// Transcode a document the server fetches itself.
    pub async fn transcode_uri(&mut self, uri: &str) -> Result<(), CtipError> {
        self.begin_transcode()?;
        let result = self.run_transcode(None, Some(uri)).await;
        self.settle(result)
    }

    /// Fold the results accumulated in continuous mode into one unit.
    pub async fn join(&mut self) -> Result<(), CtipError> {
        self.require_ready()?;
        if !self.continuous {
            return Err(CtipError::InvalidState("join requires continuous mode"));
        }
        self.state = SessionState::Transcoding;
        let result = self.run_join().await;
        self.settle(result)
    }

    /// Fetch server information for `uri`.
    pub async fn server_info(&mut self, uri: &str) -> Result<Bytes, CtipError> {
        self.require_ready()?;
        self.send(ClientPacket::ServerInfo {
            uri: uri.to_string(),
        })
        .await?;
        let mut buf = BytesMut::new();
        loop {
            match ServerPacket::read(&mut self.io, self.charset).await? {
                ServerPacket::Data(chunk) => buf.extend_from_slice(&chunk),
                ServerPacket::Message(msg) => self.forward_message(&msg),
                ServerPacket::Eof => return Ok(buf.freeze()),
                _ => {
                    return Err(CtipError::ProtocolViolation(
                        "unexpected packet in server info reply",
                    ));
                }
            }
        }
    }

    /// Clear session state back to just-authenticated.
    pub async fn reset(&mut self) -> Result<(), CtipError> {
        self.require_ready()?;
        self.send(ClientPacket::Reset).await?;
        self.resolver = None;
        self.continuous = false;
        self.builder = None;
        self.blocks_created = 0;
        self.main_total = None;
        self.main_read = 0;
        Ok(())
    }

    /// Orderly close. Idempotent.
    pub async fn close(&mut self) -> Result<(), CtipError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        ClientPacket::Close.write(&mut self.io, self.charset).await?;
        self.io.shutdown().await
    }

    // ── Transcode machinery ──────────────────────────────────────

    fn require_ready(&self) -> Result<(), CtipError> {
        if self.state == SessionState::Ready {
            Ok(())
        } else {
            Err(CtipError::InvalidState("session is not ready"))
        }
    }

    fn begin_transcode(&mut self) -> Result<(), CtipError> {
        self.require_ready()?;
        if self.results.is_none() {
            return Err(CtipError::InvalidState("no results sink configured"));
        }
        self.state = SessionState::Transcoding;
        self.main_total = None;
        self.main_read = 0;
        Ok(())
    }

    fn settle(&mut self, result: Result<(), CtipError>) -> Result<(), CtipError> {
        // Pulls queued by a transcode that ended early die with it.
        self.pending_pulls.clear();
        self.state = match &result {
            Ok(()) | Err(CtipError::TranscodeAborted { .. }) => SessionState::Ready,
            Err(_) => SessionState::Closed,
        };
        result
    }

    async fn run_transcode(
        &mut self,
        source: Option<&mut dyn Source>,
        uri: Option<&str>,
    ) -> Result<(), CtipError> {
        let mut aborting = false;
        match (&source, uri) {
            (Some(source), _) => {
                let meta = source.meta();
                self.send(ClientPacket::StartMain(meta)).await?;
            }
            (None, Some(uri)) => {
                self.send(ClientPacket::ServerMain {
                    uri: uri.to_string(),
                })
                .await?;
            }
            (None, None) => return Err(CtipError::InvalidState("nothing to transcode")),
        }

        if let Some(source) = source {
            loop {
                if self.check_abort(&mut aborting, true).await? {
                    break;
                }
                match source.next_chunk().await? {
                    Some(chunk) => {
                        let frame = ClientPacket::Data(chunk).encode(self.charset)?;
                        match self.flush_frame(&frame).await? {
                            Flow::Continue | Flow::UnitEnd => {}
                            // The server finished early; stop uploading.
                            Flow::OperationEnd => return Ok(()),
                        }
                    }
                    None => {
                        ClientPacket::Eof.write(&mut self.io, self.charset).await?;
                        break;
                    }
                }
            }
        }

        loop {
            self.check_abort(&mut aborting, false).await?;
            let packet = ServerPacket::read(&mut self.io, self.charset).await?;
            match self.dispatch(packet, false).await? {
                Flow::Continue | Flow::UnitEnd => {}
                Flow::OperationEnd => return Ok(()),
            }
        }
    }

    async fn run_join(&mut self) -> Result<(), CtipError> {
        self.send(ClientPacket::Join).await?;
        loop {
            let packet = ServerPacket::read(&mut self.io, self.charset).await?;
            match self.dispatch(packet, false).await? {
                Flow::Continue => {}
                Flow::UnitEnd | Flow::OperationEnd => return Ok(()),
            }
        }
    }

    /// Push one encoded frame, draining inbound packets whenever the
    /// channel is readable mid-write.
    async fn flush_frame(&mut self, frame: &[u8]) -> Result<Flow, CtipError> {
        let mut sent = 0;
        let mut flow = Flow::Continue;
        'write: while sent < frame.len() {
            let ready = self.io.ready_rw().await?;
            // A readable bit can be stale (a cached readiness from a read
            // that never hit WouldBlock); confirm before committing to a
            // blocking packet read, else a silent server stalls the upload.
            if ready.is_readable() && self.io.confirm_readable()? {
                let packet = ServerPacket::read(&mut self.io, self.charset).await?;
                match self.dispatch(packet, true).await {
                    Ok(Flow::Continue) => {}
                    Ok(f) => {
                        // Never leave a frame half-written.
                        self.io.write_all(&frame[sent..]).await?;
                        flow = f;
                        break 'write;
                    }
                    Err(err) => {
                        // Same invariant on the error path: an abort must
                        // not splice the next packet into a dangling frame.
                        self.io.write_all(&frame[sent..]).await?;
                        return Err(err);
                    }
                }
            }
            if ready.is_writable() {
                match self.io.try_write(&frame[sent..]) {
                    Ok(0) => return Err(CtipError::UnexpectedEof),
                    Ok(n) => sent += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        // Pulls observed mid-frame are answered only once the frame
        // boundary is restored.
        let pending = std::mem::take(&mut self.pending_pulls);
        for uri in pending {
            self.reply_resource(&uri).await?;
        }
        Ok(flow)
    }

    /// Observe a pending abort request. Returns whether an abort is in
    /// flight afterwards.
    async fn check_abort(
        &mut self,
        aborting: &mut bool,
        terminate_upload: bool,
    ) -> Result<bool, CtipError> {
        if !*aborting {
            if let Some(mode) = self.abort.take() {
                tracing::debug!(?mode, "abort requested");
                ClientPacket::Abort { mode }
                    .write(&mut self.io, self.charset)
                    .await?;
                if terminate_upload {
                    ClientPacket::Eof.write(&mut self.io, self.charset).await?;
                }
                *aborting = true;
            }
        }
        Ok(*aborting)
    }

    async fn dispatch(&mut self, packet: ServerPacket, mid_write: bool) -> Result<Flow, CtipError> {
        match packet {
            ServerPacket::StartData(meta) => {
                if let Some(mut open) = self.builder.take() {
                    open.finish()?;
                }
                let results = self
                    .results
                    .as_mut()
                    .ok_or(CtipError::InvalidState("no results sink configured"))?;
                tracing::debug!(uri = %meta.uri, "result unit opened");
                self.builder = Some(results.next_builder(&meta)?);
                self.blocks_created = 0;
                Ok(Flow::Continue)
            }
            ServerPacket::AddBlock => {
                self.builder_mut()?.add_block()?;
                self.blocks_created += 1;
                Ok(Flow::Continue)
            }
            ServerPacket::InsertBlock { anchor } => {
                self.builder_mut()?.insert_block_before(anchor)?;
                self.blocks_created += 1;
                Ok(Flow::Continue)
            }
            ServerPacket::CloseBlock { anchor } => {
                self.builder_mut()?.close_block(anchor)?;
                Ok(Flow::Continue)
            }
            ServerPacket::BlockData { id, data } => {
                self.builder_mut()?.write(id, &data)?;
                Ok(Flow::Continue)
            }
            ServerPacket::Data(data) => {
                // Bare data targets the implicit block 0.
                if self.blocks_created == 0 {
                    self.builder_mut()?.add_block()?;
                    self.blocks_created = 1;
                }
                self.builder_mut()?.write(0, &data)?;
                Ok(Flow::Continue)
            }
            ServerPacket::Message(msg) => {
                self.forward_message(&msg);
                Ok(Flow::Continue)
            }
            ServerPacket::MainLength(n) => {
                self.main_total = (n >= 0).then_some(n as u64);
                self.report_progress();
                Ok(Flow::Continue)
            }
            ServerPacket::MainRead(n) => {
                self.main_read = n.max(0) as u64;
                self.report_progress();
                Ok(Flow::Continue)
            }
            ServerPacket::ResourceRequest { uri } => {
                if mid_write {
                    self.pending_pulls.push(uri);
                } else {
                    self.reply_resource(&uri).await?;
                }
                Ok(Flow::Continue)
            }
            ServerPacket::Eof => {
                if let Some(mut open) = self.builder.take() {
                    open.finish()?;
                }
                if let Some(results) = self.results.as_mut() {
                    results.end()?;
                }
                Ok(Flow::UnitEnd)
            }
            ServerPacket::Abort {
                mode,
                code,
                text,
                args,
            } => {
                let state = match mode {
                    AbortMode::Graceful => {
                        if let Some(mut open) = self.builder.take() {
                            open.finish()?;
                        }
                        if let Some(results) = self.results.as_mut() {
                            results.end()?;
                        }
                        AbortState::PartiallyReadable
                    }
                    AbortMode::Forced => {
                        self.builder = None;
                        AbortState::Broken
                    }
                };
                Err(CtipError::TranscodeAborted {
                    state,
                    code,
                    message: text,
                    args,
                })
            }
            ServerPacket::Next => Ok(Flow::OperationEnd),
        }
    }

    // The explicit `'static` keeps the unsized coercion out of the
    // `Result`, which cannot perform it.
    fn builder_mut(&mut self) -> Result<&mut (dyn BlockBuilder + 'static), CtipError> {
        self.builder
            .as_deref_mut()
            .ok_or(CtipError::ProtocolViolation(
                "block operation outside a result unit",
            ))
    }

    fn forward_message(&mut self, msg: &Message) {
        match self.message_handler.as_mut() {
            Some(handler) => handler(msg),
            None => tracing::debug!(code = msg.code, text = %msg.text, "server message"),
        }
    }

    fn report_progress(&mut self) {
        if let Some(handler) = self.progress_handler.as_mut() {
            handler(self.main_read, self.main_total);
        }
    }

    /// Answer a server resource pull. The main upload is paused while this
    /// runs, so plain deadline writes are safe here.
    async fn reply_resource(&mut self, uri: &str) -> Result<(), CtipError> {
        let resolved = match self.resolver.as_mut() {
            Some(resolver) => resolver.resolve(uri).await,
            None => Err(CtipError::ResourceNotFound(uri.to_string())),
        };
        match resolved {
            Ok(mut source) => self.stream_source(source.as_mut()).await,
            Err(err) => {
                tracing::warn!(uri, %err, "resource unresolved");
                ClientPacket::MissingResource {
                    uri: uri.to_string(),
                }
                .write(&mut self.io, self.charset)
                .await
            }
        }
    }

    async fn stream_source(&mut self, source: &mut dyn Source) -> Result<(), CtipError> {
        ClientPacket::StartResource(source.meta())
            .write(&mut self.io, self.charset)
            .await?;
        while let Some(chunk) = source.next_chunk().await? {
            ClientPacket::Data(chunk)
                .write(&mut self.io, self.charset)
                .await?;
        }
        ClientPacket::Eof.write(&mut self.io, self.charset).await
    }

    async fn send(&mut self, packet: ClientPacket) -> Result<(), CtipError> {
        packet.write(&mut self.io, self.charset).await
    }
}
