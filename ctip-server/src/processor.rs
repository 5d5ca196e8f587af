//! Per-connection protocol processor.
//!
//! `Processor::process` owns one accepted connection: header and auth
//! handshake, then a command loop dispatching client packets to the engine.
//! During a transcode the engine future and the protocol pump run joined by
//! `select!` on this one task — never as two tasks racing on the
//! connection. The engine suspends on its sink whenever it needs
//! main-document bytes or a client-held resource; the pump reads the answer
//! off the wire and resumes it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ctip_core::io::ByteChannel;
use ctip_core::message::codes;
use ctip_core::{
    AbortMode, Charset, ChannelIo, ClientPacket, CtipError, Message, MetaSource, ServerPacket,
};
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessorConfig;
use crate::engine::{
    AuthProps, ClientResource, EngineError, EngineSink, MainDocument, SinkCommand, TranscodeEngine,
};
use crate::filter::{self, MessageFilter};

/// Drives the server side of one session.
pub struct Processor<E: TranscodeEngine> {
    engine: E,
    config: ProcessorConfig,
    filter: MessageFilter,
    charset: Charset,
    continuous: bool,
    client_resource: bool,
}

impl<E: TranscodeEngine> Processor<E> {
    pub fn new(engine: E, config: ProcessorConfig) -> Self {
        Self {
            engine,
            config,
            filter: MessageFilter::new(),
            charset: Charset::default(),
            continuous: false,
            client_resource: false,
        }
    }

    /// Process one accepted connection to completion. The accept loop that
    /// hands connections here is the caller's concern.
    pub async fn process<C: ByteChannel>(
        mut self,
        channel: C,
        peer: SocketAddr,
    ) -> Result<(), CtipError> {
        let mut io = ChannelIo::new(channel, self.config.io_timeout());
        let result = self.run(&mut io, peer).await;
        let _ = io.shutdown().await;
        if let Err(err) = &result {
            tracing::warn!(%peer, %err, "session ended with error");
        }
        result
    }

    async fn run<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
        peer: SocketAddr,
    ) -> Result<(), CtipError> {
        let header = io.read_line(Charset::Latin1).await?;
        let Some(label) = header.strip_prefix("CTIP/2.0 ") else {
            if let Some(rest) = header.strip_prefix("CTIP/") {
                let version = rest.split_whitespace().next().unwrap_or(rest);
                return Err(CtipError::UnsupportedVersion(version.to_string()));
            }
            return Err(CtipError::ProtocolViolation("malformed connection header"));
        };
        self.charset = Charset::from_label(label)
            .ok_or(CtipError::ProtocolViolation("unsupported charset"))?;

        let line = io.read_line(self.charset).await?;
        let props = parse_auth(&line, peer)?;
        let granted = match self.engine.authenticate(&props).await {
            Ok(granted) => granted,
            Err(err) => {
                tracing::error!(%peer, %err, "authentication error");
                false
            }
        };
        if !granted {
            tracing::warn!(%peer, user = ?props.user, "authentication rejected");
            io.write_all(b"NG \n").await?;
            return Ok(());
        }
        io.write_all(b"OK \n").await?;
        tracing::debug!(%peer, charset = self.charset.label(), "session open");

        self.command_loop(io).await
    }

    async fn command_loop<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
    ) -> Result<(), CtipError> {
        loop {
            match ClientPacket::read(io, self.charset).await? {
                ClientPacket::Property { name, value } => self.property(&name, &value).await,
                ClientPacket::StartResource(meta) => {
                    let data = read_payload(io, self.charset).await?;
                    if let Err(err) = self.engine.resource(&meta, data).await {
                        tracing::warn!(uri = %meta.uri, %err, "resource rejected");
                    }
                }
                ClientPacket::ClientResource { enabled } => self.client_resource = enabled,
                ClientPacket::Continuous { enabled } => {
                    self.continuous = enabled;
                    if let Err(err) = self.engine.set_continuous(enabled).await {
                        tracing::warn!(%err, "set_continuous rejected");
                    }
                }
                ClientPacket::StartMain(meta) => {
                    self.run_transcode(io, MainDocument::Client(meta), true)
                        .await?;
                }
                ClientPacket::ServerMain { uri } => {
                    self.run_transcode(io, MainDocument::Server { uri }, false)
                        .await?;
                }
                ClientPacket::Join => self.run_join(io).await?,
                ClientPacket::Reset => {
                    self.filter.clear();
                    self.continuous = false;
                    self.client_resource = false;
                    if let Err(err) = self.engine.reset().await {
                        tracing::warn!(%err, "reset rejected");
                    }
                }
                ClientPacket::ServerInfo { uri } => self.serve_info(io, &uri).await?,
                // Leftovers from a torn-down operation.
                stray @ (ClientPacket::Data(_)
                | ClientPacket::Eof
                | ClientPacket::Abort { .. }
                | ClientPacket::MissingResource { .. }) => {
                    tracing::debug!(ty = stray.type_byte(), "ignoring stray packet");
                }
                ClientPacket::Close => return Ok(()),
            }
        }
    }

    async fn property(&mut self, name: &str, value: &str) {
        match name {
            "processing.include-message" => self.filter.include(value),
            "processing.exclude-message" => self.filter.exclude(value),
            _ => {
                if let Err(err) = self.engine.property(name, value).await {
                    tracing::warn!(name, %err, "property rejected");
                }
            }
        }
    }

    async fn serve_info<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
        uri: &str,
    ) -> Result<(), CtipError> {
        match self.engine.server_info(uri).await {
            Ok(info) => {
                for chunk in info.chunks(8192) {
                    ServerPacket::Data(Bytes::copy_from_slice(chunk))
                        .write(io, self.charset)
                        .await?;
                }
            }
            Err(err) => {
                tracing::warn!(uri, %err, "server info failed");
                let msg = Message::new(codes::ERROR_IO, filter::clip(&err.to_string()), vec![]);
                if self.filter.allows(msg.code) {
                    ServerPacket::Message(msg).write(io, self.charset).await?;
                }
            }
        }
        ServerPacket::Eof.write(io, self.charset).await
    }

    // ── Transcode machinery ──────────────────────────────────────

    async fn run_transcode<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
        main: MainDocument,
        streaming: bool,
    ) -> Result<(), CtipError> {
        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let sink = EngineSink::new(tx, cancel.clone());
        let mut wire = Wire::new(self.config.output.buffer_size);
        let mut pump = Pump {
            pending_main: VecDeque::new(),
            main_eof: !streaming,
            allow_pulls: self.client_resource,
            abort: None,
            cancel,
        };
        let charset = self.charset;

        let engine_result = {
            let engine_fut = self.engine.transcode(main, sink);
            Self::drive(
                &self.filter,
                charset,
                io,
                &mut wire,
                &mut pump,
                &mut rx,
                engine_fut,
            )
            .await?
        };
        Self::drain_commands(&self.filter, charset, io, &mut wire, &mut pump, &mut rx).await?;

        if let Some(mode) = pump.abort {
            return self.reply_abort(io, &mut wire, mode).await;
        }
        match engine_result {
            Ok(()) => {
                if self.continuous {
                    wire.flush(io, charset).await?;
                } else {
                    wire.finish_unit(io, charset).await?;
                }
                ServerPacket::Next.write(io, charset).await
            }
            Err(err) => self.reply_failure(io, &mut wire, err).await,
        }
    }

    async fn run_join<C: ByteChannel>(&mut self, io: &mut ChannelIo<C>) -> Result<(), CtipError> {
        if !self.continuous {
            return Err(CtipError::ProtocolViolation("join without continuous mode"));
        }
        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let sink = EngineSink::new(tx, cancel.clone());
        let mut wire = Wire::new(self.config.output.buffer_size);
        let mut pump = Pump {
            pending_main: VecDeque::new(),
            main_eof: true,
            allow_pulls: self.client_resource,
            abort: None,
            cancel,
        };
        let charset = self.charset;

        let engine_result = {
            let engine_fut = self.engine.join(sink);
            Self::drive(
                &self.filter,
                charset,
                io,
                &mut wire,
                &mut pump,
                &mut rx,
                engine_fut,
            )
            .await?
        };
        Self::drain_commands(&self.filter, charset, io, &mut wire, &mut pump, &mut rx).await?;

        if let Some(mode) = pump.abort {
            return self.reply_abort(io, &mut wire, mode).await;
        }
        match engine_result {
            Ok(()) => {
                // The fold always ends with the result stream's EOF.
                wire.flush(io, charset).await?;
                if wire.unit_open || !wire.eof_sent {
                    ServerPacket::Eof.write(io, charset).await?;
                    wire.unit_open = false;
                    wire.eof_sent = true;
                }
                Ok(())
            }
            Err(err) => self.reply_failure(io, &mut wire, err).await,
        }
    }

    /// Run the engine future and the protocol pump to engine completion.
    async fn drive<C, F>(
        filter: &MessageFilter,
        charset: Charset,
        io: &mut ChannelIo<C>,
        wire: &mut Wire,
        pump: &mut Pump,
        rx: &mut mpsc::Receiver<SinkCommand>,
        engine_fut: F,
    ) -> Result<Result<(), EngineError>, CtipError>
    where
        C: ByteChannel,
        F: Future<Output = Result<(), EngineError>>,
    {
        tokio::pin!(engine_fut);
        let mut rx_open = true;
        loop {
            let step = tokio::select! {
                res = &mut engine_fut => Step::Done(res),
                cmd = rx.recv(), if rx_open => Step::Cmd(cmd),
                ready = io.channel_mut().ready(Interest::READABLE, Duration::ZERO) => {
                    Step::Inbound(ready.map(|_| ()))
                }
            };
            match step {
                Step::Done(res) => return Ok(res),
                Step::Cmd(Some(cmd)) => {
                    Self::handle_command(filter, charset, io, wire, pump, cmd, false).await?;
                }
                Step::Cmd(None) => rx_open = false,
                Step::Inbound(ready) => {
                    ready?;
                    // The readiness bit can be stale; a blocking read here
                    // would stop polling the engine.
                    if !io.confirm_readable()? {
                        continue;
                    }
                    match ClientPacket::read(io, charset).await? {
                        ClientPacket::Abort { mode } => pump.note_abort(mode, wire),
                        ClientPacket::Data(d) => {
                            if !pump.main_eof {
                                pump.pending_main.push_back(d);
                            }
                        }
                        ClientPacket::Eof => pump.main_eof = true,
                        ClientPacket::Close => {
                            return Err(CtipError::ProtocolViolation("close during transcode"));
                        }
                        other => {
                            tracing::warn!(ty = other.type_byte(), "ignoring unexpected packet");
                        }
                    }
                }
            }
        }
    }

    /// Flush commands the engine emitted right before completing.
    async fn drain_commands<C: ByteChannel>(
        filter: &MessageFilter,
        charset: Charset,
        io: &mut ChannelIo<C>,
        wire: &mut Wire,
        pump: &mut Pump,
        rx: &mut mpsc::Receiver<SinkCommand>,
    ) -> Result<(), CtipError> {
        rx.close();
        while let Some(cmd) = rx.recv().await {
            Self::handle_command(filter, charset, io, wire, pump, cmd, true).await?;
        }
        Ok(())
    }

    async fn handle_command<C: ByteChannel>(
        filter: &MessageFilter,
        charset: Charset,
        io: &mut ChannelIo<C>,
        wire: &mut Wire,
        pump: &mut Pump,
        cmd: SinkCommand,
        drain_only: bool,
    ) -> Result<(), CtipError> {
        match cmd {
            SinkCommand::StartUnit(meta) => wire.start_unit(io, charset, meta).await,
            SinkCommand::AddBlock => wire.structural(io, charset, ServerPacket::AddBlock).await,
            SinkCommand::InsertBlockBefore { anchor } => {
                wire.structural(io, charset, ServerPacket::InsertBlock { anchor })
                    .await
            }
            SinkCommand::CloseBlock { anchor } => {
                wire.structural(io, charset, ServerPacket::CloseBlock { anchor })
                    .await
            }
            SinkCommand::Write { id, data } => wire.write(io, charset, id, data).await,
            SinkCommand::FinishUnit => wire.finish_unit(io, charset).await,
            SinkCommand::Message(msg) => {
                if !filter.allows(msg.code) {
                    return Ok(());
                }
                let msg = Message {
                    code: msg.code,
                    text: filter::clip(&msg.text),
                    args: msg.args.iter().map(|a| filter::clip(a)).collect(),
                };
                ServerPacket::Message(msg).write(io, charset).await
            }
            SinkCommand::MainLength(n) => {
                wire.pending_length = Some(n);
                Ok(())
            }
            SinkCommand::MainRead(n) => {
                wire.pending_read = Some(n);
                Ok(())
            }
            SinkCommand::PullMain(reply) => {
                if let Some(chunk) = pump.pending_main.pop_front() {
                    let _ = reply.send(Some(chunk));
                    return Ok(());
                }
                if drain_only || pump.main_eof || pump.abort.is_some() {
                    let _ = reply.send(None);
                    return Ok(());
                }
                loop {
                    match ClientPacket::read(io, charset).await? {
                        ClientPacket::Data(d) => {
                            let _ = reply.send(Some(d));
                            return Ok(());
                        }
                        ClientPacket::Eof => {
                            pump.main_eof = true;
                            let _ = reply.send(None);
                            return Ok(());
                        }
                        ClientPacket::Abort { mode } => {
                            pump.note_abort(mode, wire);
                            let _ = reply.send(None);
                            return Ok(());
                        }
                        ClientPacket::Close => {
                            return Err(CtipError::ProtocolViolation("close during transcode"));
                        }
                        other => {
                            tracing::warn!(ty = other.type_byte(), "ignoring unexpected packet");
                        }
                    }
                }
            }
            SinkCommand::NeedResource { uri, reply } => {
                if drain_only || pump.abort.is_some() || !pump.allow_pulls {
                    let _ = reply.send(None);
                    return Ok(());
                }
                // Output buffered so far goes out ahead of the pull.
                wire.flush(io, charset).await?;
                ServerPacket::ResourceRequest { uri }.write(io, charset).await?;
                loop {
                    match ClientPacket::read(io, charset).await? {
                        ClientPacket::StartResource(meta) => {
                            // The client writes the reply contiguously; the
                            // paused upload cannot interleave here.
                            let data = read_payload(io, charset).await?;
                            let _ = reply.send(Some(ClientResource { meta, data }));
                            return Ok(());
                        }
                        ClientPacket::MissingResource { uri } => {
                            tracing::debug!(%uri, "client missing resource");
                            let _ = reply.send(None);
                            return Ok(());
                        }
                        // Upload frames already in flight before the client
                        // saw the pull.
                        ClientPacket::Data(d) => {
                            if !pump.main_eof {
                                pump.pending_main.push_back(d);
                            }
                        }
                        ClientPacket::Eof => pump.main_eof = true,
                        ClientPacket::Abort { mode } => {
                            pump.note_abort(mode, wire);
                            let _ = reply.send(None);
                            return Ok(());
                        }
                        ClientPacket::Close => {
                            return Err(CtipError::ProtocolViolation("close during transcode"));
                        }
                        other => {
                            tracing::warn!(ty = other.type_byte(), "ignoring unexpected packet");
                        }
                    }
                }
            }
        }
    }

    async fn reply_abort<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
        wire: &mut Wire,
        mode: AbortMode,
    ) -> Result<(), CtipError> {
        match mode {
            AbortMode::Graceful => wire.finish_unit(io, self.charset).await?,
            AbortMode::Forced => wire.discard(),
        }
        ServerPacket::Abort {
            mode,
            code: codes::INFO_ABORT,
            text: "transcode aborted on client request".to_string(),
            args: vec![],
        }
        .write(io, self.charset)
        .await
    }

    async fn reply_failure<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
        wire: &mut Wire,
        err: EngineError,
    ) -> Result<(), CtipError> {
        tracing::error!(%err, "engine failed");
        let code = match &err {
            EngineError::Failed { code, .. } => *code,
            EngineError::ResourceNotFound(_) | EngineError::Io(_) => codes::ERROR_IO,
            _ => codes::FATAL_UNEXPECTED,
        };
        wire.discard();
        ServerPacket::Abort {
            mode: AbortMode::Forced,
            code,
            text: filter::clip(&err.to_string()),
            args: vec![],
        }
        .write(io, self.charset)
        .await
    }
}

enum Step {
    Done(Result<(), EngineError>),
    Cmd(Option<SinkCommand>),
    Inbound(Result<(), CtipError>),
}

/// Client-stream state while an engine operation is in flight.
struct Pump {
    /// Main-document frames read while answering something else.
    pending_main: VecDeque<Bytes>,
    main_eof: bool,
    /// Whether the client opted into resource pulls (CLIENT_RESOURCE).
    allow_pulls: bool,
    abort: Option<AbortMode>,
    cancel: CancellationToken,
}

impl Pump {
    fn note_abort(&mut self, mode: AbortMode, wire: &mut Wire) {
        if self.abort.is_none() {
            tracing::debug!(?mode, "client abort");
            self.abort = Some(mode);
            self.cancel.cancel();
            if mode == AbortMode::Forced {
                wire.discard();
            }
        }
    }
}

/// Outbound block coalescing.
///
/// Consecutive writes to the same open block batch into one BLOCK_DATA
/// frame, flushed on id change, buffer-full, structural ops, or unit
/// finish. Progress values coalesce to the latest and ride out just before
/// the next flush.
struct Wire {
    buffer_size: usize,
    open_id: Option<i32>,
    buf: BytesMut,
    pending_length: Option<i64>,
    pending_read: Option<i64>,
    unit_open: bool,
    eof_sent: bool,
}

impl Wire {
    fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            open_id: None,
            buf: BytesMut::new(),
            pending_length: None,
            pending_read: None,
            unit_open: false,
            eof_sent: false,
        }
    }

    async fn start_unit<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
        charset: Charset,
        meta: MetaSource,
    ) -> Result<(), CtipError> {
        self.flush(io, charset).await?;
        ServerPacket::StartData(meta).write(io, charset).await?;
        self.unit_open = true;
        self.open_id = None;
        Ok(())
    }

    async fn structural<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
        charset: Charset,
        packet: ServerPacket,
    ) -> Result<(), CtipError> {
        self.flush(io, charset).await?;
        packet.write(io, charset).await
    }

    async fn write<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
        charset: Charset,
        id: i32,
        data: Bytes,
    ) -> Result<(), CtipError> {
        if self.open_id != Some(id) {
            self.flush(io, charset).await?;
            self.open_id = Some(id);
        }
        self.buf.extend_from_slice(&data);
        if self.buf.len() >= self.buffer_size {
            self.flush(io, charset).await?;
            self.open_id = Some(id);
        }
        Ok(())
    }

    async fn finish_unit<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
        charset: Charset,
    ) -> Result<(), CtipError> {
        self.flush(io, charset).await?;
        if self.unit_open {
            ServerPacket::Eof.write(io, charset).await?;
            self.unit_open = false;
            self.eof_sent = true;
        }
        Ok(())
    }

    async fn flush<C: ByteChannel>(
        &mut self,
        io: &mut ChannelIo<C>,
        charset: Charset,
    ) -> Result<(), CtipError> {
        if let Some(n) = self.pending_length.take() {
            ServerPacket::MainLength(n).write(io, charset).await?;
        }
        if let Some(n) = self.pending_read.take() {
            ServerPacket::MainRead(n).write(io, charset).await?;
        }
        if !self.buf.is_empty() {
            let id = self.open_id.unwrap_or(0);
            let data = self.buf.split().freeze();
            ServerPacket::BlockData { id, data }.write(io, charset).await?;
        }
        self.open_id = None;
        Ok(())
    }

    /// Forced abort: buffered-but-unflushed output is dropped.
    fn discard(&mut self) {
        self.buf.clear();
        self.open_id = None;
        self.pending_length = None;
        self.pending_read = None;
    }
}

async fn read_payload<C: ByteChannel>(
    io: &mut ChannelIo<C>,
    charset: Charset,
) -> Result<Bytes, CtipError> {
    let mut buf = BytesMut::new();
    loop {
        match ClientPacket::read(io, charset).await? {
            ClientPacket::Data(d) => buf.extend_from_slice(&d),
            ClientPacket::Eof => return Ok(buf.freeze()),
            _ => {
                return Err(CtipError::ProtocolViolation(
                    "unexpected packet in payload stream",
                ));
            }
        }
    }
}

fn parse_auth(line: &str, peer: SocketAddr) -> Result<AuthProps, CtipError> {
    let mut props = AuthProps {
        peer: Some(peer),
        ..AuthProps::default()
    };
    if let Some(rest) = line.strip_prefix("PLAIN: ") {
        let mut parts = rest.splitn(2, ' ');
        props.user = parts.next().map(str::to_string);
        props.password = parts.next().map(str::to_string);
        Ok(props)
    } else if let Some(rest) = line.strip_prefix("OPTIONS: ") {
        for pair in rest.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                props.options.insert(key.to_string(), value.to_string());
            }
        }
        props.user = props.options.get("user").cloned();
        props.password = props.options.get("password").cloned();
        Ok(props)
    } else {
        Err(CtipError::ProtocolViolation("malformed auth line"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn plain_auth_line() {
        let props = parse_auth("PLAIN: alice s3cret", peer()).unwrap();
        assert_eq!(props.user.as_deref(), Some("alice"));
        assert_eq!(props.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn plain_password_may_contain_spaces() {
        let props = parse_auth("PLAIN: alice pass with spaces", peer()).unwrap();
        assert_eq!(props.password.as_deref(), Some("pass with spaces"));
    }

    #[test]
    fn options_auth_line() {
        let props = parse_auth("OPTIONS: user=bob&password=pw&realm=lab", peer()).unwrap();
        assert_eq!(props.user.as_deref(), Some("bob"));
        assert_eq!(props.password.as_deref(), Some("pw"));
        assert_eq!(props.options.get("realm").map(String::as_str), Some("lab"));
    }

    #[test]
    fn garbage_auth_line_is_rejected() {
        assert!(parse_auth("BASIC am9l", peer()).is_err());
    }
}
