//! Packet vocabulary and wire codec.
//!
//! Every packet travels as `int32 payloadLength | byte type | body`, all
//! integers big-endian; `payloadLength` counts the body plus the type byte.
//! Strings are framed as `int16 byteLength | bytes` in the session charset,
//! with length 0 for the empty string. The vocabulary is direction-specific:
//! [`ClientPacket`] flows client→server, [`ServerPacket`] server→client.

use bytes::{BufMut, Bytes, BytesMut};

use crate::charset::Charset;
use crate::error::CtipError;
use crate::io::{ByteChannel, ChannelIo};
use crate::message::Message;
use crate::meta::MetaSource;

/// Upper bound on a declared payload length. Anything larger is treated as
/// a garbled frame rather than an allocation request.
pub const MAX_PAYLOAD: i32 = 16 * 1024 * 1024;

/// Wire value of an abort request.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortMode {
    /// Output produced so far remains usable.
    Graceful = 0,
    /// Output must be discarded.
    Forced = 1,
}

impl TryFrom<u8> for AbortMode {
    type Error = CtipError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Graceful),
            1 => Ok(Self::Forced),
            _ => Err(CtipError::ProtocolViolation("unknown abort mode")),
        }
    }
}

// ── Client → Server ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    /// `0x01` — set a processing property before the transcode starts.
    Property { name: String, value: String },
    /// `0x02` — announce the main document, streamed by the client.
    StartMain(MetaSource),
    /// `0x03` — ask the server to fetch the main document itself.
    ServerMain { uri: String },
    /// `0x04` — toggle client-side resource resolution.
    ClientResource { enabled: bool },
    /// `0x05` — toggle continuous (multi-document) mode.
    Continuous { enabled: bool },
    /// `0x11` — a chunk of the payload being streamed.
    Data(Bytes),
    /// `0x21` — announce an auxiliary resource, streamed by the client.
    StartResource(MetaSource),
    /// `0x22` — a requested resource could not be resolved.
    MissingResource { uri: String },
    /// `0x31` — end of the payload being streamed.
    Eof,
    /// `0x32` — abort the in-flight transcode.
    Abort { mode: AbortMode },
    /// `0x33` — fold accumulated continuous results into one.
    Join,
    /// `0x41` — clear session state back to just-authenticated.
    Reset,
    /// `0x42` — orderly session close.
    Close,
    /// `0x51` — request server information.
    ServerInfo { uri: String },
}

impl ClientPacket {
    pub const fn type_byte(&self) -> u8 {
        match self {
            Self::Property { .. } => 0x01,
            Self::StartMain(_) => 0x02,
            Self::ServerMain { .. } => 0x03,
            Self::ClientResource { .. } => 0x04,
            Self::Continuous { .. } => 0x05,
            Self::Data(_) => 0x11,
            Self::StartResource(_) => 0x21,
            Self::MissingResource { .. } => 0x22,
            Self::Eof => 0x31,
            Self::Abort { .. } => 0x32,
            Self::Join => 0x33,
            Self::Reset => 0x41,
            Self::Close => 0x42,
            Self::ServerInfo { .. } => 0x51,
        }
    }

    /// Encode the complete frame, length prefix included.
    pub fn encode(&self, charset: Charset) -> Result<Bytes, CtipError> {
        let mut body = BytesMut::new();
        match self {
            Self::Property { name, value } => {
                put_string(&mut body, name, charset)?;
                put_string(&mut body, value, charset)?;
            }
            Self::StartMain(meta) | Self::StartResource(meta) => {
                put_meta(&mut body, meta, charset)?;
            }
            Self::ServerMain { uri }
            | Self::MissingResource { uri }
            | Self::ServerInfo { uri } => {
                put_string(&mut body, uri, charset)?;
            }
            Self::ClientResource { enabled } | Self::Continuous { enabled } => {
                body.put_u8(*enabled as u8);
            }
            Self::Data(data) => body.put_slice(data),
            Self::Abort { mode } => body.put_u8(*mode as u8),
            Self::Eof | Self::Join | Self::Reset | Self::Close => {}
        }
        seal(self.type_byte(), body)
    }

    /// Write the frame through the channel.
    pub async fn write<C: ByteChannel>(
        &self,
        io: &mut ChannelIo<C>,
        charset: Charset,
    ) -> Result<(), CtipError> {
        io.write_all(&self.encode(charset)?).await
    }

    /// Read one complete frame from the channel.
    pub async fn read<C: ByteChannel>(
        io: &mut ChannelIo<C>,
        charset: Charset,
    ) -> Result<Self, CtipError> {
        let (ty, body) = read_frame(io).await?;
        Self::decode_body(ty, body, charset)
    }

    fn decode_body(ty: u8, body: Bytes, charset: Charset) -> Result<Self, CtipError> {
        let mut cur = BodyCursor::new(body);
        let packet = match ty {
            0x01 => Self::Property {
                name: cur.string(charset)?,
                value: cur.string(charset)?,
            },
            0x02 => Self::StartMain(cur.meta(charset)?),
            0x03 => Self::ServerMain {
                uri: cur.string(charset)?,
            },
            0x04 => Self::ClientResource {
                enabled: cur.u8()? != 0,
            },
            0x05 => Self::Continuous {
                enabled: cur.u8()? != 0,
            },
            0x11 => Self::Data(cur.rest()),
            0x21 => Self::StartResource(cur.meta(charset)?),
            0x22 => Self::MissingResource {
                uri: cur.string(charset)?,
            },
            0x31 => Self::Eof,
            0x32 => Self::Abort {
                mode: AbortMode::try_from(cur.u8()?)?,
            },
            0x33 => Self::Join,
            0x41 => Self::Reset,
            0x42 => Self::Close,
            0x51 => Self::ServerInfo {
                uri: cur.string(charset)?,
            },
            value => {
                return Err(CtipError::UnknownPacket {
                    direction: "client",
                    value,
                });
            }
        };
        cur.finish()?;
        Ok(packet)
    }
}

// ── Server → Client ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    /// `0x01` — open a new result unit.
    StartData(MetaSource),
    /// `0x11` — bytes for an open block.
    BlockData { id: i32, data: Bytes },
    /// `0x12` — open a new block adjacent to the cursor.
    AddBlock,
    /// `0x13` — open a new block spliced before `anchor`.
    InsertBlock { anchor: i32 },
    /// `0x14` — advisory message.
    Message(Message),
    /// `0x15` — total main-document length became known.
    MainLength(i64),
    /// `0x16` — main-document bytes consumed so far.
    MainRead(i64),
    /// `0x17` — bytes for the implicit block 0.
    Data(Bytes),
    /// `0x18` — no further writes to `anchor`.
    CloseBlock { anchor: i32 },
    /// `0x21` — the engine needs a resource only the client can supply.
    ResourceRequest { uri: String },
    /// `0x31` — end of the current result unit / reply stream.
    Eof,
    /// `0x32` — the transcode was aborted.
    Abort {
        mode: AbortMode,
        code: u16,
        text: String,
        args: Vec<String>,
    },
    /// `0x33` — the transcode finished; more may follow in continuous mode.
    Next,
}

impl ServerPacket {
    pub const fn type_byte(&self) -> u8 {
        match self {
            Self::StartData(_) => 0x01,
            Self::BlockData { .. } => 0x11,
            Self::AddBlock => 0x12,
            Self::InsertBlock { .. } => 0x13,
            Self::Message(_) => 0x14,
            Self::MainLength(_) => 0x15,
            Self::MainRead(_) => 0x16,
            Self::Data(_) => 0x17,
            Self::CloseBlock { .. } => 0x18,
            Self::ResourceRequest { .. } => 0x21,
            Self::Eof => 0x31,
            Self::Abort { .. } => 0x32,
            Self::Next => 0x33,
        }
    }

    /// Encode the complete frame, length prefix included.
    pub fn encode(&self, charset: Charset) -> Result<Bytes, CtipError> {
        let mut body = BytesMut::new();
        match self {
            Self::StartData(meta) => put_meta(&mut body, meta, charset)?,
            Self::BlockData { id, data } => {
                body.put_i32(*id);
                body.put_slice(data);
            }
            Self::InsertBlock { anchor } | Self::CloseBlock { anchor } => {
                body.put_i32(*anchor);
            }
            Self::Message(msg) => {
                body.put_i16(msg.code as i16);
                put_string(&mut body, &msg.text, charset)?;
                for arg in &msg.args {
                    put_string(&mut body, arg, charset)?;
                }
            }
            Self::MainLength(n) | Self::MainRead(n) => body.put_i64(*n),
            Self::Data(data) => body.put_slice(data),
            Self::ResourceRequest { uri } => put_string(&mut body, uri, charset)?,
            Self::Abort {
                mode,
                code,
                text,
                args,
            } => {
                body.put_u8(*mode as u8);
                body.put_i16(*code as i16);
                put_string(&mut body, text, charset)?;
                for arg in args {
                    put_string(&mut body, arg, charset)?;
                }
            }
            Self::AddBlock | Self::Eof | Self::Next => {}
        }
        seal(self.type_byte(), body)
    }

    /// Write the frame through the channel.
    pub async fn write<C: ByteChannel>(
        &self,
        io: &mut ChannelIo<C>,
        charset: Charset,
    ) -> Result<(), CtipError> {
        io.write_all(&self.encode(charset)?).await
    }

    /// Read one complete frame from the channel.
    pub async fn read<C: ByteChannel>(
        io: &mut ChannelIo<C>,
        charset: Charset,
    ) -> Result<Self, CtipError> {
        let (ty, body) = read_frame(io).await?;
        Self::decode_body(ty, body, charset)
    }

    fn decode_body(ty: u8, body: Bytes, charset: Charset) -> Result<Self, CtipError> {
        let mut cur = BodyCursor::new(body);
        let packet = match ty {
            0x01 => Self::StartData(cur.meta(charset)?),
            0x11 => Self::BlockData {
                id: cur.i32()?,
                data: cur.rest(),
            },
            0x12 => Self::AddBlock,
            0x13 => Self::InsertBlock { anchor: cur.i32()? },
            0x14 => {
                let code = cur.i16()? as u16;
                let text = cur.string(charset)?;
                let mut args = Vec::new();
                while !cur.is_empty() {
                    args.push(cur.string(charset)?);
                }
                Self::Message(Message::new(code, text, args))
            }
            0x15 => Self::MainLength(cur.i64()?),
            0x16 => Self::MainRead(cur.i64()?),
            0x17 => Self::Data(cur.rest()),
            0x18 => Self::CloseBlock { anchor: cur.i32()? },
            0x21 => Self::ResourceRequest {
                uri: cur.string(charset)?,
            },
            0x31 => Self::Eof,
            0x32 => {
                let mode = AbortMode::try_from(cur.u8()?)?;
                let code = cur.i16()? as u16;
                let text = cur.string(charset)?;
                let mut args = Vec::new();
                while !cur.is_empty() {
                    args.push(cur.string(charset)?);
                }
                Self::Abort {
                    mode,
                    code,
                    text,
                    args,
                }
            }
            0x33 => Self::Next,
            value => {
                return Err(CtipError::UnknownPacket {
                    direction: "server",
                    value,
                });
            }
        };
        cur.finish()?;
        Ok(packet)
    }
}

// ── Frame helpers ────────────────────────────────────────────────────

/// Prefix a finished body with its length and type byte.
fn seal(ty: u8, body: BytesMut) -> Result<Bytes, CtipError> {
    let len = body.len() + 1;
    if len > MAX_PAYLOAD as usize {
        return Err(CtipError::InvalidFrameLength(len as i64));
    }
    let mut frame = BytesMut::with_capacity(4 + len);
    frame.put_i32(len as i32);
    frame.put_u8(ty);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

async fn read_frame<C: ByteChannel>(io: &mut ChannelIo<C>) -> Result<(u8, Bytes), CtipError> {
    let len = io.read_i32().await?;
    if !(1..=MAX_PAYLOAD).contains(&len) {
        return Err(CtipError::InvalidFrameLength(len as i64));
    }
    let frame = io.read_bytes(len as usize).await?;
    Ok((frame[0], frame.slice(1..)))
}

fn put_string(buf: &mut BytesMut, s: &str, charset: Charset) -> Result<(), CtipError> {
    let bytes = charset.encode(s)?;
    if bytes.len() > i16::MAX as usize {
        return Err(CtipError::Encoding(format!(
            "string of {} bytes exceeds the 2-byte length prefix",
            bytes.len()
        )));
    }
    buf.put_i16(bytes.len() as i16);
    buf.put_slice(&bytes);
    Ok(())
}

fn put_meta(buf: &mut BytesMut, meta: &MetaSource, charset: Charset) -> Result<(), CtipError> {
    put_string(buf, &meta.uri, charset)?;
    put_string(buf, meta.mime_type.as_deref().unwrap_or(""), charset)?;
    put_string(buf, meta.encoding.as_deref().unwrap_or(""), charset)?;
    buf.put_i64(meta.length.map_or(-1, |n| n as i64));
    Ok(())
}

/// Bounds-checked reader over one decoded packet body.
struct BodyCursor {
    buf: Bytes,
}

impl BodyCursor {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<Bytes, CtipError> {
        if self.buf.len() < n {
            return Err(CtipError::ProtocolViolation("truncated packet body"));
        }
        Ok(self.buf.split_to(n))
    }

    fn u8(&mut self) -> Result<u8, CtipError> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, CtipError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, CtipError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, CtipError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self, charset: Charset) -> Result<String, CtipError> {
        let len = self.i16()?;
        if len < 0 {
            return Err(CtipError::ProtocolViolation("negative string length"));
        }
        let bytes = self.take(len as usize)?;
        charset.decode(&bytes)
    }

    fn meta(&mut self, charset: Charset) -> Result<MetaSource, CtipError> {
        let uri = self.string(charset)?;
        let mime_type = self.string(charset)?;
        let encoding = self.string(charset)?;
        let length = self.i64()?;
        Ok(MetaSource {
            uri,
            mime_type: (!mime_type.is_empty()).then_some(mime_type),
            encoding: (!encoding.is_empty()).then_some(encoding),
            length: (length >= 0).then_some(length as u64),
        })
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }

    fn finish(self) -> Result<(), CtipError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CtipError::ProtocolViolation("trailing bytes in packet body"))
        }
    }
}
