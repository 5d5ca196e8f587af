//! Readiness-multiplexed byte transport.
//!
//! Every read and write goes through one primitive: wait for the channel to
//! become ready for an interest set, then perform a non-blocking operation
//! and loop. A configurable deadline arms each wait; a deadline of
//! `Duration::ZERO` waits forever. This keeps plain TCP and the TLS adapter
//! behind the same trait and lets the client block on "readable OR writable"
//! while a document upload is in flight.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, Interest, Ready};
use tokio::net::TcpStream;

use crate::charset::Charset;
use crate::error::CtipError;

/// Longest line accepted by [`ChannelIo::read_line`].
const MAX_LINE: usize = 8 * 1024;

/// A duplex byte channel with a readiness API.
///
/// `try_read` and `try_write` are non-blocking and return
/// [`io::ErrorKind::WouldBlock`] when the channel is not ready; callers arm
/// a [`ready`](Self::ready) wait between attempts.
#[async_trait]
pub trait ByteChannel: Send {
    /// Wait until the channel is ready for `interest`, at most `deadline`
    /// (`Duration::ZERO` waits forever).
    async fn ready(&mut self, interest: Interest, deadline: Duration) -> Result<Ready, CtipError>;

    /// Non-blocking read. `Ok(0)` means the peer closed the stream.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write of as many bytes as the channel accepts.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Orderly outbound close.
    async fn shutdown(&mut self) -> Result<(), CtipError>;
}

#[async_trait]
impl ByteChannel for TcpStream {
    async fn ready(&mut self, interest: Interest, deadline: Duration) -> Result<Ready, CtipError> {
        let wait = TcpStream::ready(&*self, interest);
        if deadline.is_zero() {
            Ok(wait.await?)
        } else {
            match tokio::time::timeout(deadline, wait).await {
                Ok(ready) => Ok(ready?),
                Err(_) => Err(CtipError::Timeout(deadline)),
            }
        }
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    async fn shutdown(&mut self) -> Result<(), CtipError> {
        AsyncWriteExt::shutdown(self).await?;
        Ok(())
    }
}

#[async_trait]
impl ByteChannel for Box<dyn ByteChannel> {
    async fn ready(&mut self, interest: Interest, deadline: Duration) -> Result<Ready, CtipError> {
        (**self).ready(interest, deadline).await
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_write(buf)
    }

    async fn shutdown(&mut self) -> Result<(), CtipError> {
        (**self).shutdown().await
    }
}

/// Deadline-armed exact-count I/O over a [`ByteChannel`].
pub struct ChannelIo<C: ByteChannel> {
    channel: C,
    timeout: Duration,
    /// Byte consumed while confirming readiness, handed back to the next read.
    unread: Option<u8>,
}

impl<C: ByteChannel> ChannelIo<C> {
    /// Wrap a channel. `timeout` arms every readiness wait;
    /// `Duration::ZERO` waits forever.
    pub fn new(channel: C, timeout: Duration) -> Self {
        Self {
            channel,
            timeout,
            unread: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Wait until the channel is readable or writable. Used by the client
    /// to interleave inbound dispatch with an in-flight upload.
    pub async fn ready_rw(&mut self) -> Result<Ready, CtipError> {
        self.channel
            .ready(Interest::READABLE | Interest::WRITABLE, self.timeout)
            .await
    }

    /// One non-blocking write attempt. Pair with [`ready_rw`](Self::ready_rw).
    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.channel.try_write(buf)
    }

    /// Confirm a readable readiness bit with a non-blocking read.
    ///
    /// Readiness is a hint: a wait satisfied by a stale cached bit (a
    /// previous read that never hit `WouldBlock`) can report readable with
    /// nothing on the wire. Returns `true` when a byte is actually
    /// available; it is buffered and handed back to the next read.
    pub fn confirm_readable(&mut self) -> Result<bool, CtipError> {
        if self.unread.is_some() {
            return Ok(true);
        }
        let mut b = [0u8; 1];
        match self.channel.try_read(&mut b) {
            Ok(0) => Err(CtipError::UnexpectedEof),
            Ok(_) => {
                self.unread = Some(b[0]);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Fill `buf` completely, re-arming one readiness wait per iteration.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CtipError> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut filled = 0;
        if let Some(b) = self.unread.take() {
            buf[0] = b;
            filled = 1;
        }
        while filled < buf.len() {
            self.channel.ready(Interest::READABLE, self.timeout).await?;
            match self.channel.try_read(&mut buf[filled..]) {
                Ok(0) => return Err(CtipError::UnexpectedEof),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Write all of `buf`, re-arming one readiness wait per iteration.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), CtipError> {
        let mut sent = 0;
        while sent < buf.len() {
            self.channel.ready(Interest::WRITABLE, self.timeout).await?;
            match self.channel.try_write(&buf[sent..]) {
                Ok(0) => return Err(CtipError::UnexpectedEof),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn read_u8(&mut self) -> Result<u8, CtipError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).await?;
        Ok(b[0])
    }

    pub async fn read_i16(&mut self) -> Result<i16, CtipError> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b).await?;
        Ok(i16::from_be_bytes(b))
    }

    pub async fn read_i32(&mut self) -> Result<i32, CtipError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b).await?;
        Ok(i32::from_be_bytes(b))
    }

    pub async fn read_i64(&mut self) -> Result<i64, CtipError> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b).await?;
        Ok(i64::from_be_bytes(b))
    }

    /// Read exactly `len` bytes.
    pub async fn read_bytes(&mut self, len: usize) -> Result<Bytes, CtipError> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Read a length-prefixed string in the session charset.
    pub async fn read_string(&mut self, charset: Charset) -> Result<String, CtipError> {
        let len = self.read_i16().await?;
        if len < 0 {
            return Err(CtipError::ProtocolViolation("negative string length"));
        }
        if len == 0 {
            return Ok(String::new());
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf).await?;
        charset.decode(&buf)
    }

    /// Read bytes up to and including `\n`, decoded in `charset` without the
    /// terminator. Used for the connection header and the auth line.
    pub async fn read_line(&mut self, charset: Charset) -> Result<String, CtipError> {
        let mut buf = Vec::new();
        loop {
            let b = self.read_u8().await?;
            if b == b'\n' {
                return charset.decode(&buf);
            }
            buf.push(b);
            if buf.len() > MAX_LINE {
                return Err(CtipError::ProtocolViolation("header line too long"));
            }
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), CtipError> {
        self.channel.shutdown().await
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn exact_reads() {
        let (client, server) = pair().await;
        let mut io = ChannelIo::new(client, Duration::from_secs(5));

        let mut server = server;
        AsyncWriteExt::write_all(&mut server, &[0x2A])
            .await
            .unwrap();
        AsyncWriteExt::write_all(&mut server, &0x1234_i16.to_be_bytes())
            .await
            .unwrap();
        AsyncWriteExt::write_all(&mut server, &(-7_i32).to_be_bytes())
            .await
            .unwrap();
        AsyncWriteExt::write_all(&mut server, &0x0102_0304_0506_0708_i64.to_be_bytes())
            .await
            .unwrap();

        assert_eq!(io.read_u8().await.unwrap(), 0x2A);
        assert_eq!(io.read_i16().await.unwrap(), 0x1234);
        assert_eq!(io.read_i32().await.unwrap(), -7);
        assert_eq!(io.read_i64().await.unwrap(), 0x0102_0304_0506_0708);
    }

    #[tokio::test]
    async fn string_and_line() {
        let (client, mut server) = pair().await;
        let mut io = ChannelIo::new(client, Duration::from_secs(5));

        let body = "héllo".as_bytes();
        AsyncWriteExt::write_all(&mut server, &(body.len() as i16).to_be_bytes())
            .await
            .unwrap();
        AsyncWriteExt::write_all(&mut server, body).await.unwrap();
        AsyncWriteExt::write_all(&mut server, &0_i16.to_be_bytes())
            .await
            .unwrap();
        AsyncWriteExt::write_all(&mut server, b"CTIP/2.0 UTF-8\n")
            .await
            .unwrap();

        assert_eq!(io.read_string(Charset::Utf8).await.unwrap(), "héllo");
        assert_eq!(io.read_string(Charset::Utf8).await.unwrap(), "");
        assert_eq!(
            io.read_line(Charset::Latin1).await.unwrap(),
            "CTIP/2.0 UTF-8"
        );
    }

    #[tokio::test]
    async fn write_all_drains() {
        let (client, mut server) = pair().await;
        let mut io = ChannelIo::new(client, Duration::from_secs(5));

        let payload = vec![0xAB_u8; 256 * 1024];
        let expected = payload.clone();
        let reader = tokio::spawn(async move {
            let mut got = vec![0u8; expected.len()];
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
        });

        io.write_all(&payload).await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn read_times_out_on_idle_peer() {
        let (client, _server) = pair().await;
        let deadline = Duration::from_millis(100);
        let mut io = ChannelIo::new(client, deadline);

        let started = std::time::Instant::now();
        let err = io.read_u8().await.unwrap_err();
        assert!(matches!(err, CtipError::Timeout(_)));
        assert!(started.elapsed() < deadline + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn confirm_readable_peeks_and_hands_the_byte_back() {
        let (client, mut server) = pair().await;
        let mut io = ChannelIo::new(client, Duration::from_secs(5));

        // Nothing on the wire: the check must not block or consume.
        assert!(!io.confirm_readable().unwrap());

        AsyncWriteExt::write_all(&mut server, &0x0102_i16.to_be_bytes())
            .await
            .unwrap();
        server.flush().await.unwrap();

        // Poll until the bytes land; the check buffers exactly one.
        loop {
            if io.confirm_readable().unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(io.confirm_readable().unwrap());

        // The buffered byte leads the next multi-byte read.
        assert_eq!(io.read_i16().await.unwrap(), 0x0102);
        assert!(!io.confirm_readable().unwrap());
    }

    #[tokio::test]
    async fn eof_mid_read() {
        let (client, mut server) = pair().await;
        let mut io = ChannelIo::new(client, Duration::from_secs(5));

        AsyncWriteExt::write_all(&mut server, &[0x00, 0x01])
            .await
            .unwrap();
        drop(server);

        let err = io.read_i32().await.unwrap_err();
        assert!(matches!(err, CtipError::UnexpectedEof));
    }
}
