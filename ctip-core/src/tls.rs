//! TLS adapter over the rustls record engine.
//!
//! [`TlsChannel`] drives a `rustls::Connection` directly against a
//! non-blocking `TcpStream` instead of using a ready-made async wrapper:
//! `read_tls` + `process_new_packets` unwrap inbound records into plaintext,
//! `writer()` + `write_tls` wrap outbound plaintext into records. The channel
//! keeps the same readiness contract as plain TCP, so the frame transport
//! above it is unchanged.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncWriteExt, Interest, Ready};
use tokio::net::TcpStream;

use crate::error::CtipError;
use crate::io::ByteChannel;

/// How a client channel validates the server certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Accept any certificate without validation (the default; sessions are
    /// typically confined to trusted networks).
    #[default]
    AcceptAny,
    /// Validate against the bundled web PKI roots.
    WebPki,
}

impl TrustPolicy {
    /// Build a rustls client configuration for this policy.
    pub fn client_config(self) -> Result<rustls::ClientConfig, rustls::Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;
        let config = match self {
            Self::AcceptAny => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyVerifier { provider }))
                .with_no_client_auth(),
            Self::WebPki => {
                let roots = rustls::RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                };
                builder.with_root_certificates(roots).with_no_client_auth()
            }
        };
        Ok(config)
    }
}

/// A [`ByteChannel`] speaking TLS over a `TcpStream`.
pub struct TlsChannel {
    stream: TcpStream,
    tls: rustls::Connection,
}

impl TlsChannel {
    /// Open a client-side channel and run the handshake to completion.
    pub async fn connect(
        stream: TcpStream,
        host: &str,
        policy: TrustPolicy,
        deadline: Duration,
    ) -> Result<Self, CtipError> {
        let config = policy.client_config()?;
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| CtipError::InvalidUri(host.to_string()))?;
        let conn = rustls::ClientConnection::new(Arc::new(config), name)?;
        let mut channel = Self {
            stream,
            tls: rustls::Connection::Client(conn),
        };
        channel.handshake(deadline).await?;
        tracing::debug!(host, ?policy, "tls session established");
        Ok(channel)
    }

    /// Open a server-side channel with a caller-supplied certificate
    /// configuration and run the handshake to completion.
    pub async fn accept(
        stream: TcpStream,
        config: Arc<rustls::ServerConfig>,
        deadline: Duration,
    ) -> Result<Self, CtipError> {
        let conn = rustls::ServerConnection::new(config)?;
        let mut channel = Self {
            stream,
            tls: rustls::Connection::Server(conn),
        };
        channel.handshake(deadline).await?;
        tracing::debug!("tls session accepted");
        Ok(channel)
    }

    async fn handshake(&mut self, deadline: Duration) -> Result<(), CtipError> {
        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                self.flush_records(deadline).await?;
                continue;
            }
            if self.tls.wants_read() {
                await_ready(&self.stream, Interest::READABLE, deadline).await?;
                match self.tls.read_tls(&mut ReadAdapter(&self.stream)) {
                    Ok(0) => return Err(CtipError::UnexpectedEof),
                    Ok(_) => {
                        self.tls.process_new_packets()?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        // Trailing handshake records (e.g. the client Finished flight).
        self.flush_records(deadline).await?;
        Ok(())
    }

    /// Drive all pending wrapped records onto the socket.
    async fn flush_records(&mut self, deadline: Duration) -> Result<(), CtipError> {
        while self.tls.wants_write() {
            await_ready(&self.stream, Interest::WRITABLE, deadline).await?;
            match self.tls.write_tls(&mut WriteAdapter(&self.stream)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ByteChannel for TlsChannel {
    async fn ready(&mut self, interest: Interest, deadline: Duration) -> Result<Ready, CtipError> {
        // Unwrapped plaintext already buffered by the engine satisfies a
        // read interest without touching the socket.
        if interest.is_readable() {
            let state = self.tls.process_new_packets()?;
            if state.plaintext_bytes_to_read() > 0 {
                return Ok(Ready::READABLE);
            }
        }
        await_ready(&self.stream, interest, deadline).await
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            // No plaintext buffered: pull more ciphertext and unwrap.
            match self.tls.read_tls(&mut ReadAdapter(&self.stream)) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.tls
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Ciphertext left over from a short socket write goes out before
        // any new plaintext is accepted.
        while self.tls.wants_write() {
            self.tls.write_tls(&mut WriteAdapter(&self.stream))?;
        }
        let n = self.tls.writer().write(buf)?;
        match self.tls.write_tls(&mut WriteAdapter(&self.stream)) {
            Ok(_) => {}
            // The wrapped record stays queued for the next call.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        Ok(n)
    }

    async fn shutdown(&mut self) -> Result<(), CtipError> {
        self.tls.send_close_notify();
        self.flush_records(Duration::from_secs(10)).await?;
        AsyncWriteExt::shutdown(&mut self.stream).await?;
        Ok(())
    }
}

async fn await_ready(
    stream: &TcpStream,
    interest: Interest,
    deadline: Duration,
) -> Result<Ready, CtipError> {
    let wait = stream.ready(interest);
    if deadline.is_zero() {
        Ok(wait.await?)
    } else {
        match tokio::time::timeout(deadline, wait).await {
            Ok(ready) => Ok(ready?),
            Err(_) => Err(CtipError::Timeout(deadline)),
        }
    }
}

struct ReadAdapter<'a>(&'a TcpStream);

impl Read for ReadAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

struct WriteAdapter<'a>(&'a TcpStream);

impl Write for WriteAdapter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Trusts every presented certificate. Handshake signatures are still
    /// verified so an active attacker cannot splice records.
    #[derive(Debug)]
    pub(super) struct AcceptAnyVerifier {
        pub(super) provider: Arc<CryptoProvider>,
    }

    impl ServerCertVerifier for AcceptAnyVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::net::{TcpListener, TcpStream};

    use crate::charset::Charset;
    use crate::io::ChannelIo;
    use crate::packet::{ClientPacket, ServerPacket};

    // Self-signed CN=localhost pair, for loopback handshakes only.
    const CERT_DER: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/cert.der"));
    const KEY_DER: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/key.der"));

    fn server_config() -> Arc<rustls::ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(CERT_DER.to_vec())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(KEY_DER.to_vec())),
            )
            .unwrap();
        Arc::new(config)
    }

    #[tokio::test]
    async fn frames_cross_a_tls_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = server_config();
        let deadline = Duration::from_secs(5);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let tls = TlsChannel::accept(stream, config, deadline).await.unwrap();
            let mut io = ChannelIo::new(tls, deadline);
            let got = ClientPacket::read(&mut io, Charset::Utf8).await.unwrap();
            assert_eq!(got, ClientPacket::ServerInfo { uri: "fonts".into() });
            ServerPacket::Data(Bytes::from_static(b"wrapped reply"))
                .write(&mut io, Charset::Utf8)
                .await
                .unwrap();
            ServerPacket::Eof.write(&mut io, Charset::Utf8).await.unwrap();
            io.shutdown().await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let tls = TlsChannel::connect(stream, "localhost", TrustPolicy::AcceptAny, deadline)
            .await
            .unwrap();
        let mut io = ChannelIo::new(tls, deadline);
        ClientPacket::ServerInfo { uri: "fonts".into() }
            .write(&mut io, Charset::Utf8)
            .await
            .unwrap();
        assert_eq!(
            ServerPacket::read(&mut io, Charset::Utf8).await.unwrap(),
            ServerPacket::Data(Bytes::from_static(b"wrapped reply"))
        );
        assert_eq!(
            ServerPacket::read(&mut io, Charset::Utf8).await.unwrap(),
            ServerPacket::Eof
        );
        server.await.unwrap();
    }

    #[test]
    fn accept_any_config_builds() {
        TrustPolicy::AcceptAny.client_config().unwrap();
    }

    #[test]
    fn webpki_config_builds() {
        TrustPolicy::WebPki.client_config().unwrap();
    }

    #[test]
    fn accept_any_asserts_validity() {
        use rustls::client::danger::ServerCertVerifier;
        use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

        let verifier = danger::AcceptAnyVerifier {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        };
        let cert = CertificateDer::from(vec![0u8; 8]);
        let name = ServerName::try_from("example.invalid").unwrap();
        let now = UnixTime::now();
        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &[], now)
            .is_ok());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }
}
