//! Session tests against a scripted peer on loopback TCP.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ctip_client::{MemorySource, Session, SessionState, Source, SourceResolver};
use ctip_core::{
    AbortMode, AbortState, Charset, ChannelIo, ClientPacket, CtipError, MetaSource, ServerPacket,
    SingleResult,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

type StubIo = ChannelIo<TcpStream>;

async fn spawn_stub<F, Fut>(script: F) -> (std::net::SocketAddr, JoinHandle<()>)
where
    F: FnOnce(StubIo) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let io = ChannelIo::new(stream, Duration::from_secs(5));
        script(io).await;
    });
    (addr, handle)
}

async fn accept_auth(io: &mut StubIo, expected_auth: &str, ok: bool) {
    let header = io.read_line(Charset::Latin1).await.unwrap();
    assert_eq!(header, "CTIP/2.0 UTF-8");
    let auth = io.read_line(Charset::Utf8).await.unwrap();
    assert_eq!(auth, expected_auth);
    io.write_all(if ok { b"OK \n" } else { b"NG \n" })
        .await
        .unwrap();
}

async fn read_client(io: &mut StubIo) -> ClientPacket {
    ClientPacket::read(io, Charset::Utf8).await.unwrap()
}

async fn send_server(io: &mut StubIo, packet: ServerPacket) {
    packet.write(io, Charset::Utf8).await.unwrap();
}

fn uri_for(addr: std::net::SocketAddr) -> String {
    format!("ctip://127.0.0.1:{}/?timeout=5000", addr.port())
}

#[tokio::test]
async fn transcode_uri_end_to_end() {
    let (addr, stub) = spawn_stub(|mut io| async move {
        accept_auth(&mut io, "PLAIN: u p", true).await;
        assert_eq!(
            read_client(&mut io).await,
            ClientPacket::Property {
                name: "input.include".into(),
                value: "http://example/**".into(),
            }
        );
        assert_eq!(
            read_client(&mut io).await,
            ClientPacket::ServerMain {
                uri: "http://example/index.html".into(),
            }
        );
        send_server(
            &mut io,
            ServerPacket::StartData(MetaSource::new(
                ".",
                Some("application/pdf".into()),
                None,
                Some(100),
            )),
        )
        .await;
        send_server(&mut io, ServerPacket::AddBlock).await;
        send_server(
            &mut io,
            ServerPacket::BlockData {
                id: 0,
                data: Bytes::from_static(b"%PDF-1.4 fake"),
            },
        )
        .await;
        send_server(&mut io, ServerPacket::Eof).await;
        send_server(&mut io, ServerPacket::Next).await;
        assert_eq!(read_client(&mut io).await, ClientPacket::Close);
    })
    .await;

    let mut session = Session::connect(&uri_for(addr), "u", "p").await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    let results = SingleResult::new();
    let out = results.buffer();
    session.set_results(Box::new(results));
    session
        .property("input.include", "http://example/**")
        .await
        .unwrap();
    session
        .transcode_uri("http://example/index.html")
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    session.close().await.unwrap();

    assert_eq!(&out.lock().unwrap()[..], b"%PDF-1.4 fake");
    stub.await.unwrap();
}

#[tokio::test]
async fn wrong_credentials_are_rejected() {
    let (addr, stub) = spawn_stub(|mut io| async move {
        accept_auth(&mut io, "PLAIN: u wrong", false).await;
    })
    .await;

    let err = Session::connect(&uri_for(addr), "u", "wrong")
        .await
        .unwrap_err();
    assert!(matches!(err, CtipError::AuthenticationFailed));
    stub.await.unwrap();
}

#[tokio::test]
async fn garbled_auth_reply_is_a_protocol_violation() {
    let (addr, stub) = spawn_stub(|mut io| async move {
        io.read_line(Charset::Latin1).await.unwrap();
        io.read_line(Charset::Utf8).await.unwrap();
        io.write_all(b"EH?\n").await.unwrap();
    })
    .await;

    let err = Session::connect(&uri_for(addr), "u", "p").await.unwrap_err();
    assert!(matches!(err, CtipError::ProtocolViolation(_)));
    stub.await.unwrap();
}

struct FixedResolver;

#[async_trait]
impl SourceResolver for FixedResolver {
    async fn resolve(&mut self, uri: &str) -> Result<Box<dyn Source>, CtipError> {
        if uri.ends_with(".css") {
            Ok(Box::new(MemorySource::new(
                MetaSource::new(uri, Some("text/css".into()), None, None),
                Bytes::from_static(b"body{}"),
            )))
        } else {
            Err(CtipError::ResourceNotFound(uri.to_string()))
        }
    }
}

#[tokio::test]
async fn upload_with_resource_pulls() {
    let (addr, stub) = spawn_stub(|mut io| async move {
        accept_auth(&mut io, "PLAIN: u p", true).await;
        assert_eq!(
            read_client(&mut io).await,
            ClientPacket::ClientResource { enabled: true }
        );
        let ClientPacket::StartMain(meta) = read_client(&mut io).await else {
            panic!("expected START_MAIN");
        };
        assert_eq!(meta.mime_type.as_deref(), Some("text/html"));

        // Demand resources while the upload is still in flight.
        send_server(
            &mut io,
            ServerPacket::ResourceRequest {
                uri: "css/site.css".into(),
            },
        )
        .await;
        send_server(
            &mut io,
            ServerPacket::ResourceRequest {
                uri: "img/logo.png".into(),
            },
        )
        .await;

        let mut upload = Vec::new();
        let mut resource = Vec::new();
        let mut pulls = Vec::new();
        let mut in_resource = false;
        let mut upload_done = false;
        let mut pulls_done = 0;
        while !(upload_done && pulls_done == 2) {
            match read_client(&mut io).await {
                ClientPacket::StartResource(meta) => {
                    pulls.push(meta.uri.clone());
                    in_resource = true;
                }
                ClientPacket::MissingResource { uri } => {
                    pulls.push(uri);
                    pulls_done += 1;
                }
                ClientPacket::Data(d) => {
                    if in_resource {
                        resource.extend_from_slice(&d);
                    } else {
                        upload.extend_from_slice(&d);
                    }
                }
                ClientPacket::Eof => {
                    if in_resource {
                        in_resource = false;
                        pulls_done += 1;
                    } else {
                        upload_done = true;
                    }
                }
                other => panic!("unexpected packet {other:?}"),
            }
        }
        assert_eq!(upload.len(), 40_000);
        assert_eq!(&resource[..], b"body{}");
        // Answered in request order.
        assert_eq!(pulls, vec!["css/site.css", "img/logo.png"]);

        send_server(
            &mut io,
            ServerPacket::StartData(MetaSource::new(".", Some("application/pdf".into()), None, None)),
        )
        .await;
        send_server(&mut io, ServerPacket::Data(Bytes::from_static(b"out"))).await;
        send_server(&mut io, ServerPacket::Eof).await;
        send_server(&mut io, ServerPacket::Next).await;
    })
    .await;

    let mut session = Session::connect(&uri_for(addr), "u", "p").await.unwrap();
    let results = SingleResult::new();
    let out = results.buffer();
    session.set_results(Box::new(results));
    session
        .set_source_resolver(Some(Box::new(FixedResolver)))
        .await
        .unwrap();

    let mut source = MemorySource::new(
        MetaSource::new("doc.html", Some("text/html".into()), None, None),
        vec![b'x'; 40_000],
    );
    session.transcode(&mut source).await.unwrap();

    assert_eq!(&out.lock().unwrap()[..], b"out");
    stub.await.unwrap();
}

#[tokio::test]
async fn server_info_collects_reply() {
    let (addr, stub) = spawn_stub(|mut io| async move {
        accept_auth(&mut io, "PLAIN: u p", true).await;
        assert_eq!(
            read_client(&mut io).await,
            ClientPacket::ServerInfo { uri: ".".into() }
        );
        send_server(&mut io, ServerPacket::Data(Bytes::from_static(b"version="))).await;
        send_server(&mut io, ServerPacket::Data(Bytes::from_static(b"2.0"))).await;
        send_server(&mut io, ServerPacket::Eof).await;
    })
    .await;

    let mut session = Session::connect(&uri_for(addr), "u", "p").await.unwrap();
    let info = session.server_info(".").await.unwrap();
    assert_eq!(&info[..], b"version=2.0");
    stub.await.unwrap();
}

#[tokio::test]
async fn graceful_abort_finalizes_the_sink() {
    let (addr, stub) = spawn_stub(|mut io| async move {
        accept_auth(&mut io, "PLAIN: u p", true).await;
        let ClientPacket::StartMain(_) = read_client(&mut io).await else {
            panic!("expected START_MAIN");
        };
        send_server(
            &mut io,
            ServerPacket::StartData(MetaSource::uri_only(".")),
        )
        .await;
        send_server(&mut io, ServerPacket::Data(Bytes::from_static(b"partial"))).await;
        // Drain until the abort request shows up, then confirm it.
        loop {
            match read_client(&mut io).await {
                ClientPacket::Abort { mode } => {
                    assert_eq!(mode, AbortMode::Graceful);
                    // Consume the trailing EOF so dropping the socket
                    // doesn't RST away the abort reply below.
                    assert_eq!(read_client(&mut io).await, ClientPacket::Eof);
                    break;
                }
                ClientPacket::Data(_) | ClientPacket::Eof => {}
                other => panic!("unexpected packet {other:?}"),
            }
        }
        send_server(
            &mut io,
            ServerPacket::Abort {
                mode: AbortMode::Graceful,
                code: 0x1001,
                text: "aborted".into(),
                args: vec![],
            },
        )
        .await;
    })
    .await;

    let mut session = Session::connect(&uri_for(addr), "u", "p").await.unwrap();
    let results = SingleResult::new();
    let out = results.buffer();
    session.set_results(Box::new(results));

    let handle = session.abort_handle();
    handle.abort(AbortMode::Graceful);

    let mut source = MemorySource::new(MetaSource::uri_only("doc.html"), vec![b'x'; 64 * 1024]);
    let err = session.transcode(&mut source).await.unwrap_err();
    match err {
        CtipError::TranscodeAborted { state, code, .. } => {
            assert_eq!(state, AbortState::PartiallyReadable);
            assert_eq!(code, 0x1001);
        }
        other => panic!("unexpected error {other:?}"),
    }
    // Graceful: the unit collected so far was finalized.
    assert_eq!(&out.lock().unwrap()[..], b"partial");
    assert_eq!(session.state(), SessionState::Ready);
    stub.await.unwrap();
}

#[tokio::test]
async fn idle_server_times_out_reads() {
    let (addr, _stub) = spawn_stub(|mut io| async move {
        accept_auth(&mut io, "PLAIN: u p", true).await;
        // Swallow the request, answer nothing.
        let _ = read_client(&mut io).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    })
    .await;

    let uri = format!("ctip://127.0.0.1:{}/?timeout=200", addr.port());
    let mut session = Session::connect(&uri, "u", "p").await.unwrap();
    session.set_results(Box::new(SingleResult::new()));

    let started = std::time::Instant::now();
    let err = session.transcode_uri("http://example/").await.unwrap_err();
    assert!(matches!(err, CtipError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn upload_proceeds_when_server_stays_silent() {
    // A server that consumes the upload without writing anything back
    // until it has the whole document. The readiness bit cached by the
    // auth exchange must not trick the upload into a blocking read.
    let (addr, stub) = spawn_stub(|mut io| async move {
        accept_auth(&mut io, "PLAIN: u p", true).await;
        let ClientPacket::StartMain(_) = read_client(&mut io).await else {
            panic!("expected START_MAIN");
        };
        let mut upload = Vec::new();
        loop {
            match read_client(&mut io).await {
                ClientPacket::Data(d) => upload.extend_from_slice(&d),
                ClientPacket::Eof => break,
                other => panic!("unexpected packet {other:?}"),
            }
        }
        assert_eq!(upload.len(), 64 * 1024);

        send_server(
            &mut io,
            ServerPacket::StartData(MetaSource::uri_only(".")),
        )
        .await;
        send_server(&mut io, ServerPacket::Data(Bytes::from_static(b"done"))).await;
        send_server(&mut io, ServerPacket::Eof).await;
        send_server(&mut io, ServerPacket::Next).await;
        assert_eq!(read_client(&mut io).await, ClientPacket::Close);
    })
    .await;

    let mut session = Session::connect(&uri_for(addr), "u", "p").await.unwrap();
    let results = SingleResult::new();
    let out = results.buffer();
    session.set_results(Box::new(results));

    let mut source = MemorySource::new(MetaSource::uri_only("doc.html"), vec![b'x'; 64 * 1024]);
    session.transcode(&mut source).await.unwrap();
    assert_eq!(&out.lock().unwrap()[..], b"done");
    session.close().await.unwrap();
    stub.await.unwrap();
}

#[tokio::test]
async fn forced_abort_mid_upload_keeps_the_stream_framed() {
    let (addr, stub) = spawn_stub(|mut io| async move {
        accept_auth(&mut io, "PLAIN: u p", true).await;
        let ClientPacket::StartMain(_) = read_client(&mut io).await else {
            panic!("expected START_MAIN");
        };
        let ClientPacket::Data(_) = read_client(&mut io).await else {
            panic!("expected DATA");
        };
        send_server(
            &mut io,
            ServerPacket::Abort {
                mode: AbortMode::Forced,
                code: 0x3002,
                text: "broken".into(),
                args: vec![],
            },
        )
        .await;
        // Whatever the upload had in flight must still parse as whole
        // frames, right up to the next request on the same connection.
        loop {
            match read_client(&mut io).await {
                ClientPacket::Data(_) | ClientPacket::Eof => {}
                ClientPacket::ServerInfo { uri } => {
                    assert_eq!(uri, ".");
                    break;
                }
                other => panic!("unexpected packet {other:?}"),
            }
        }
        send_server(&mut io, ServerPacket::Data(Bytes::from_static(b"alive"))).await;
        send_server(&mut io, ServerPacket::Eof).await;
        assert_eq!(read_client(&mut io).await, ClientPacket::Close);
    })
    .await;

    let mut session = Session::connect(&uri_for(addr), "u", "p").await.unwrap();
    let results = SingleResult::new();
    let out = results.buffer();
    session.set_results(Box::new(results));

    let mut source = MemorySource::new(MetaSource::uri_only("doc.html"), vec![b'x'; 256 * 1024]);
    let err = session.transcode(&mut source).await.unwrap_err();
    match err {
        CtipError::TranscodeAborted { state, .. } => assert_eq!(state, AbortState::Broken),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(out.lock().unwrap().is_empty());
    assert_eq!(session.state(), SessionState::Ready);

    // The connection survives the abort.
    let info = session.server_info(".").await.unwrap();
    assert_eq!(&info[..], b"alive");
    session.close().await.unwrap();
    stub.await.unwrap();
}

#[tokio::test]
async fn invalid_states_are_rejected() {
    let (addr, stub) = spawn_stub(|mut io| async move {
        accept_auth(&mut io, "PLAIN: u p", true).await;
        assert_eq!(read_client(&mut io).await, ClientPacket::Close);
    })
    .await;

    let mut session = Session::connect(&uri_for(addr), "u", "p").await.unwrap();

    // No results sink configured.
    let err = session.transcode_uri("http://example/").await.unwrap_err();
    assert!(matches!(err, CtipError::InvalidState(_)));

    // Join without continuous mode.
    let err = session.join().await.unwrap_err();
    assert!(matches!(err, CtipError::InvalidState(_)));

    session.close().await.unwrap();
    session.close().await.unwrap();

    let err = session.property("a", "b").await.unwrap_err();
    assert!(matches!(err, CtipError::InvalidState(_)));
    stub.await.unwrap();
}
