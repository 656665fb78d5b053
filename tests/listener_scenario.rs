//! End-to-end listener scenarios over an in-memory socket.
//!
//! A duplex-backed connector hands the server half of every dialed
//! connection to the test, which then plays the server: it delivers the
//! cipher key, pushes encrypted batches, and drops or kicks the client.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{AesGcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use zwire::events::EventStream;
use zwire::retry::RetryError;
use zwire::session::RetryRule;
use zwire::{
    Connector, Frame, Listener, ListenerError, ListenerPhase, Session, SocketSettings, ThreadType,
    Transport, TransportError, TransportEvents,
};

type ServerSide = WebSocketStream<DuplexStream>;

const UID: &str = "777";
const CIPHER_KEY: [u8; 32] = [5; 32];
const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug)]
struct DuplexConnector {
    servers: mpsc::UnboundedSender<ServerSide>,
    dials: Mutex<Vec<(String, Vec<(String, String)>)>>,
    refuse_from: AtomicUsize,
}

impl DuplexConnector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            servers,
            dials: Mutex::new(Vec::new()),
            refuse_from: AtomicUsize::new(usize::MAX),
        });
        (connector, rx)
    }

    /// Fail every dial from the `n`th (zero-based) onwards.
    fn refuse_from(&self, n: usize) {
        self.refuse_from.store(n, Ordering::SeqCst);
    }

    fn dialed_urls(&self) -> Vec<String> {
        self.dials.lock().unwrap().iter().map(|(url, _)| url.clone()).collect()
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn dial(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<(Transport, TransportEvents), TransportError> {
        let index = {
            let mut dials = self.dials.lock().unwrap();
            dials.push((url.to_string(), headers.to_vec()));
            dials.len() - 1
        };
        if index >= self.refuse_from.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client, server) = tokio::join!(
            WebSocketStream::from_raw_socket(client_io, Role::Client, None),
            WebSocketStream::from_raw_socket(server_io, Role::Server, None),
        );
        self.servers.send(server).map_err(|_closed| TransportError::Closed)?;
        Ok(Transport::from_stream(client))
    }
}

fn session(settings: SocketSettings, self_listen: bool) -> Session {
    Session::builder()
        .uid(UID)
        .imei("imei-test")
        .secret_key(BASE64.encode([3u8; 16]))
        .user_agent("zwire-test")
        .api(30, 665)
        .cookie("zpw_sek=abc; Path=/", "https://chat.zalo.me")
        .endpoints(["wss://a.example.test/ws", "wss://b.example.test/ws"])
        .settings(settings)
        .self_listen(self_listen)
        .build()
        .unwrap()
}

fn frame(header: (u8, u16, u8), body: &Value) -> WsMessage {
    let (version, command, subcommand) = header;
    WsMessage::Binary(Frame::json(version, command, subcommand, body).unwrap().encode())
}

fn cipher_key_frame() -> WsMessage {
    frame(
        (1, 1, 1),
        &json!({"key": BASE64.encode(CIPHER_KEY), "encrypt": 0, "error_code": 0, "error_message": "", "data": ""}),
    )
}

/// gzip, seal under the cipher key, base64, URL-escape.
fn sealed_batch(batch: &Value) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(batch.to_string().as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let iv = [1u8; 16];
    let aad = [2u8; 16];
    let ciphertext = AesGcm::<aes::Aes256, U16>::new_from_slice(&CIPHER_KEY)
        .unwrap()
        .encrypt(
            Nonce::<U16>::from_slice(&iv),
            Payload {
                msg: &compressed,
                aad: &aad,
            },
        )
        .unwrap();

    let mut buffer = iv.to_vec();
    buffer.extend_from_slice(&aad);
    buffer.extend_from_slice(&ciphertext);
    urlencoding::encode(&BASE64.encode(buffer)).into_owned()
}

fn user_messages_frame(msgs: &Value) -> WsMessage {
    frame(
        (1, 501, 0),
        &json!({"encrypt": 2, "error_code": 0, "error_message": null,
                "data": sealed_batch(&json!({"data": {"msgs": msgs}}))}),
    )
}

async fn next<T>(stream: &EventStream<T>) -> T {
    tokio::time::timeout(WAIT, stream.recv())
        .await
        .expect("event within timeout")
        .expect("stream open")
}

async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    tokio::time::timeout(WAIT, servers.recv())
        .await
        .expect("dial within timeout")
        .expect("connector alive")
}

async fn next_binary(server: &mut ServerSide) -> Vec<u8> {
    loop {
        let message = tokio::time::timeout(WAIT, server.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .unwrap();
        if let WsMessage::Binary(bytes) = message {
            return bytes;
        }
    }
}

/// Push a malformed frame and wait for its error, proving every frame sent
/// before it has been handled.
async fn barrier(listener: &Listener, server: &mut ServerSide) {
    server.send(WsMessage::Binary(vec![1, 2])).await.unwrap();
    let err = next(&listener.events().error).await;
    assert!(matches!(err, ListenerError::Decode { op: "frame header", .. }), "{err}");
}

async fn deliver_own_message(self_listen: bool) -> Listener {
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(SocketSettings::default(), self_listen), connector);
    listener.start(CancellationToken::new(), false).await.unwrap();
    let mut server = next_server(&mut servers).await;

    server.send(cipher_key_frame()).await.unwrap();
    next(&listener.events().cipher_key).await;

    let own = json!([{
        "msgId": "9001", "cliMsgId": "1", "msgType": "webchat",
        "uidFrom": "0", "idTo": "42", "dName": "me", "ts": "1700000000000",
        "content": "hello", "ttl": 0
    }]);
    server.send(user_messages_frame(&own)).await.unwrap();
    barrier(&listener, &mut server).await;

    // Keep the server half alive until the caller is done.
    tokio::spawn(async move {
        while let Some(Ok(_)) = server.next().await {}
    });
    listener
}

#[tokio::test]
async fn test_own_message_suppressed_without_self_listen() {
    let listener = deliver_own_message(false).await;
    assert!(listener.events().message.is_empty());
    listener.stop().await;
}

#[tokio::test]
async fn test_own_message_delivered_with_self_listen() {
    let listener = deliver_own_message(true).await;

    let message = listener.events().message.try_recv().expect("one message");
    assert!(listener.events().message.is_empty());
    assert!(message.is_self);
    assert_eq!(message.thread_type, ThreadType::User);
    assert_eq!(message.thread_id, "42");
    assert_eq!(message.data.uid_from, UID);
    assert_eq!(message.data.content, json!("hello"));
    listener.stop().await;
}

#[tokio::test]
async fn test_peer_message_and_undo_are_routed() {
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(SocketSettings::default(), false), connector);
    listener.start(CancellationToken::new(), false).await.unwrap();
    let mut server = next_server(&mut servers).await;
    server.send(cipher_key_frame()).await.unwrap();

    let batch = json!([
        {"msgId": "1", "uidFrom": "42", "idTo": "0", "content": "hi"},
        {"msgId": "2", "uidFrom": "42", "idTo": "0",
         "content": {"globalMsgId": "1", "cliMsgId": "5", "deleteMsg": 1}}
    ]);
    server.send(user_messages_frame(&batch)).await.unwrap();

    let message = next(&listener.events().message).await;
    assert_eq!(message.thread_id, "42");
    assert_eq!(message.data.id_to, UID);
    assert!(!message.is_self);

    let undo = next(&listener.events().undo).await;
    assert_eq!(undo.undo.global_msg_id, "1");
    listener.stop().await;
}

#[tokio::test]
async fn test_keyed_frame_before_cipher_key_is_an_error() {
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(SocketSettings::default(), true), connector);
    listener.start(CancellationToken::new(), false).await.unwrap();
    let mut server = next_server(&mut servers).await;

    server
        .send(user_messages_frame(&json!([{"uidFrom": "42", "content": "x"}])))
        .await
        .unwrap();
    let err = next(&listener.events().error).await;
    assert!(
        matches!(err, ListenerError::Decode { source: zwire::DecodeError::MissingCipherKey, .. }),
        "{err}"
    );
    assert!(listener.events().message.is_empty());
    listener.stop().await;
}

#[tokio::test]
async fn test_server_error_code_is_reported() {
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(SocketSettings::default(), false), connector);
    listener.start(CancellationToken::new(), false).await.unwrap();
    let mut server = next_server(&mut servers).await;

    server
        .send(frame((1, 501, 0), &json!({"encrypt": 0, "error_code": 114, "error_message": "bad", "data": ""})))
        .await
        .unwrap();
    let err = next(&listener.events().error).await;
    assert!(matches!(err, ListenerError::Server { code: 114, ref message } if message == "bad"));
    listener.stop().await;
}

#[tokio::test]
async fn test_stop_closes_with_manual_code() {
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(SocketSettings::default(), false), connector);
    listener.start(CancellationToken::new(), true).await.unwrap();
    let mut server = next_server(&mut servers).await;
    tokio::spawn(async move { while let Some(Ok(_)) = server.next().await {} });
    assert_eq!(listener.state(), ListenerPhase::Connected);

    listener.stop().await;

    assert_eq!(listener.state(), ListenerPhase::Closed);
    let closed = next(&listener.events().closed).await;
    assert_eq!(closed.code, 1000);
    assert!(matches!(
        listener.request_old_messages(ThreadType::User, None),
        Err(ListenerError::Cancelled)
    ));
}

#[tokio::test]
async fn test_duplicate_connection_closes_without_retry() {
    let settings = SocketSettings {
        retries: HashMap::from([(3000, RetryRule { max: 5, times: vec![10] })]),
        ..SocketSettings::default()
    };
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(settings, false), Arc::<DuplexConnector>::clone(&connector));
    listener.start(CancellationToken::new(), true).await.unwrap();
    let mut server = next_server(&mut servers).await;

    server
        .send(frame((1, 3000, 0), &json!({"encrypt": 0, "data": ""})))
        .await
        .unwrap();

    let closed = next(&listener.events().closed).await;
    assert_eq!(closed.code, 3000);
    assert_eq!(next(&listener.events().disconnected).await.code, 3000);
    assert_eq!(listener.state(), ListenerPhase::Closed);

    // The client tells the server why it left.
    let close = loop {
        match tokio::time::timeout(WAIT, server.next()).await.unwrap() {
            Some(Ok(WsMessage::Close(frame))) => break frame,
            Some(Ok(_)) => {}
            other => panic!("expected close frame, got {other:?}"),
        }
    };
    assert_eq!(close.map(|f| u16::from(f.code)), Some(3000));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.dialed_urls().len(), 1);
    listener.stop().await;
}

#[tokio::test]
async fn test_abnormal_close_rotates_and_reconnects() {
    let settings = SocketSettings {
        retries: HashMap::from([(1006, RetryRule { max: 3, times: vec![10] })]),
        rotate_error_codes: vec![1006],
        ..SocketSettings::default()
    };
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(settings, false), Arc::<DuplexConnector>::clone(&connector));
    listener.start(CancellationToken::new(), true).await.unwrap();
    assert_eq!(next(&listener.events().connected).await.endpoint, "wss://a.example.test/ws");

    drop(next_server(&mut servers).await);

    assert_eq!(next(&listener.events().disconnected).await.code, 1006);
    let reconnected = next(&listener.events().connected).await;
    assert_eq!(reconnected.endpoint, "wss://b.example.test/ws");
    let mut server = next_server(&mut servers).await;
    tokio::spawn(async move { while let Some(Ok(_)) = server.next().await {} });

    let urls = connector.dialed_urls();
    assert_eq!(urls.len(), 2);
    assert!(urls[0].starts_with("wss://a.example.test/ws?"));
    assert!(urls[1].starts_with("wss://b.example.test/ws?"));
    assert!(urls[1].contains("signkey="));

    listener.stop().await;
    assert_eq!(next(&listener.events().closed).await.code, 1000);
}

fn retry_1006(max: u32, rotate: bool) -> SocketSettings {
    SocketSettings {
        retries: HashMap::from([(1006, RetryRule { max, times: vec![10] })]),
        rotate_error_codes: if rotate { vec![1006] } else { Vec::new() },
        ..SocketSettings::default()
    }
}

fn drain<T>(stream: &EventStream<T>) -> Vec<T> {
    std::iter::from_fn(|| stream.try_recv()).collect()
}

#[tokio::test]
async fn test_failed_redials_publish_one_disconnect() {
    let (connector, mut servers) = DuplexConnector::new();
    connector.refuse_from(1);
    let listener = Listener::with_connector(session(retry_1006(3, false), false), Arc::<DuplexConnector>::clone(&connector));
    listener.start(CancellationToken::new(), true).await.unwrap();

    drop(next_server(&mut servers).await);

    let closed = next(&listener.events().closed).await;
    assert_eq!(closed.code, 1006);
    assert_eq!(listener.state(), ListenerPhase::Closed);
    // The initial dial plus two refused redials.
    assert_eq!(connector.dialed_urls().len(), 3);

    let disconnected = drain(&listener.events().disconnected);
    assert_eq!(disconnected.len(), 1, "{disconnected:?}");
    assert_eq!(disconnected[0].code, 1006);

    let dial_errors = drain(&listener.events().error)
        .into_iter()
        .filter(|err| matches!(err, ListenerError::Transport { op: "dial", .. }))
        .count();
    assert_eq!(dial_errors, 2);
    listener.stop().await;
}

#[tokio::test]
async fn test_exhausted_rotation_reports_and_closes() {
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(retry_1006(5, true), false), Arc::<DuplexConnector>::clone(&connector));
    listener.start(CancellationToken::new(), true).await.unwrap();

    drop(next_server(&mut servers).await);
    assert_eq!(next(&listener.events().connected).await.endpoint, "wss://a.example.test/ws");
    assert_eq!(next(&listener.events().connected).await.endpoint, "wss://b.example.test/ws");

    // No endpoint left after b.
    drop(next_server(&mut servers).await);

    let closed = next(&listener.events().closed).await;
    assert_eq!(closed.code, 1006);
    assert!(listener.events().closed.is_empty());
    assert_eq!(listener.state(), ListenerPhase::Closed);
    assert_eq!(connector.dialed_urls().len(), 2);

    let errors = drain(&listener.events().error);
    assert!(
        errors.iter().any(|err| matches!(
            err,
            ListenerError::Retry(RetryError::RotationExhausted { index: 1, len: 2 })
        )),
        "{errors:?}"
    );
    listener.stop().await;
}

#[tokio::test]
async fn test_peer_drop_racing_stop_closes_once() {
    for _ in 0..5 {
        let (connector, mut servers) = DuplexConnector::new();
        let listener = Listener::with_connector(session(retry_1006(3, false), false), Arc::<DuplexConnector>::clone(&connector));
        listener.start(CancellationToken::new(), true).await.unwrap();
        let server = next_server(&mut servers).await;

        let ((), ()) = tokio::join!(async move { drop(server) }, listener.stop());

        assert_eq!(listener.state(), ListenerPhase::Closed);
        assert_eq!(listener.events().closed.len(), 1);
        assert_eq!(connector.dialed_urls().len(), 1);
    }
}

#[tokio::test]
async fn test_streams_end_after_close_and_reopen_on_restart() {
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(SocketSettings::default(), false), connector);
    listener.start(CancellationToken::new(), false).await.unwrap();
    next(&listener.events().connected).await;

    drop(next_server(&mut servers).await);
    assert_eq!(next(&listener.events().closed).await.code, 1006);

    // A consumer waiting for more is released instead of hanging.
    let pending = tokio::time::timeout(WAIT, listener.events().message.recv())
        .await
        .unwrap();
    assert!(pending.is_none());

    listener.start(CancellationToken::new(), false).await.unwrap();
    let _server = next_server(&mut servers).await;
    assert_eq!(next(&listener.events().connected).await.endpoint, "wss://a.example.test/ws");
    listener.stop().await;
}

#[tokio::test]
async fn test_handshake_headers_carry_session_identity() {
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(SocketSettings::default(), false), Arc::<DuplexConnector>::clone(&connector));
    listener.start(CancellationToken::new(), false).await.unwrap();
    let _server = next_server(&mut servers).await;

    let headers = connector.dials.lock().unwrap()[0].1.clone();
    let header = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    };
    assert_eq!(header("user-agent").as_deref(), Some("zwire-test"));
    assert_eq!(header("origin").as_deref(), Some("https://chat.zalo.me"));
    assert_eq!(header("cookie").as_deref(), Some("zpw_sek=abc"));
    listener.stop().await;
}

#[tokio::test]
async fn test_backfill_requests_are_stamped_in_order() {
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(SocketSettings::default(), false), connector);
    listener.start(CancellationToken::new(), false).await.unwrap();
    let mut server = next_server(&mut servers).await;

    listener.request_old_messages(ThreadType::User, Some("55")).unwrap();
    listener.request_old_messages(ThreadType::Group, None).unwrap();

    let first = next_binary(&mut server).await;
    assert_eq!(&first[..4], &[1, 0xFE, 0x01, 1]);
    let body: Value = serde_json::from_slice(&first[4..]).unwrap();
    assert_eq!(body, json!({"first": true, "lastId": "55", "preIds": [], "req_id": "req_0"}));

    let second = next_binary(&mut server).await;
    assert_eq!(&second[..4], &[1, 0xFF, 0x01, 1]);
    let body: Value = serde_json::from_slice(&second[4..]).unwrap();
    assert_eq!(body["req_id"], "req_1");

    tokio::spawn(async move { while let Some(Ok(_)) = server.next().await {} });
    listener.stop().await;
}

#[tokio::test]
async fn test_keepalive_pings_after_cipher_key() {
    let settings = SocketSettings {
        ping_interval: 50,
        ..SocketSettings::default()
    };
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(settings, false), connector);
    listener.start(CancellationToken::new(), false).await.unwrap();
    let mut server = next_server(&mut servers).await;

    server.send(cipher_key_frame()).await.unwrap();
    let ping = next_binary(&mut server).await;
    assert_eq!(&ping[..4], &[1, 2, 0, 1]);
    let body: Value = serde_json::from_slice(&ping[4..]).unwrap();
    assert!(body["eventId"].is_i64());
    assert!(body.get("req_id").is_none());

    tokio::spawn(async move { while let Some(Ok(_)) = server.next().await {} });
    listener.stop().await;
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (connector, mut servers) = DuplexConnector::new();
    let listener = Listener::with_connector(session(SocketSettings::default(), false), connector);
    listener.start(CancellationToken::new(), false).await.unwrap();
    let _server = next_server(&mut servers).await;

    assert!(matches!(
        listener.start(CancellationToken::new(), false).await,
        Err(ListenerError::AlreadyConnected)
    ));
    listener.stop().await;
}
