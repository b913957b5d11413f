//! Connection tests over in-memory duplex streams

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{Connection, ConnectionError};
use crate::broker::router::{Router, RouterHandle};
use crate::broker::{BrokerConfig, BrokerEvent};
use crate::codec::{Decoder, Encoder};
use crate::hooks::{DefaultHooks, Hooks};
use crate::protocol::{
    Auth, Connect, ErrorCode, Frame, Info, ProtocolError, Publish, Subscribe, Unsubscribe,
    PROTOCOL_VERSION,
};
use crate::topic::ConnectionId;

const WAIT: Duration = Duration::from_secs(2);

struct TestClient {
    stream: DuplexStream,
    decoder: Decoder,
    encoder: Encoder,
    buf: BytesMut,
}

impl TestClient {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: Decoder::client(),
            encoder: Encoder::new(),
            buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        self.encoder.encode(&frame, &mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        timeout(WAIT, async {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    return frame;
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "connection closed while waiting for a frame");
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    async fn recv_err(&mut self) -> ErrorCode {
        match self.recv().await {
            Frame::Err(err) => err.code,
            other => panic!("expected ERR, got {:?}", other),
        }
    }

    /// Wait for the server to close the stream, failing on any frame
    async fn expect_closed(&mut self) {
        timeout(WAIT, async {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    panic!("expected close, got {:?}", frame);
                }
                if self.stream.read_buf(&mut self.buf).await.unwrap_or(0) == 0 {
                    return;
                }
            }
        })
        .await
        .expect("timed out waiting for close")
    }

    async fn handshake(&mut self, verbose: bool, auth: Option<Auth>) -> Info {
        let info = match self.recv().await {
            Frame::Info(info) => info,
            other => panic!("expected INFO, got {:?}", other),
        };
        self.send(Frame::Connect(Connect {
            version: PROTOCOL_VERSION,
            verbose,
            auth,
        }))
        .await;
        info
    }

    async fn subscribe(&mut self, sid: &'static str, pattern: &'static str) {
        self.send(Frame::Sub(Subscribe {
            topic: Bytes::from_static(pattern.as_bytes()),
            subscription_id: Bytes::from_static(sid.as_bytes()),
            queue_group: None,
        }))
        .await;
    }

    async fn publish(&mut self, topic: &'static str, payload: &'static [u8]) {
        self.send(Frame::Pub(Publish {
            topic: Bytes::from_static(topic.as_bytes()),
            reply_to: None,
            header: None,
            payload: Bytes::from_static(payload),
        }))
        .await;
    }

    /// Round trip a PING so every earlier frame has been processed
    async fn sync(&mut self) {
        self.send(Frame::Ping).await;
        assert_eq!(self.recv().await, Frame::Pong);
    }
}

struct Harness {
    config: Arc<BrokerConfig>,
    router: RouterHandle,
    events: broadcast::Sender<BrokerEvent>,
    hooks: Arc<dyn Hooks>,
    _shutdown: broadcast::Sender<()>,
    next_id: u64,
}

impl Harness {
    fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(64);
        let (router, handle) = Router::new(16, events.clone());
        tokio::spawn(router.run(shutdown.subscribe()));
        Self {
            config: Arc::new(config),
            router: handle,
            events,
            hooks,
            _shutdown: shutdown,
            next_id: 0,
        }
    }

    fn connect(&mut self) -> (TestClient, JoinHandle<Result<(), ConnectionError>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.next_id += 1;
        let mut conn = Connection::new(
            server,
            ConnectionId(self.next_id),
            None,
            self.config.clone(),
            self.router.clone(),
            self.hooks.clone(),
            self.events.clone(),
        );
        let task = tokio::spawn(async move {
            let result = conn.run().await;
            conn.teardown().await;
            result
        });
        (TestClient::new(client), task)
    }
}

fn fast_config() -> BrokerConfig {
    BrokerConfig {
        connect_timeout: Duration::from_millis(100),
        ..BrokerConfig::default()
    }
}

async fn finished(task: JoinHandle<Result<(), ConnectionError>>) -> Result<(), ConnectionError> {
    timeout(WAIT, task)
        .await
        .expect("connection task did not finish")
        .unwrap()
}

#[tokio::test]
async fn test_info_advertises_limits() {
    let config = BrokerConfig {
        max_payload: 4096,
        server_id: "node-7".to_string(),
        auth_required: false,
        ..fast_config()
    };
    let mut harness = Harness::new(config);
    let (mut client, _task) = harness.connect();

    let info = client.handshake(false, None).await;
    assert_eq!(info.version, PROTOCOL_VERSION);
    assert_eq!(info.max_payload, 4096);
    assert_eq!(info.server_id, Bytes::from_static(b"node-7"));
    assert!(!info.auth_required);
    assert!(info.headers_supported);

    client.sync().await;
}

#[tokio::test]
async fn test_ping_before_connect_is_answered() {
    let mut harness = Harness::new(fast_config());
    let (mut client, _task) = harness.connect();

    assert!(matches!(client.recv().await, Frame::Info(_)));
    client.send(Frame::Ping).await;
    assert_eq!(client.recv().await, Frame::Pong);
}

#[tokio::test]
async fn test_connect_timeout_closes_without_err() {
    let mut harness = Harness::new(fast_config());
    let (mut client, task) = harness.connect();

    assert!(matches!(client.recv().await, Frame::Info(_)));
    client.expect_closed().await;
    assert!(matches!(finished(task).await, Err(ConnectionError::Timeout)));
}

#[tokio::test]
async fn test_first_frame_must_be_connect() {
    let mut harness = Harness::new(fast_config());
    let (mut client, task) = harness.connect();

    assert!(matches!(client.recv().await, Frame::Info(_)));
    client.subscribe("1", "a/b").await;
    assert_eq!(client.recv_err().await, ErrorCode::UnexpectedCommand);
    client.expect_closed().await;
    assert!(matches!(
        finished(task).await,
        Err(ConnectionError::Protocol(ProtocolError::UnexpectedCommand(_)))
    ));
}

#[tokio::test]
async fn test_unsupported_version_rejected() {
    let mut harness = Harness::new(fast_config());
    let (mut client, _task) = harness.connect();

    assert!(matches!(client.recv().await, Frame::Info(_)));
    client
        .send(Frame::Connect(Connect {
            version: PROTOCOL_VERSION + 1,
            verbose: false,
            auth: None,
        }))
        .await;
    assert_eq!(client.recv_err().await, ErrorCode::UnsupportedVersion);
    client.expect_closed().await;
}

#[tokio::test]
async fn test_auth_required_without_credentials() {
    let config = BrokerConfig {
        auth_required: true,
        ..fast_config()
    };
    let mut harness = Harness::new(config);
    let (mut client, _task) = harness.connect();

    let info = client.handshake(false, None).await;
    assert!(info.auth_required);
    assert_eq!(client.recv_err().await, ErrorCode::AuthRequired);
    client.expect_closed().await;
}

#[tokio::test]
async fn test_verbose_acknowledges_mutations() {
    let mut harness = Harness::new(fast_config());
    let (mut client, _task) = harness.connect();
    client.handshake(true, None).await;

    client.subscribe("s1", "chat/+").await;
    assert_eq!(client.recv().await, Frame::Ok);

    client.publish("chat/room", b"hi").await;
    // Routing finishes before OK, so our own MSG is queued first
    let mut frames = vec![client.recv().await, client.recv().await];
    frames.sort_by_key(|f| f.command() as u8);
    assert!(matches!(frames[0], Frame::Msg(_)));
    assert_eq!(frames[1], Frame::Ok);

    client
        .send(Frame::Unsub(Unsubscribe {
            subscription_id: Bytes::from_static(b"s1"),
        }))
        .await;
    assert_eq!(client.recv().await, Frame::Ok);

    // PING is answered with PONG, never OK
    client.sync().await;
}

#[tokio::test]
async fn test_publish_reaches_other_connection() {
    let mut harness = Harness::new(fast_config());
    let (mut subscriber, _t1) = harness.connect();
    let (mut publisher, _t2) = harness.connect();
    subscriber.handshake(false, None).await;
    publisher.handshake(false, None).await;

    subscriber.subscribe("temps", "sensors/+/temp").await;
    subscriber.sync().await;

    publisher.publish("sensors/kitchen/temp", b"21.5").await;
    match subscriber.recv().await {
        Frame::Msg(msg) => {
            assert_eq!(msg.topic, Bytes::from_static(b"sensors/kitchen/temp"));
            assert_eq!(msg.subscription_id, Bytes::from_static(b"temps"));
            assert_eq!(msg.payload, Bytes::from_static(b"21.5"));
        }
        other => panic!("expected MSG, got {:?}", other),
    }
}

#[tokio::test]
async fn test_recoverable_errors_keep_connection_open() {
    let mut harness = Harness::new(fast_config());
    let (mut client, _task) = harness.connect();
    client.handshake(false, None).await;

    client.publish("$SYS/broker/load", b"1").await;
    assert_eq!(client.recv_err().await, ErrorCode::ReservedTopic);

    client.subscribe("bad", "a/#/b").await;
    assert_eq!(client.recv_err().await, ErrorCode::InvalidTopic);

    client.subscribe("dup", "a/b").await;
    client.subscribe("dup", "a/c").await;
    assert_eq!(client.recv_err().await, ErrorCode::DuplicateSubscriptionId);

    client
        .send(Frame::Unsub(Unsubscribe {
            subscription_id: Bytes::from_static(b"missing"),
        }))
        .await;
    assert_eq!(client.recv_err().await, ErrorCode::UnknownSubscriptionId);

    client.sync().await;
}

#[tokio::test]
async fn test_malformed_frame_is_fatal() {
    let mut harness = Harness::new(fast_config());
    let (mut client, task) = harness.connect();
    client.handshake(false, None).await;
    client.sync().await;

    // PING with a reserved flag bit set
    client.stream.write_all(&[0x71, 0x00]).await.unwrap();
    assert_eq!(client.recv_err().await, ErrorCode::ReservedFlagSet);
    client.expect_closed().await;
    assert!(finished(task).await.is_err());
}

#[tokio::test]
async fn test_keep_alive_timeout() {
    let config = BrokerConfig {
        ping_interval: Duration::from_millis(50),
        keep_alive: Duration::from_millis(100),
        ..fast_config()
    };
    let mut harness = Harness::new(config);
    let (mut client, task) = harness.connect();
    client.handshake(false, None).await;

    assert_eq!(client.recv().await, Frame::Ping);
    // Never answer
    client.expect_closed().await;
    assert!(matches!(
        finished(task).await,
        Err(ConnectionError::Protocol(ProtocolError::KeepAliveTimeout))
    ));
}

#[tokio::test]
async fn test_pong_keeps_connection_alive() {
    let config = BrokerConfig {
        ping_interval: Duration::from_millis(50),
        keep_alive: Duration::from_millis(100),
        ..fast_config()
    };
    let mut harness = Harness::new(config);
    let (mut client, _task) = harness.connect();
    client.handshake(false, None).await;

    for _ in 0..3 {
        assert_eq!(client.recv().await, Frame::Ping);
        client.send(Frame::Pong).await;
    }
    client.sync().await;
}

#[tokio::test]
async fn test_teardown_removes_subscriptions() {
    let mut harness = Harness::new(fast_config());
    let mut events = harness.events.subscribe();
    let (mut client, task) = harness.connect();
    client.handshake(false, None).await;

    client.subscribe("a", "x/y").await;
    client.subscribe("b", "x/#").await;
    client.sync().await;
    drop(client);

    assert!(finished(task).await.is_ok());

    let mut removed = 0;
    let mut disconnected = false;
    while let Ok(event) = events.try_recv() {
        match event {
            BrokerEvent::SubscriptionRemoved { connection, .. } => {
                assert_eq!(connection, ConnectionId(1));
                removed += 1;
            }
            BrokerEvent::ClientDisconnected { connection } => {
                assert_eq!(connection, ConnectionId(1));
                disconnected = true;
            }
            _ => {}
        }
    }
    assert_eq!(removed, 2);
    assert!(disconnected);
}

#[tokio::test]
async fn test_unregistered_teardown_emits_nothing() {
    let mut harness = Harness::new(fast_config());
    let mut events = harness.events.subscribe();
    let (mut client, task) = harness.connect();

    assert!(matches!(client.recv().await, Frame::Info(_)));
    drop(client);

    assert!(finished(task).await.is_err());
    assert!(events.try_recv().is_err());
}

struct DenyAll;

#[async_trait::async_trait]
impl Hooks for DenyAll {
    async fn on_authenticate(
        &self,
        _connection: ConnectionId,
        auth: Option<&Auth>,
    ) -> crate::hooks::HookResult<bool> {
        Ok(auth.is_none())
    }

    async fn on_publish_check(
        &self,
        _connection: ConnectionId,
        _username: Option<&str>,
        _topic: &[u8],
    ) -> crate::hooks::HookResult<bool> {
        Ok(false)
    }
}

#[tokio::test]
async fn test_rejected_credentials_are_fatal() {
    let mut harness = Harness::with_hooks(fast_config(), Arc::new(DenyAll));
    let (mut client, task) = harness.connect();

    let auth = Auth::Jwt {
        token: Bytes::from_static(b"forged"),
    };
    client.handshake(false, Some(auth)).await;
    assert_eq!(client.recv_err().await, ErrorCode::AuthFailed);
    client.expect_closed().await;
    assert!(matches!(
        finished(task).await,
        Err(ConnectionError::Protocol(ProtocolError::AuthFailed))
    ));
}

#[tokio::test]
async fn test_denied_publish_is_recoverable() {
    let mut harness = Harness::with_hooks(fast_config(), Arc::new(DenyAll));
    let (mut client, _task) = harness.connect();
    client.handshake(false, None).await;

    client.publish("a/b", b"x").await;
    assert_eq!(client.recv_err().await, ErrorCode::PermissionDenied);
    client.sync().await;
}

fn encoded(frame: &Frame) -> Vec<u8> {
    let mut buf = BytesMut::new();
    Encoder::new().encode(frame, &mut buf).unwrap();
    buf.to_vec()
}

#[tokio::test]
async fn test_scripted_session_against_mock_stream() {
    let harness = Harness::new(fast_config());
    let info = Frame::Info(Info {
        version: PROTOCOL_VERSION,
        max_payload: harness.config.max_payload,
        server_id: Bytes::from(harness.config.server_id.clone()),
        server_name: Bytes::from(harness.config.server_name.clone()),
        auth_required: false,
        headers_supported: true,
    });
    let connect = Frame::Connect(Connect {
        version: PROTOCOL_VERSION,
        verbose: true,
        auth: None,
    });
    let subscribe = Frame::Sub(Subscribe {
        topic: Bytes::from_static(b"a/+"),
        subscription_id: Bytes::from_static(b"1"),
        queue_group: Some(Bytes::new()),
    });

    // CONNECT and SUB arrive in the same read
    let mut first_read = encoded(&connect);
    first_read.extend(encoded(&subscribe));

    let stream = tokio_test::io::Builder::new()
        .write(&encoded(&info))
        .read(&first_read)
        .write(&encoded(&Frame::Ok))
        .read(&encoded(&Frame::Ping))
        .write(&encoded(&Frame::Pong))
        .build();

    let mut conn = Connection::new(
        stream,
        ConnectionId(42),
        None,
        harness.config.clone(),
        harness.router.clone(),
        harness.hooks.clone(),
        harness.events.clone(),
    );
    let result = timeout(WAIT, conn.run()).await.expect("session did not end");
    assert!(result.is_ok());
    assert!(conn.verbose);
    conn.teardown().await;
    assert_eq!(conn.state(), super::ConnectionState::Closed);
}
