//! End-to-end relay scenarios over loopback TCP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use zap_auth::{auth_key, AuthConfig, AuthScope, AuthSetter, TokenAuth};
use zap_control::{ControlState, ServerConfig, Service};
use zap_proto::{
    Login, LoginResp, Message, MsgCtl, NewProxy, NewProxyResp, NewVisitorConn, NewWorkConn, Ping,
};
use zap_transport::{Cipher, EncryptedStream};

const TOKEN: &str = "relay-token";
const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn server_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1".to_string(),
        bind_port: 0,
        auth: AuthConfig::default()
            .with_token(TOKEN)
            .with_scopes(vec![AuthScope::HeartBeats, AuthScope::NewWorkConns]),
        ..Default::default()
    }
}

async fn start_server(config: ServerConfig) -> (Arc<Service>, SocketAddr) {
    init_tracing();
    let service = Arc::new(Service::new(config).await.unwrap());
    let addr = service.local_addr().unwrap();
    let runner = service.clone();
    tokio::spawn(async move { runner.run().await });
    (service, addr)
}

fn setter() -> TokenAuth {
    TokenAuth::new([AuthScope::HeartBeats, AuthScope::NewWorkConns], TOKEN)
}

/// A bare protocol client speaking frames directly
struct RawClient {
    conn: TcpStream,
    msg_ctl: MsgCtl,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            conn: TcpStream::connect(addr).await.unwrap(),
            msg_ctl: MsgCtl::standard().unwrap(),
        }
    }

    async fn send(&mut self, msg: impl Into<Message>) {
        self.msg_ctl
            .write_msg(&mut self.conn, &msg.into())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(WAIT, self.msg_ctl.read_msg(&mut self.conn))
            .await
            .expect("timed out waiting for a message")
            .unwrap()
    }

    /// Skip ReqWorkConn requests until another message arrives
    async fn recv_reply(&mut self) -> Message {
        loop {
            match self.recv().await {
                Message::ReqWorkConn(_) => continue,
                other => return other,
            }
        }
    }

    async fn login(&mut self, user: &str, run_id: &str, pool_count: usize) -> LoginResp {
        let mut login = Login {
            version: zap_proto::PROTOCOL_VERSION.to_string(),
            user: user.to_string(),
            run_id: run_id.to_string(),
            pool_count,
            ..Default::default()
        };
        setter().set_login(&mut login).unwrap();
        self.send(login).await;
        match self.recv().await {
            Message::LoginResp(resp) => resp,
            other => panic!("expected LoginResp, got {:?}", other),
        }
    }

    async fn assert_closed(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match timeout(WAIT, self.conn.read(&mut buf)).await.unwrap() {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }
}

async fn work_conn(addr: SocketAddr, run_id: &str) -> RawClient {
    let mut client = RawClient::connect(addr).await;
    let mut msg = NewWorkConn {
        run_id: run_id.to_string(),
        ..Default::default()
    };
    setter().set_new_work_conn(&mut msg).unwrap();
    client.send(msg).await;
    client
}

#[tokio::test]
async fn test_login_assigns_run_id() {
    let (service, addr) = start_server(server_config()).await;
    let mut client = RawClient::connect(addr).await;

    let resp = client.login("alice", "", 0).await;
    assert!(resp.error.is_empty());
    assert!(!resp.run_id.is_empty());

    assert_eq!(service.controls().len().await, 1);
    let ctl = service.controls().get_by_id(&resp.run_id).await.unwrap();
    assert_eq!(ctl.state(), ControlState::Active);
    assert_eq!(ctl.login().user, "alice");
}

#[tokio::test]
async fn test_login_with_wrong_token_is_refused() {
    let mut config = server_config();
    config.detailed_errors_to_client = false;
    let (service, addr) = start_server(config).await;
    let mut client = RawClient::connect(addr).await;

    client
        .send(Login {
            privilege_key: auth_key("not-the-token", 100),
            timestamp: 100,
            ..Default::default()
        })
        .await;
    let Message::LoginResp(resp) = client.recv().await else {
        panic!("expected LoginResp");
    };
    assert_eq!(resp.error, "register control error");
    client.assert_closed().await;
    assert!(service.controls().is_empty().await);
}

#[tokio::test]
async fn test_bad_ping_gets_error_pong() {
    let (service, addr) = start_server(server_config()).await;
    let mut client = RawClient::connect(addr).await;
    let resp = client.login("alice", "", 0).await;
    let ctl = service.controls().get_by_id(&resp.run_id).await.unwrap();
    let before = ctl.last_ping();

    client
        .send(Ping {
            privilege_key: auth_key(TOKEN, 1) + "0",
            timestamp: 1,
        })
        .await;
    let Message::Pong(pong) = client.recv_reply().await else {
        panic!("expected Pong");
    };
    assert!(!pong.error.is_empty());
    assert_eq!(ctl.last_ping(), before);

    // A valid ping on the same connection still works
    let mut ping = Ping::default();
    setter().set_ping(&mut ping).unwrap();
    client.send(ping).await;
    let Message::Pong(pong) = client.recv_reply().await else {
        panic!("expected Pong");
    };
    assert!(pong.error.is_empty());
    assert!(ctl.last_ping() > before);
}

#[tokio::test]
async fn test_visitor_for_unknown_proxy() {
    let mut config = server_config();
    config.detailed_errors_to_client = false;
    let (_service, addr) = start_server(config).await;

    let mut visitor = RawClient::connect(addr).await;
    visitor
        .send(NewVisitorConn {
            proxy_name: "web1".to_string(),
            sign_key: auth_key("sk", 5),
            timestamp: 5,
            ..Default::default()
        })
        .await;
    let Message::NewVisitorConnResp(resp) = visitor.recv().await else {
        panic!("expected NewVisitorConnResp");
    };
    assert_eq!(resp.proxy_name, "web1");
    assert_eq!(resp.error, "register visitor conn error");
    visitor.assert_closed().await;
}

#[tokio::test]
async fn test_same_run_id_replaces_first_session() {
    let (service, addr) = start_server(server_config()).await;

    let db = || NewProxy {
        proxy_name: "db".to_string(),
        proxy_type: "stcp".to_string(),
        sk: "s".to_string(),
        ..Default::default()
    };

    let mut first = RawClient::connect(addr).await;
    let resp = first.login("alice", "fixed-id", 0).await;
    assert_eq!(resp.run_id, "fixed-id");
    let first_ctl = service.controls().get_by_id("fixed-id").await.unwrap();
    first.send(db()).await;
    let Message::NewProxyResp(resp) = first.recv_reply().await else {
        panic!("expected NewProxyResp");
    };
    assert!(resp.error.is_empty(), "{}", resp.error);

    let mut second = RawClient::connect(addr).await;
    let resp = second.login("alice", "fixed-id", 0).await;
    assert_eq!(resp.run_id, "fixed-id");
    assert!(resp.error.is_empty());
    // The old session is gone before the new one answers
    assert_eq!(first_ctl.state(), ControlState::Closed);

    // so its proxy name can be taken straight away
    second.send(db()).await;
    let Message::NewProxyResp(resp) = second.recv_reply().await else {
        panic!("expected NewProxyResp");
    };
    assert!(resp.error.is_empty(), "{}", resp.error);

    first.assert_closed().await;
    timeout(WAIT, first_ctl.wait_closed()).await.unwrap();
    assert_eq!(first_ctl.state(), ControlState::Closed);

    // Let the old session's registry cleanup run
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.controls().len().await, 1);
    let current = service.controls().get_by_id("fixed-id").await.unwrap();
    assert!(!current.ptr_eq(&first_ctl));
    assert_eq!(current.state(), ControlState::Active);
}

#[tokio::test]
async fn test_unexpected_first_message_closes() {
    let (_service, addr) = start_server(server_config()).await;
    let mut client = RawClient::connect(addr).await;
    client.send(Ping::default()).await;
    client.assert_closed().await;
}

#[tokio::test]
async fn test_work_conn_for_unknown_run_id_closes() {
    let (_service, addr) = start_server(server_config()).await;
    let mut client = work_conn(addr, "nobody").await;
    client.assert_closed().await;
}

#[tokio::test]
async fn test_tcp_proxy_round_trip() {
    let (_service, addr) = start_server(server_config()).await;
    let mut control = RawClient::connect(addr).await;
    let resp = control.login("alice", "", 1).await;
    let run_id = resp.run_id;
    assert!(matches!(control.recv().await, Message::ReqWorkConn(_)));

    control
        .send(NewProxy {
            proxy_name: "echo".to_string(),
            proxy_type: "tcp".to_string(),
            ..Default::default()
        })
        .await;
    let Message::NewProxyResp(NewProxyResp {
        proxy_name,
        remote_addr,
        error,
    }) = control.recv_reply().await
    else {
        panic!("expected NewProxyResp");
    };
    assert_eq!(proxy_name, "echo");
    assert!(error.is_empty(), "{}", error);
    let port: u16 = remote_addr.trim_start_matches(':').parse().unwrap();

    // The work connection plays the local echo service
    let mut work = work_conn(addr, &run_id).await;
    let echo = tokio::spawn(async move {
        let Message::StartWorkConn(start) = work.recv().await else {
            panic!("expected StartWorkConn");
        };
        assert_eq!(start.proxy_name, "echo");
        let mut buf = [0u8; 5];
        work.conn.read_exact(&mut buf).await.unwrap();
        work.conn.write_all(&buf).await.unwrap();
        start
    });

    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    user.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, user.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello");

    let start = echo.await.unwrap();
    assert_eq!(start.dst_port, port);
    assert_eq!(start.src_addr, "127.0.0.1");
}

#[tokio::test]
async fn test_encrypted_visitor_round_trip() {
    let (_service, addr) = start_server(server_config()).await;

    let mut owner = RawClient::connect(addr).await;
    let owner_run_id = owner.login("alice", "", 0).await.run_id;
    owner
        .send(NewProxy {
            proxy_name: "db".to_string(),
            proxy_type: "stcp".to_string(),
            sk: "shared-secret".to_string(),
            allow_users: vec!["bob".to_string()],
            ..Default::default()
        })
        .await;
    let Message::NewProxyResp(resp) = owner.recv_reply().await else {
        panic!("expected NewProxyResp");
    };
    assert!(resp.error.is_empty(), "{}", resp.error);

    let mut peer = RawClient::connect(addr).await;
    let peer_run_id = peer.login("bob", "", 0).await.run_id;

    let mut visitor = RawClient::connect(addr).await;
    visitor
        .send(NewVisitorConn {
            run_id: peer_run_id,
            proxy_name: "db".to_string(),
            sign_key: auth_key("shared-secret", 77),
            timestamp: 77,
            use_encryption: true,
            ..Default::default()
        })
        .await;
    let Message::NewVisitorConnResp(resp) = visitor.recv().await else {
        panic!("expected NewVisitorConnResp");
    };
    assert!(resp.error.is_empty(), "{}", resp.error);
    let visitor = EncryptedStream::with_cipher(visitor.conn, Cipher::from_secret("shared-secret"));

    // With a pool of zero the server asks for a work connection on demand
    assert!(matches!(owner.recv().await, Message::ReqWorkConn(_)));
    let mut work = work_conn(addr, &owner_run_id).await;

    visitor.write_frame(b"query").await.unwrap();
    let Message::StartWorkConn(start) = work.recv().await else {
        panic!("expected StartWorkConn");
    };
    assert_eq!(start.proxy_name, "db");

    let mut buf = [0u8; 5];
    timeout(WAIT, work.conn.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"query");

    work.conn.write_all(b"rows").await.unwrap();
    let reply = timeout(WAIT, visitor.read_frame_vec())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"rows");
}

#[tokio::test]
async fn test_visitor_not_in_allow_list() {
    let mut config = server_config();
    config.detailed_errors_to_client = true;
    let (_service, addr) = start_server(config).await;

    let mut owner = RawClient::connect(addr).await;
    owner.login("alice", "", 0).await;
    owner
        .send(NewProxy {
            proxy_name: "db".to_string(),
            proxy_type: "stcp".to_string(),
            sk: "s".to_string(),
            ..Default::default()
        })
        .await;
    assert!(matches!(owner.recv_reply().await, Message::NewProxyResp(_)));

    let mut peer = RawClient::connect(addr).await;
    let run_id = peer.login("mallory", "", 0).await.run_id;

    let mut visitor = RawClient::connect(addr).await;
    visitor
        .send(NewVisitorConn {
            run_id,
            proxy_name: "db".to_string(),
            sign_key: auth_key("s", 1),
            timestamp: 1,
            ..Default::default()
        })
        .await;
    let Message::NewVisitorConnResp(resp) = visitor.recv().await else {
        panic!("expected NewVisitorConnResp");
    };
    assert_eq!(
        resp.error,
        "visitor connection of [db] user [mallory] not allowed"
    );
}

async fn visit(addr: SocketAddr, proxy_name: &str, sk: &str) -> (RawClient, String) {
    let mut visitor = RawClient::connect(addr).await;
    visitor
        .send(NewVisitorConn {
            proxy_name: proxy_name.to_string(),
            sign_key: auth_key(sk, 9),
            timestamp: 9,
            ..Default::default()
        })
        .await;
    let Message::NewVisitorConnResp(resp) = visitor.recv().await else {
        panic!("expected NewVisitorConnResp");
    };
    (visitor, resp.error)
}

#[tokio::test]
async fn test_full_visitor_queue_is_reported_in_response() {
    let mut config = server_config();
    config.transport.visitor_backlog = 1;
    let (service, addr) = start_server(config).await;
    let listener = service
        .visitors()
        .listen("db", "sk", vec!["*".to_string()])
        .unwrap();

    let (_first, error) = visit(addr, "db", "sk").await;
    assert!(error.is_empty(), "{}", error);

    // Nobody has accepted the first connection yet
    let (mut second, error) = visit(addr, "db", "sk").await;
    assert_eq!(error, "listener for [db] is full");
    second.assert_closed().await;

    let queued = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    assert!(!queued.is_encrypted());

    let (_third, error) = visit(addr, "db", "sk").await;
    assert!(error.is_empty(), "{}", error);
}

#[tokio::test]
async fn test_closed_visitor_listener_is_reported_in_response() {
    let (service, addr) = start_server(server_config()).await;
    let listener = service
        .visitors()
        .listen("db", "sk", vec!["*".to_string()])
        .unwrap();
    listener.close();

    let (mut visitor, error) = visit(addr, "db", "sk").await;
    assert_eq!(error, "listener for [db] is closed");
    visitor.assert_closed().await;
}

#[tokio::test]
async fn test_close_shuts_down_sessions() {
    let (service, addr) = start_server(server_config()).await;
    let mut client = RawClient::connect(addr).await;
    client.login("alice", "", 0).await;

    service.close().await;
    client.assert_closed().await;
    assert!(service.controls().is_empty().await);
}
