#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::memory::{
    InMemoryCallRepository, InMemoryConversationRepository, InMemoryDirectory,
    InMemoryMessageRepository,
};
use application::SystemClock;
use config::ChatConfig;
use domain::{AdId, User, UserId, UserRole};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppState, JwtConfig, JwtService, StateDependencies};

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: Arc<JwtService>,
    pub directory: Arc<InMemoryDirectory>,
    pub http: reqwest::Client,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_chat_config(ChatConfig::default()).await
    }

    pub async fn with_chat_config(chat: ChatConfig) -> Self {
        let directory = Arc::new(InMemoryDirectory::new());
        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "integration-test-secret-with-enough-length".to_string(),
            expiration_hours: 1,
        }));

        let state = AppState::new(StateDependencies {
            conversations: Arc::new(InMemoryConversationRepository::new()),
            messages: Arc::new(InMemoryMessageRepository::new()),
            calls: Arc::new(InMemoryCallRepository::new()),
            users: directory.clone(),
            ads: directory.clone(),
            verifier: jwt.clone(),
            clock: Arc::new(SystemClock),
            chat,
        });
        let app = router(state, &["*".to_string()]);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            jwt,
            directory,
            http: reqwest::Client::new(),
            _shutdown: shutdown_tx,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/api/v1{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/v1/ws", self.addr)
    }

    /// 注册一个用户并返回其令牌
    pub async fn user(&self) -> (UserId, String) {
        let id = UserId::generate();
        self.directory.insert_user(User::new(id, UserRole::User)).await;
        let token = self.jwt.generate_token(id).expect("token");
        (id, token)
    }

    pub async fn ad_owned_by(&self, owner: UserId) -> AdId {
        let ad_id = AdId::generate();
        self.directory.insert_ad(ad_id, owner).await;
        ad_id
    }

    /// 通过查询参数携带令牌
    pub async fn connect_with_query(&self, token: &str) -> WsClient {
        let (socket, _) = connect_async(format!("{}?token={}", self.ws_url(), token))
            .await
            .expect("websocket connect");
        socket
    }

    /// 通过 `Sec-WebSocket-Protocol: access_token, <token>` 携带令牌
    pub async fn connect_with_protocol(&self, token: &str) -> WsClient {
        let mut request = self.ws_url().into_client_request().expect("request");
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            format!("access_token, {token}").parse().expect("header"),
        );
        let (socket, response) = connect_async(request).await.expect("websocket connect");
        assert_eq!(
            response
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|value| value.to_str().ok()),
            Some("access_token")
        );
        socket
    }
}

pub async fn emit(socket: &mut WsClient, event: &str, data: Value) {
    let frame = json!({ "event": event, "data": data }).to_string();
    socket
        .send(WsMessage::Text(frame.into()))
        .await
        .expect("send frame");
}

/// 读取直到出现指定事件，期间的其他事件被丢弃
pub async fn expect_event(socket: &mut WsClient, name: &str) -> Value {
    let wait = async {
        loop {
            let message = socket
                .next()
                .await
                .expect("socket closed")
                .expect("socket error");
            let WsMessage::Text(text) = message else {
                continue;
            };
            let frame: Value = serde_json::from_str(text.as_str()).expect("json frame");
            if frame["event"] == name {
                return frame["data"].clone();
            }
        }
    };
    timeout(Duration::from_secs(3), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}
