//! 集成测试共用的装配：内存存储 + 手动时钟，直接驱动 ChatGateway。

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::memory::{
    InMemoryCallRepository, InMemoryConversationRepository, InMemoryDirectory,
    InMemoryMessageRepository,
};
use application::{
    CallService, CallServiceDependencies, ChatGateway, ChatGatewayDependencies, ChatService,
    ChatServiceDependencies, ConnectionContext, ConversationService,
    ConversationServiceDependencies, HistoryLimits, ManualClock, MessageRepository,
    PresenceTracker, RateLimiter, RateLimits, RoomManager, ServerEvent,
};
use domain::{AdId, User, UserId, UserRole};
use serde_json::{json, Value};
use time::macros::datetime;
use tokio::sync::mpsc;

pub struct TestClient {
    pub ctx: ConnectionContext,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl TestClient {
    pub fn user_id(&self) -> UserId {
        self.ctx.user_id
    }

    /// 取出目前收到的全部事件
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn drain_named(&mut self, name: &str) -> Vec<ServerEvent> {
        self.drain()
            .into_iter()
            .filter(|event| event.name() == name)
            .collect()
    }
}

pub fn error_code(event: &ServerEvent) -> Option<&'static str> {
    match event {
        ServerEvent::Error(payload) => Some(payload.code),
        _ => None,
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub rooms: Arc<RoomManager>,
    pub conversations: Arc<InMemoryConversationRepository>,
    pub messages: Arc<InMemoryMessageRepository>,
    pub calls: Arc<InMemoryCallRepository>,
    pub directory: Arc<InMemoryDirectory>,
    pub chat: Arc<ChatService>,
    pub call_service: Arc<CallService>,
    pub conversation_service: Arc<ConversationService>,
    pub gateway: Arc<ChatGateway>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_limits(60, 20)
    }

    pub fn with_limits(messages_per_minute: u32, typing_per_window: u32) -> Self {
        Self::assemble(messages_per_minute, typing_per_window, |messages| {
            messages as Arc<dyn MessageRepository>
        })
    }

    /// 在内存消息存储外面包一层，用来注入存储故障
    pub fn with_message_store<F>(wrap: F) -> Self
    where
        F: FnOnce(Arc<InMemoryMessageRepository>) -> Arc<dyn MessageRepository>,
    {
        Self::assemble(60, 20, wrap)
    }

    fn assemble<F>(messages_per_minute: u32, typing_per_window: u32, wrap: F) -> Self
    where
        F: FnOnce(Arc<InMemoryMessageRepository>) -> Arc<dyn MessageRepository>,
    {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
        let rooms = Arc::new(RoomManager::new());
        let conversations = Arc::new(InMemoryConversationRepository::new());
        let messages = Arc::new(InMemoryMessageRepository::new());
        let calls = Arc::new(InMemoryCallRepository::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let message_store = wrap(messages.clone());

        let chat = Arc::new(ChatService::new(ChatServiceDependencies {
            conversations: conversations.clone(),
            messages: message_store.clone(),
            rooms: rooms.clone(),
            clock: clock.clone(),
            history: HistoryLimits::default(),
        }));
        let call_service = Arc::new(CallService::new(CallServiceDependencies {
            calls: calls.clone(),
            chat: chat.clone(),
            rooms: rooms.clone(),
            clock: clock.clone(),
        }));
        let conversation_service =
            Arc::new(ConversationService::new(ConversationServiceDependencies {
                conversations: conversations.clone(),
                messages: message_store,
                ads: directory.clone(),
                chat: chat.clone(),
                clock: clock.clone(),
            }));
        let limits = Arc::new(RateLimits {
            messages: Arc::new(RateLimiter::messages(
                messages_per_minute,
                Duration::from_secs(60),
                clock.clone(),
            )),
            typing: Arc::new(RateLimiter::typing(
                typing_per_window,
                Duration::from_secs(10),
                clock.clone(),
            )),
        });
        let gateway = Arc::new(ChatGateway::new(ChatGatewayDependencies {
            rooms: rooms.clone(),
            presence: Arc::new(PresenceTracker::new(clock.clone())),
            chat: chat.clone(),
            calls: call_service.clone(),
            limits,
        }));

        Self {
            clock,
            rooms,
            conversations,
            messages,
            calls,
            directory,
            chat,
            call_service,
            conversation_service,
            gateway,
        }
    }

    pub async fn user(&self) -> UserId {
        let id = UserId::generate();
        self.directory.insert_user(User::new(id, UserRole::User)).await;
        id
    }

    pub async fn ad_owned_by(&self, owner: UserId) -> AdId {
        let ad_id = AdId::generate();
        self.directory.insert_ad(ad_id, owner).await;
        ad_id
    }

    pub async fn connect(&self, user_id: UserId) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = self.gateway.connect(user_id, tx).await;
        TestClient { ctx, rx }
    }

    pub async fn emit(&self, client: &TestClient, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.gateway.handle_text(client.ctx, &frame).await;
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(time::Duration::seconds(seconds));
    }
}
