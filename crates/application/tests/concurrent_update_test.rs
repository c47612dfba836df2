//! 并发修改同一会话时，各自的修改都要保留下来

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use application::events::{SendMessage, SendableType};
use application::memory::{
    InMemoryConversationRepository, InMemoryDirectory, InMemoryMessageRepository,
};
use application::{
    ChatService, ChatServiceDependencies, ConversationRepository, ConversationService,
    ConversationServiceDependencies, HistoryLimits, ManualClock, RoomManager,
};
use async_trait::async_trait;
use domain::{AdId, Conversation, ConversationId, ConversationUpdate, RepositoryError, UserId};
use time::macros::datetime;
use tokio::sync::Barrier;

/// 让两个并发请求都先读到同一份旧快照，再各自写回
struct InterleavingConversations {
    inner: InMemoryConversationRepository,
    barrier: Barrier,
    armed: AtomicBool,
}

impl InterleavingConversations {
    fn new() -> Self {
        Self {
            inner: InMemoryConversationRepository::new(),
            barrier: Barrier::new(2),
            armed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ConversationRepository for InterleavingConversations {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        self.inner.create(conversation).await
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let found = self.inner.find_by_id(id).await;
        if self.armed.load(Ordering::SeqCst) {
            self.barrier.wait().await;
        }
        found
    }

    async fn find_by_triple(
        &self,
        ad_id: AdId,
        owner_id: UserId,
        buyer_id: UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        self.inner.find_by_triple(ad_id, owner_id, buyer_id).await
    }

    async fn apply(
        &self,
        id: ConversationId,
        update: ConversationUpdate,
    ) -> Result<Conversation, RepositoryError> {
        self.inner.apply(id, update).await
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        self.inner.list_for_user(user_id, limit, offset).await
    }

    async fn total_unread_for(&self, user_id: UserId) -> Result<u64, RepositoryError> {
        self.inner.total_unread_for(user_id).await
    }
}

struct Setup {
    conversations: Arc<InterleavingConversations>,
    chat: Arc<ChatService>,
    conversation_service: ConversationService,
    conversation: Conversation,
}

async fn setup() -> Setup {
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
    let conversations = Arc::new(InterleavingConversations::new());
    let messages = Arc::new(InMemoryMessageRepository::new());
    let chat = Arc::new(ChatService::new(ChatServiceDependencies {
        conversations: conversations.clone(),
        messages: messages.clone(),
        rooms: Arc::new(RoomManager::new()),
        clock: clock.clone(),
        history: HistoryLimits::default(),
    }));
    let conversation_service = ConversationService::new(ConversationServiceDependencies {
        conversations: conversations.clone(),
        messages,
        ads: Arc::new(InMemoryDirectory::new()),
        chat: chat.clone(),
        clock,
    });

    let conversation = Conversation::start(
        ConversationId::generate(),
        AdId::generate(),
        UserId::generate(),
        UserId::generate(),
        datetime!(2024-05-01 09:00 UTC),
    )
    .unwrap();
    let conversation = conversations.create(conversation).await.unwrap();

    Setup {
        conversations,
        chat,
        conversation_service,
        conversation,
    }
}

fn text(conversation_id: ConversationId, text: &str) -> SendMessage {
    SendMessage {
        conversation_id,
        text: Some(text.into()),
        attachments: Vec::new(),
        client_temp_id: None,
        message_type: SendableType::Text,
        audio: None,
    }
}

#[tokio::test]
async fn crossing_messages_keep_both_unread_counters() {
    let s = setup().await;
    let owner = s.conversation.owner_id;
    let buyer = s.conversation.buyer_id;

    s.conversations.armed.store(true, Ordering::SeqCst);
    let (from_owner, from_buyer) = tokio::join!(
        s.chat.send(owner, text(s.conversation.id, "hello")),
        s.chat.send(buyer, text(s.conversation.id, "hi")),
    );
    s.conversations.armed.store(false, Ordering::SeqCst);
    from_owner.unwrap();
    from_buyer.unwrap();

    let stored = s
        .conversations
        .find_by_id(s.conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.unread_for(owner), 1);
    assert_eq!(stored.unread_for(buyer), 1);
    assert!(stored.last_message.is_some());
}

#[tokio::test]
async fn block_survives_a_concurrent_message() {
    let s = setup().await;
    let owner = s.conversation.owner_id;
    let buyer = s.conversation.buyer_id;

    s.conversations.armed.store(true, Ordering::SeqCst);
    let (blocked, sent) = tokio::join!(
        s.conversation_service.block(owner, s.conversation.id),
        s.chat.send(buyer, text(s.conversation.id, "still there?")),
    );
    s.conversations.armed.store(false, Ordering::SeqCst);
    blocked.unwrap();
    sent.unwrap();

    let stored = s
        .conversations
        .find_by_id(s.conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_blocked);
    assert_eq!(stored.blocked_by, Some(owner));
    assert_eq!(stored.unread_for(owner), 1);

    let err = s
        .chat
        .send(buyer, text(s.conversation.id, "hello?"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONVERSATION_BLOCKED");
}
