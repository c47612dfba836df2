//! 内存版存储适配器，用于测试和本地调试。

use std::collections::HashMap;

use async_trait::async_trait;
use domain::{
    AdId, Call, CallId, Conversation, ConversationId, ConversationUpdate, Message, MessageId,
    MessageStatus, RepositoryError, Timestamp, User, UserId,
};
use tokio::sync::RwLock;

use crate::repository::{
    AdDirectory, CallRepository, ConversationRepository, MessageRepository, MessageSearch,
    UserRepository,
};

#[derive(Default)]
pub struct InMemoryConversationRepository {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let mut conversations = self.conversations.write().await;
        let duplicate = conversations.values().any(|existing| {
            existing.ad_id == conversation.ad_id
                && existing.owner_id == conversation.owner_id
                && existing.buyer_id == conversation.buyer_id
        });
        if duplicate || conversations.contains_key(&conversation.id) {
            return Err(RepositoryError::Conflict);
        }
        conversations.insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn find_by_triple(
        &self,
        ad_id: AdId,
        owner_id: UserId,
        buyer_id: UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self
            .conversations
            .read()
            .await
            .values()
            .find(|c| c.ad_id == ad_id && c.owner_id == owner_id && c.buyer_id == buyer_id)
            .cloned())
    }

    async fn apply(
        &self,
        id: ConversationId,
        update: ConversationUpdate,
    ) -> Result<Conversation, RepositoryError> {
        // 整个读改写在写锁内完成
        let mut conversations = self.conversations.write().await;
        let conversation = conversations.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        conversation
            .apply(&update)
            .map_err(|err| RepositoryError::storage(err.to_string()))?;
        Ok(conversation.clone())
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        let mut visible: Vec<Conversation> = conversations
            .values()
            .filter(|c| c.is_participant(user_id) && !c.is_hidden_for(user_id))
            .cloned()
            .collect();
        visible.sort_by(|a, b| {
            b.last_message_at
                .unwrap_or(b.created_at)
                .cmp(&a.last_message_at.unwrap_or(a.created_at))
        });
        Ok(visible
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn total_unread_for(&self, user_id: UserId) -> Result<u64, RepositoryError> {
        Ok(self
            .conversations
            .read()
            .await
            .values()
            .filter(|c| c.is_participant(user_id) && !c.is_hidden_for(user_id))
            .map(|c| u64::from(c.unread_for(user_id)))
            .sum())
    }
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: RwLock<HashMap<MessageId, Message>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某会话的全部消息，按时间顺序
    pub async fn all_in(&self, conversation_id: ConversationId) -> Vec<Message> {
        let mut items: Vec<Message> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        items.sort_by_key(|m| m.created_at);
        items
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id) {
            return Err(RepositoryError::Conflict);
        }
        messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn save(&self, message: &Message) -> Result<(), RepositoryError> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&message.id) {
            Some(existing) => {
                *existing = message.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_by_ids(
        &self,
        conversation_id: ConversationId,
        ids: &[MessageId],
    ) -> Result<Vec<Message>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| messages.get(id))
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn find_unread_for(
        &self,
        conversation_id: ConversationId,
        recipient_id: UserId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let mut unread: Vec<Message> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.recipient_id == recipient_id
                    && m.status != MessageStatus::Read
            })
            .cloned()
            .collect();
        unread.sort_by_key(|m| m.created_at);
        Ok(unread)
    }

    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        before: Option<Timestamp>,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let mut items: Vec<Message> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| m.conversation_id == conversation_id && !m.is_deleted)
            .filter(|m| before.is_none_or(|before| m.created_at < before))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn search(&self, query: &MessageSearch) -> Result<Vec<Message>, RepositoryError> {
        let mut items: Vec<Message> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        items.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        items.truncate(query.limit as usize);
        Ok(items)
    }
}

#[derive(Default)]
pub struct InMemoryCallRepository {
    calls: RwLock<HashMap<CallId, Call>>,
}

impl InMemoryCallRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallRepository for InMemoryCallRepository {
    async fn create(&self, call: Call) -> Result<Call, RepositoryError> {
        let mut calls = self.calls.write().await;
        if calls.contains_key(&call.id) {
            return Err(RepositoryError::Conflict);
        }
        calls.insert(call.id, call.clone());
        Ok(call)
    }

    async fn find_by_id(&self, id: CallId) -> Result<Option<Call>, RepositoryError> {
        Ok(self.calls.read().await.get(&id).cloned())
    }

    async fn update(&self, call: &Call) -> Result<(), RepositoryError> {
        let mut calls = self.calls.write().await;
        match calls.get_mut(&call.id) {
            Some(existing) => {
                *existing = call.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Call>, RepositoryError> {
        let mut items: Vec<Call> = self
            .calls
            .read()
            .await
            .values()
            .filter(|c| c.conversation_id == conversation_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

/// 用户与广告的内存目录
#[derive(Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<UserId, User>>,
    ads: RwLock<HashMap<AdId, UserId>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn insert_ad(&self, ad_id: AdId, owner_id: UserId) {
        self.ads.write().await.insert(ad_id, owner_id);
    }
}

#[async_trait]
impl UserRepository for InMemoryDirectory {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        Ok(self.users.read().await.get(&id).cloned())
    }
}

#[async_trait]
impl AdDirectory for InMemoryDirectory {
    async fn find_owner(&self, ad_id: AdId) -> Result<Option<UserId>, RepositoryError> {
        Ok(self.ads.read().await.get(&ad_id).copied())
    }
}
