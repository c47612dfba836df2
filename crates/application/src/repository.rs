//! 存储适配器接口
//!
//! 核心只通过这些接口访问持久化数据，具体实现见 `memory` 模块和
//! infrastructure 中的 PostgreSQL 实现。

use async_trait::async_trait;
use domain::{
    AdId, Call, CallId, Conversation, ConversationId, ConversationUpdate, Message, MessageId,
    RepositoryError, Timestamp, User, UserId,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// (ad, owner, buyer) 已存在时返回 `RepositoryError::Conflict`
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError>;
    async fn find_by_id(&self, id: ConversationId)
        -> Result<Option<Conversation>, RepositoryError>;
    async fn find_by_triple(
        &self,
        ad_id: AdId,
        owner_id: UserId,
        buyer_id: UserId,
    ) -> Result<Option<Conversation>, RepositoryError>;
    /// 原子地应用一次局部修改并返回修改后的会话，不存在时返回 `NotFound`
    async fn apply(
        &self,
        id: ConversationId,
        update: ConversationUpdate,
    ) -> Result<Conversation, RepositoryError>;
    /// 用户未隐藏的会话，按 lastMessageAt 倒序
    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>, RepositoryError>;
    async fn total_unread_for(&self, user_id: UserId) -> Result<u64, RepositoryError>;
}

/// 跨会话检索用户收发过的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSearch {
    pub user_id: UserId,
    /// 按字面匹配，不区分大小写
    pub text: String,
    pub conversation_id: Option<ConversationId>,
    /// 只返回排在这条消息之后（更早）的结果
    pub before: Option<(Timestamp, MessageId)>,
    pub limit: u32,
}

impl MessageSearch {
    /// 结果按 (created_at, id) 倒序，游标位置为开区间
    pub fn matches(&self, message: &Message) -> bool {
        (message.sender_id == self.user_id || message.recipient_id == self.user_id)
            && !message.is_deleted
            && self
                .conversation_id
                .is_none_or(|id| message.conversation_id == id)
            && self
                .before
                .is_none_or(|cursor| (message.created_at, message.id) < cursor)
            && message
                .text
                .to_lowercase()
                .contains(&self.text.to_lowercase())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError>;
    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;
    async fn save(&self, message: &Message) -> Result<(), RepositoryError>;
    async fn find_by_ids(
        &self,
        conversation_id: ConversationId,
        ids: &[MessageId],
    ) -> Result<Vec<Message>, RepositoryError>;
    /// 发给 `recipient_id` 且尚未已读的消息
    async fn find_unread_for(
        &self,
        conversation_id: ConversationId,
        recipient_id: UserId,
    ) -> Result<Vec<Message>, RepositoryError>;
    /// 最新的在前；`before` 为开区间
    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        before: Option<Timestamp>,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError>;
    /// 最新的在前，最多 `query.limit` 条
    async fn search(&self, query: &MessageSearch) -> Result<Vec<Message>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallRepository: Send + Sync {
    async fn create(&self, call: Call) -> Result<Call, RepositoryError>;
    async fn find_by_id(&self, id: CallId) -> Result<Option<Call>, RepositoryError>;
    async fn update(&self, call: &Call) -> Result<(), RepositoryError>;
    /// 最新的在前
    async fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Call>, RepositoryError>;
}

/// 账号由外部系统维护，这里只做身份解析
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError>;
}

/// 广告归属查询
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdDirectory: Send + Sync {
    async fn find_owner(&self, ad_id: AdId) -> Result<Option<UserId>, RepositoryError>;
}
