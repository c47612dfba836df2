use std::sync::Arc;

use domain::{
    Conversation, ConversationId, ConversationUpdate, Message, MessageDraft, MessageId,
    Timestamp, UserId,
};
use serde::{Deserialize, Serialize};

use crate::{
    clock::Clock,
    error::ApplicationError,
    events::{
        ConversationJoined, JoinConversation, MarkRead, MessageDelivered, MessageNew,
        MessageReceived, MessagesRead, SendMessage, ServerEvent, TypingNotice, TypingSignal,
    },
    repository::{ConversationRepository, MessageRepository, MessageSearch},
    rooms::{Channel, ConnectionContext, RoomManager},
};

/// 历史消息分页上限
#[derive(Debug, Clone, Copy)]
pub struct HistoryLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 200,
        }
    }
}

impl HistoryLimits {
    pub fn clamp(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

/// 按时间正序的一页历史消息
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

const SEARCH_TEXT_MAX_CHARS: usize = 100;
const SEARCH_DEFAULT_LIMIT: u32 = 20;
const SEARCH_MAX_LIMIT: u32 = 100;

/// 消息检索参数，`cursor` 为上一页最后一条消息的 id
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMessagesRequest {
    #[serde(default)]
    pub q: String,
    pub conversation_id: Option<ConversationId>,
    pub limit: Option<u32>,
    pub cursor: Option<MessageId>,
}

/// 检索结果，最新的在前
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSearchPage {
    pub query: String,
    pub messages: Vec<Message>,
    pub next_cursor: Option<MessageId>,
    pub has_more: bool,
}

pub struct ChatServiceDependencies {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub rooms: Arc<RoomManager>,
    pub clock: Arc<dyn Clock>,
    pub history: HistoryLimits,
}

/// 消息分发：发送、送达回执、已读、正在输入。
pub struct ChatService {
    deps: ChatServiceDependencies,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        Self { deps }
    }

    pub fn now(&self) -> Timestamp {
        self.deps.clock.now()
    }

    pub async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ApplicationError> {
        self.deps
            .conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(ApplicationError::conversation_not_found)
    }

    /// 加载会话并确认 `user_id` 是参与者
    pub async fn conversation_for(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ApplicationError> {
        let conversation = self.load_conversation(conversation_id).await?;
        conversation.ensure_participant(user_id)?;
        Ok(conversation)
    }

    pub async fn join(
        &self,
        ctx: ConnectionContext,
        request: JoinConversation,
    ) -> Result<(), ApplicationError> {
        let conversation = self
            .conversation_for(ctx.user_id, request.conversation_id)
            .await?;

        self.deps
            .rooms
            .join_conversation(ctx.connection_id, conversation.id)
            .await;
        self.deps
            .rooms
            .send_to(
                ctx.connection_id,
                ServerEvent::ConversationJoined(ConversationJoined {
                    conversation_id: conversation.id,
                }),
            )
            .await;
        tracing::info!(
            user_id = %ctx.user_id,
            conversation_id = %conversation.id,
            connection_id = %ctx.connection_id,
            "加入会话"
        );

        if request.mark_as_read {
            let unread = self
                .deps
                .messages
                .find_unread_for(conversation.id, ctx.user_id)
                .await?;
            self.apply_read(conversation, ctx.user_id, unread).await?;
        }
        Ok(())
    }

    pub async fn send(
        &self,
        sender_id: UserId,
        request: SendMessage,
    ) -> Result<Message, ApplicationError> {
        let conversation = self.load_conversation(request.conversation_id).await?;
        conversation.ensure_can_send(sender_id)?;
        let recipient_id = conversation
            .other_participant(sender_id)
            .ok_or(domain::DomainError::NotParticipant)?;

        let draft = MessageDraft {
            message_type: request.message_type.into(),
            text: request.text.unwrap_or_default(),
            attachments: request.attachments,
            audio: request.audio,
            client_temp_id: request.client_temp_id,
        };
        let message = Message::compose(
            MessageId::generate(),
            conversation.id,
            sender_id,
            recipient_id,
            draft,
            self.now(),
        )?;

        self.append_message(conversation, message).await
    }

    /// 持久化路径：写入消息、更新会话摘要和未读数，然后广播 `message:new`。
    /// 不经过限流，通话摘要也走这里。
    pub async fn append_message(
        &self,
        conversation: Conversation,
        message: Message,
    ) -> Result<Message, ApplicationError> {
        let message = self.deps.messages.create(message).await?;
        let conversation = self
            .deps
            .conversations
            .apply(conversation.id, ConversationUpdate::message_recorded(&message))
            .await?;
        let unread = conversation.unread_for(message.recipient_id);

        tracing::info!(
            conversation_id = %conversation.id,
            message_id = %message.id,
            sender_id = %message.sender_id,
            message_type = message.message_type.as_str(),
            recipient_unread = unread,
            "消息已保存"
        );

        self.deps
            .rooms
            .room(conversation.id)
            .publish(ServerEvent::MessageNew(MessageNew {
                conversation_id: conversation.id,
                message: message.clone(),
            }))
            .await;
        Ok(message)
    }

    /// 接收方确认送达。发送方自己确认时什么也不做，返回 `None`。
    pub async fn acknowledge_delivery(
        &self,
        user_id: UserId,
        request: MessageReceived,
    ) -> Result<Option<Message>, ApplicationError> {
        let conversation = self
            .conversation_for(user_id, request.conversation_id)
            .await?;
        let mut message = self
            .deps
            .messages
            .find_by_id(request.message_id)
            .await?
            .filter(|message| message.conversation_id == conversation.id)
            .ok_or_else(ApplicationError::message_not_found)?;

        if message.recipient_id != user_id {
            tracing::debug!(user_id = %user_id, message_id = %message.id, "非接收方的送达确认，忽略");
            return Ok(None);
        }

        let now = self.now();
        if !message.mark_delivered(now) {
            return Ok(None);
        }
        self.deps.messages.save(&message).await?;

        self.deps
            .rooms
            .room(conversation.id)
            .publish(ServerEvent::MessageDelivered(MessageDelivered {
                conversation_id: conversation.id,
                message_id: message.id,
                delivered_at: now,
            }))
            .await;
        Ok(Some(message))
    }

    /// 标记指定消息为已读，返回本次新变为已读的消息 id
    pub async fn mark_read(
        &self,
        user_id: UserId,
        request: MarkRead,
    ) -> Result<Vec<MessageId>, ApplicationError> {
        let conversation = self
            .conversation_for(user_id, request.conversation_id)
            .await?;
        let candidates = self
            .deps
            .messages
            .find_by_ids(conversation.id, &request.message_ids)
            .await?;
        self.apply_read(conversation, user_id, candidates).await
    }

    /// 标记会话中所有发给 `user_id` 的未读消息
    pub async fn mark_all_read(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessageId>, ApplicationError> {
        let conversation = self.conversation_for(user_id, conversation_id).await?;
        let unread = self
            .deps
            .messages
            .find_unread_for(conversation.id, user_id)
            .await?;
        self.apply_read(conversation, user_id, unread).await
    }

    async fn apply_read(
        &self,
        conversation: Conversation,
        reader_id: UserId,
        candidates: Vec<Message>,
    ) -> Result<Vec<MessageId>, ApplicationError> {
        let now = self.now();
        let mut newly_read = Vec::new();
        for mut message in candidates {
            if message.recipient_id != reader_id {
                continue;
            }
            if message.mark_read(now) {
                self.deps.messages.save(&message).await?;
                newly_read.push(message.id);
            }
        }

        conversation.ensure_participant(reader_id)?;
        self.deps
            .conversations
            .apply(
                conversation.id,
                ConversationUpdate::ReadBy {
                    user_id: reader_id,
                    at: now,
                },
            )
            .await?;

        if !newly_read.is_empty() {
            tracing::info!(
                user_id = %reader_id,
                conversation_id = %conversation.id,
                count = newly_read.len(),
                "消息已读"
            );
            self.deps
                .rooms
                .room(conversation.id)
                .publish(ServerEvent::MessageRead(MessagesRead {
                    conversation_id: conversation.id,
                    message_ids: newly_read.clone(),
                    reader_id,
                    read_at: now,
                }))
                .await;
        }
        Ok(newly_read)
    }

    /// 转发正在输入状态，不落库。连接必须已加入会话。
    pub async fn typing(
        &self,
        ctx: ConnectionContext,
        signal: TypingSignal,
        started: bool,
    ) -> Result<(), ApplicationError> {
        let channel = Channel::Conversation(signal.conversation_id);
        if !self.deps.rooms.is_subscribed(ctx.connection_id, channel).await {
            return Err(ApplicationError::not_joined());
        }

        let notice = TypingNotice {
            conversation_id: signal.conversation_id,
            user_id: ctx.user_id,
        };
        let event = if started {
            ServerEvent::TypingStart(notice)
        } else {
            ServerEvent::TypingStop(notice)
        };
        self.deps
            .rooms
            .room(signal.conversation_id)
            .publish_except(ctx.connection_id, event)
            .await;
        Ok(())
    }

    pub async fn get_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        before: Option<Timestamp>,
        limit: Option<u32>,
    ) -> Result<MessagePage, ApplicationError> {
        let conversation = self.conversation_for(user_id, conversation_id).await?;
        let limit = self.deps.history.clamp(limit);

        let mut messages = self
            .deps
            .messages
            .list_recent(conversation.id, before, limit + 1)
            .await?;
        let has_more = messages.len() > limit as usize;
        messages.truncate(limit as usize);
        messages.reverse();

        Ok(MessagePage { messages, has_more })
    }

    /// 在用户收发过的消息里按文本检索，可限定单个会话
    pub async fn search_messages(
        &self,
        user_id: UserId,
        request: SearchMessagesRequest,
    ) -> Result<MessageSearchPage, ApplicationError> {
        let text = request.q.trim();
        let chars = text.chars().count();
        if chars == 0 || chars > SEARCH_TEXT_MAX_CHARS {
            return Err(ApplicationError::invalid_field(
                "q",
                format!("must be between 1 and {SEARCH_TEXT_MAX_CHARS} characters"),
            ));
        }
        let limit = request.limit.unwrap_or(SEARCH_DEFAULT_LIMIT);
        if !(1..=SEARCH_MAX_LIMIT).contains(&limit) {
            return Err(ApplicationError::invalid_field(
                "limit",
                format!("must be between 1 and {SEARCH_MAX_LIMIT}"),
            ));
        }
        if let Some(conversation_id) = request.conversation_id {
            self.conversation_for(user_id, conversation_id).await?;
        }
        let before = match request.cursor {
            Some(cursor) => {
                let anchor = self
                    .deps
                    .messages
                    .find_by_id(cursor)
                    .await?
                    .filter(|m| m.sender_id == user_id || m.recipient_id == user_id)
                    .ok_or_else(|| ApplicationError::invalid_field("cursor", "unknown message"))?;
                Some((anchor.created_at, anchor.id))
            }
            None => None,
        };

        let mut messages = self
            .deps
            .messages
            .search(&MessageSearch {
                user_id,
                text: text.to_owned(),
                conversation_id: request.conversation_id,
                before,
                limit: limit + 1,
            })
            .await?;
        let has_more = messages.len() > limit as usize;
        messages.truncate(limit as usize);
        let next_cursor = if has_more {
            messages.last().map(|m| m.id)
        } else {
            None
        };
        tracing::debug!(user_id = %user_id, results = messages.len(), has_more, "消息检索");

        Ok(MessageSearchPage {
            query: text.to_owned(),
            messages,
            next_cursor,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::InMemoryConversationRepository;
    use crate::repository::MockMessageRepository;
    use domain::{AdId, RepositoryError};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn storage_failure_surfaces_as_internal_error_without_broadcast() {
        let conversations = Arc::new(InMemoryConversationRepository::new());
        let owner = UserId::generate();
        let buyer = UserId::generate();
        let conversation = Conversation::start(
            ConversationId::generate(),
            AdId::generate(),
            owner,
            buyer,
            Timestamp::now_utc(),
        )
        .unwrap();
        conversations.create(conversation.clone()).await.unwrap();

        let mut messages = MockMessageRepository::new();
        messages
            .expect_create()
            .times(1)
            .returning(|_| Err(RepositoryError::storage("connection reset")));

        let rooms = Arc::new(RoomManager::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = rooms.register(owner, tx).await;
        rooms.join_conversation(ctx.connection_id, conversation.id).await;

        let service = ChatService::new(ChatServiceDependencies {
            conversations: conversations.clone(),
            messages: Arc::new(messages),
            rooms,
            clock: Arc::new(SystemClock),
            history: HistoryLimits::default(),
        });

        let request = SendMessage {
            conversation_id: conversation.id,
            text: Some("hello".into()),
            attachments: Vec::new(),
            client_temp_id: None,
            message_type: crate::events::SendableType::Text,
            audio: None,
        };
        let err = service.send(buyer, request).await.unwrap_err();

        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(rx.try_recv().is_err());
        let stored = conversations.find_by_id(conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.unread_for(owner), 0);
    }

    #[test]
    fn history_limit_is_clamped() {
        let limits = HistoryLimits {
            default_limit: 50,
            max_limit: 200,
        };
        assert_eq!(limits.clamp(None), 50);
        assert_eq!(limits.clamp(Some(0)), 1);
        assert_eq!(limits.clamp(Some(500)), 200);
    }
}
