use std::sync::Arc;

use domain::{
    AdId, Conversation, ConversationId, ConversationUpdate, DomainError, LastMessage, Message,
    MessageId, RepositoryError, Timestamp, UserId, VoiceCallConsent,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    clock::Clock,
    error::ApplicationError,
    events::{SendMessage, SendableType},
    repository::{AdDirectory, ConversationRepository, MessageRepository},
    services::ChatService,
};

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StartConversationRequest {
    pub ad_id: AdId,
    #[serde(default, deserialize_with = "crate::events::trimmed_text")]
    #[validate(length(max = 2000, message = "at most 2000 characters"))]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReportMessageRequest {
    #[validate(length(min = 3, max = 500, message = "must be between 3 and 500 characters"))]
    pub reason: String,
}

/// 以某位参与者视角呈现的会话
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: ConversationId,
    pub ad_id: AdId,
    pub owner_id: UserId,
    pub buyer_id: UserId,
    pub other_participant_id: UserId,
    pub last_message: Option<LastMessage>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<Timestamp>,
    pub unread_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_read_at: Option<Timestamp>,
    pub is_blocked: bool,
    pub blocked_by: Option<UserId>,
    pub voice_call_consent: VoiceCallConsent,
    pub other_voice_call_consent: VoiceCallConsent,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

impl ConversationView {
    pub fn for_user(conversation: &Conversation, user_id: UserId) -> Self {
        let other = conversation
            .other_participant(user_id)
            .unwrap_or(conversation.owner_id);
        Self {
            id: conversation.id,
            ad_id: conversation.ad_id,
            owner_id: conversation.owner_id,
            buyer_id: conversation.buyer_id,
            other_participant_id: other,
            last_message: conversation.last_message.clone(),
            last_message_at: conversation.last_message_at,
            unread_count: conversation.unread_for(user_id),
            last_read_at: conversation.last_read_at_for(user_id),
            is_blocked: conversation.is_blocked,
            blocked_by: conversation.blocked_by,
            voice_call_consent: conversation.voice_call_consent_for(user_id),
            other_voice_call_consent: conversation.voice_call_consent_for(other),
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedConversation {
    pub conversation: ConversationView,
    pub created: bool,
}

pub struct ConversationServiceDependencies {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub ads: Arc<dyn AdDirectory>,
    pub chat: Arc<ChatService>,
    pub clock: Arc<dyn Clock>,
}

/// 会话管理：创建、列表、屏蔽、隐藏、语音授权、举报
pub struct ConversationService {
    deps: ConversationServiceDependencies,
}

impl ConversationService {
    pub fn new(deps: ConversationServiceDependencies) -> Self {
        Self { deps }
    }

    /// 买家就一条广告联系发布者。同一 (广告, 发布者, 买家) 只有一个会话。
    pub async fn start_conversation(
        &self,
        buyer_id: UserId,
        request: StartConversationRequest,
    ) -> Result<StartedConversation, ApplicationError> {
        let owner_id = self
            .deps
            .ads
            .find_owner(request.ad_id)
            .await?
            .ok_or_else(ApplicationError::ad_not_found)?;
        if owner_id == buyer_id {
            return Err(DomainError::SelfConversation.into());
        }

        let (conversation, created) = match self
            .deps
            .conversations
            .find_by_triple(request.ad_id, owner_id, buyer_id)
            .await?
        {
            Some(existing) => (existing, false),
            None => self.create(request.ad_id, owner_id, buyer_id).await?,
        };

        let text = request.text.filter(|text| !text.trim().is_empty());
        let conversation = match text {
            Some(text) => {
                self.deps
                    .chat
                    .send(
                        buyer_id,
                        SendMessage {
                            conversation_id: conversation.id,
                            text: Some(text),
                            attachments: Vec::new(),
                            client_temp_id: None,
                            message_type: SendableType::Text,
                            audio: None,
                        },
                    )
                    .await?;
                self.deps.chat.load_conversation(conversation.id).await?
            }
            None => conversation,
        };

        Ok(StartedConversation {
            conversation: ConversationView::for_user(&conversation, buyer_id),
            created,
        })
    }

    async fn create(
        &self,
        ad_id: AdId,
        owner_id: UserId,
        buyer_id: UserId,
    ) -> Result<(Conversation, bool), ApplicationError> {
        let conversation = Conversation::start(
            ConversationId::generate(),
            ad_id,
            owner_id,
            buyer_id,
            self.deps.clock.now(),
        )?;
        match self.deps.conversations.create(conversation).await {
            Ok(conversation) => {
                tracing::info!(
                    conversation_id = %conversation.id,
                    ad_id = %ad_id,
                    buyer_id = %buyer_id,
                    "创建会话"
                );
                Ok((conversation, true))
            }
            // 并发创建时唯一约束冲突，读回已有会话
            Err(RepositoryError::Conflict) => {
                let existing = self
                    .deps
                    .conversations
                    .find_by_triple(ad_id, owner_id, buyer_id)
                    .await?
                    .ok_or(RepositoryError::Conflict)?;
                Ok((existing, false))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationView>, ApplicationError> {
        let conversations = self
            .deps
            .conversations
            .list_for_user(user_id, limit, offset)
            .await?;
        Ok(conversations
            .iter()
            .map(|conversation| ConversationView::for_user(conversation, user_id))
            .collect())
    }

    pub async fn get(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationView, ApplicationError> {
        let conversation = self.deps.chat.conversation_for(user_id, conversation_id).await?;
        Ok(ConversationView::for_user(&conversation, user_id))
    }

    pub async fn total_unread(&self, user_id: UserId) -> Result<u64, ApplicationError> {
        Ok(self.deps.conversations.total_unread_for(user_id).await?)
    }

    pub async fn block(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationView, ApplicationError> {
        self.update(user_id, conversation_id, |conversation, now| {
            conversation.block(user_id, now)
        })
        .await
    }

    pub async fn unblock(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationView, ApplicationError> {
        self.update(user_id, conversation_id, |conversation, now| {
            conversation.unblock(user_id, now)
        })
        .await
    }

    pub async fn hide(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationView, ApplicationError> {
        self.update(user_id, conversation_id, |conversation, now| {
            conversation.hide_for(user_id, now)
        })
        .await
    }

    pub async fn set_voice_call_consent(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        allowed: bool,
    ) -> Result<ConversationView, ApplicationError> {
        self.update(user_id, conversation_id, |conversation, now| {
            conversation.set_voice_call_consent(user_id, allowed, now)
        })
        .await
    }

    /// 先在读到的快照上校验并生成修改，再交给存储原子地应用
    async fn update<F>(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        change: F,
    ) -> Result<ConversationView, ApplicationError>
    where
        F: FnOnce(&mut Conversation, Timestamp) -> Result<ConversationUpdate, DomainError>,
    {
        let mut snapshot = self.deps.chat.conversation_for(user_id, conversation_id).await?;
        let update = change(&mut snapshot, self.deps.clock.now())?;
        let conversation = self
            .deps
            .conversations
            .apply(snapshot.id, update)
            .await?;
        tracing::debug!(user_id = %user_id, conversation_id = %conversation.id, "会话已更新");
        Ok(ConversationView::for_user(&conversation, user_id))
    }

    pub async fn report_message(
        &self,
        user_id: UserId,
        message_id: MessageId,
        request: ReportMessageRequest,
    ) -> Result<Message, ApplicationError> {
        let mut message = self
            .deps
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(ApplicationError::message_not_found)?;
        self.deps
            .chat
            .conversation_for(user_id, message.conversation_id)
            .await?;

        message.report(user_id, &request.reason, self.deps.clock.now())?;
        self.deps.messages.save(&message).await?;
        tracing::warn!(
            message_id = %message.id,
            reporter_id = %user_id,
            "消息被举报"
        );
        Ok(message)
    }
}
