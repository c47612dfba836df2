use serde::{Deserialize, Serialize};

use crate::call::CallSummary;
use crate::errors::DomainError;
use crate::message::{Message, MessageType};
use crate::value_objects::{AdId, ConversationId, Timestamp, UserId};

/// 会话中的两个角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantRole {
    Owner,
    Buyer,
}

/// 按参与者存放的字段。会话恰好两方，所以结构上就只有两个槽位，
/// 不存在缺失或多余的条目。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantMap<T> {
    pub owner: T,
    pub buyer: T,
}

impl<T> ParticipantMap<T> {
    pub fn new(owner: T, buyer: T) -> Self {
        Self { owner, buyer }
    }

    pub fn get(&self, role: ParticipantRole) -> &T {
        match role {
            ParticipantRole::Owner => &self.owner,
            ParticipantRole::Buyer => &self.buyer,
        }
    }

    pub fn get_mut(&mut self, role: ParticipantRole) -> &mut T {
        match role {
            ParticipantRole::Owner => &mut self.owner,
            ParticipantRole::Buyer => &mut self.buyer,
        }
    }
}

/// 会话列表里展示的最后一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub text: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<CallSummary>,
}

impl LastMessage {
    pub fn from_message(message: &Message) -> Self {
        Self {
            text: message.text.clone(),
            message_type: message.message_type,
            sender_id: message.sender_id,
            timestamp: message.created_at,
            audio_duration: message.audio.as_ref().and_then(|audio| audio.duration),
            call: message.call.clone(),
        }
    }
}

/// 语音通话授权记录，缺省为未授权
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceCallConsent {
    pub allowed: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub changed_at: Option<Timestamp>,
    #[serde(default)]
    pub changed_by: Option<UserId>,
}

/// 针对单个会话的局部修改。
///
/// 存储层只改动各自涉及的字段，并在存储内部原子地完成读改写，
/// 两位参与者并发操作时不会互相覆盖计数或屏蔽状态。
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationUpdate {
    /// 新消息：接收方未读加一，双方取消隐藏，摘要只会被更新的消息替换
    MessageRecorded {
        recipient_id: UserId,
        last_message: LastMessage,
    },
    ReadBy { user_id: UserId, at: Timestamp },
    /// 已处于屏蔽状态时保留原屏蔽者
    Blocked { by: UserId, at: Timestamp },
    /// 只有屏蔽者本人的解除会生效
    Unblocked { by: UserId, at: Timestamp },
    HiddenFor { user_id: UserId, at: Timestamp },
    VoiceCallConsent {
        user_id: UserId,
        consent: VoiceCallConsent,
        at: Timestamp,
    },
}

impl ConversationUpdate {
    pub fn message_recorded(message: &Message) -> Self {
        ConversationUpdate::MessageRecorded {
            recipient_id: message.recipient_id,
            last_message: LastMessage::from_message(message),
        }
    }
}

/// 围绕一条广告、在发布者与买家之间唯一的会话。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub ad_id: AdId,
    pub owner_id: UserId,
    pub buyer_id: UserId,
    pub last_message: Option<LastMessage>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<Timestamp>,
    pub unread: ParticipantMap<u32>,
    pub last_read_at: ParticipantMap<Option<Timestamp>>,
    pub is_blocked: bool,
    pub blocked_by: Option<UserId>,
    pub hidden: ParticipantMap<bool>,
    pub voice_call_consent: ParticipantMap<VoiceCallConsent>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

impl Conversation {
    pub fn start(
        id: ConversationId,
        ad_id: AdId,
        owner_id: UserId,
        buyer_id: UserId,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        if owner_id == buyer_id {
            return Err(DomainError::SelfConversation);
        }
        Ok(Self {
            id,
            ad_id,
            owner_id,
            buyer_id,
            last_message: None,
            last_message_at: None,
            unread: ParticipantMap::default(),
            last_read_at: ParticipantMap::default(),
            is_blocked: false,
            blocked_by: None,
            hidden: ParticipantMap::default(),
            voice_call_consent: ParticipantMap::default(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn participants(&self) -> [UserId; 2] {
        [self.owner_id, self.buyer_id]
    }

    pub fn role_of(&self, user_id: UserId) -> Option<ParticipantRole> {
        if user_id == self.owner_id {
            Some(ParticipantRole::Owner)
        } else if user_id == self.buyer_id {
            Some(ParticipantRole::Buyer)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.role_of(user_id).is_some()
    }

    pub fn ensure_participant(&self, user_id: UserId) -> Result<ParticipantRole, DomainError> {
        self.role_of(user_id).ok_or(DomainError::NotParticipant)
    }

    pub fn other_participant(&self, user_id: UserId) -> Option<UserId> {
        match self.role_of(user_id)? {
            ParticipantRole::Owner => Some(self.buyer_id),
            ParticipantRole::Buyer => Some(self.owner_id),
        }
    }

    pub fn unread_for(&self, user_id: UserId) -> u32 {
        self.role_of(user_id)
            .map(|role| *self.unread.get(role))
            .unwrap_or(0)
    }

    pub fn set_unread_for(&mut self, user_id: UserId, count: u32) -> Result<(), DomainError> {
        let role = self.ensure_participant(user_id)?;
        *self.unread.get_mut(role) = count;
        Ok(())
    }

    pub fn last_read_at_for(&self, user_id: UserId) -> Option<Timestamp> {
        self.role_of(user_id)
            .and_then(|role| *self.last_read_at.get(role))
    }

    pub fn is_hidden_for(&self, user_id: UserId) -> bool {
        self.role_of(user_id)
            .map(|role| *self.hidden.get(role))
            .unwrap_or(false)
    }

    pub fn voice_call_consent_for(&self, user_id: UserId) -> VoiceCallConsent {
        self.role_of(user_id)
            .map(|role| *self.voice_call_consent.get(role))
            .unwrap_or_default()
    }

    /// 发送前检查：必须是参与者，且没有被对方屏蔽。
    pub fn ensure_can_send(&self, sender_id: UserId) -> Result<(), DomainError> {
        self.ensure_participant(sender_id)?;
        match self.blocked_by {
            Some(blocker) if self.is_blocked && blocker != sender_id => {
                Err(DomainError::ConversationBlocked)
            }
            _ => Ok(()),
        }
    }

    /// 记录一条新消息，返回接收方的未读数。
    pub fn record_message(&mut self, message: &Message) -> Result<u32, DomainError> {
        self.apply(&ConversationUpdate::message_recorded(message))?;
        Ok(self.unread_for(message.recipient_id))
    }

    /// 清零未读并记录已读时间。
    pub fn mark_read_by(
        &mut self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<ConversationUpdate, DomainError> {
        let update = ConversationUpdate::ReadBy { user_id, at };
        self.apply(&update)?;
        Ok(update)
    }

    /// 屏蔽对方。已被对方屏蔽时保留原屏蔽者。
    pub fn block(
        &mut self,
        user_id: UserId,
        now: Timestamp,
    ) -> Result<ConversationUpdate, DomainError> {
        let update = ConversationUpdate::Blocked { by: user_id, at: now };
        self.apply(&update)?;
        Ok(update)
    }

    pub fn unblock(
        &mut self,
        user_id: UserId,
        now: Timestamp,
    ) -> Result<ConversationUpdate, DomainError> {
        self.ensure_participant(user_id)?;
        if self.is_blocked && self.blocked_by.is_some_and(|blocker| blocker != user_id) {
            return Err(DomainError::OperationNotAllowed(
                "only the user who blocked the conversation can unblock it",
            ));
        }
        let update = ConversationUpdate::Unblocked { by: user_id, at: now };
        self.apply(&update)?;
        Ok(update)
    }

    pub fn hide_for(
        &mut self,
        user_id: UserId,
        now: Timestamp,
    ) -> Result<ConversationUpdate, DomainError> {
        let update = ConversationUpdate::HiddenFor { user_id, at: now };
        self.apply(&update)?;
        Ok(update)
    }

    pub fn set_voice_call_consent(
        &mut self,
        user_id: UserId,
        allowed: bool,
        now: Timestamp,
    ) -> Result<ConversationUpdate, DomainError> {
        let update = ConversationUpdate::VoiceCallConsent {
            user_id,
            consent: VoiceCallConsent {
                allowed,
                changed_at: Some(now),
                changed_by: Some(user_id),
            },
            at: now,
        };
        self.apply(&update)?;
        Ok(update)
    }

    /// 应用一次局部修改。内存存储直接调用它，PostgreSQL 存储用等价的
    /// 单条 UPDATE 实现同样的语义。
    pub fn apply(&mut self, update: &ConversationUpdate) -> Result<(), DomainError> {
        match update {
            ConversationUpdate::MessageRecorded {
                recipient_id,
                last_message,
            } => {
                let role = self.ensure_participant(*recipient_id)?;
                let at = last_message.timestamp;
                if self.last_message_at.is_none_or(|current| current <= at) {
                    self.last_message = Some(last_message.clone());
                    self.last_message_at = Some(at);
                }
                let unread = self.unread.get_mut(role);
                *unread = unread.saturating_add(1);
                self.hidden = ParticipantMap::default();
                self.updated_at = self.updated_at.max(at);
            }
            ConversationUpdate::ReadBy { user_id, at } => {
                let role = self.ensure_participant(*user_id)?;
                *self.unread.get_mut(role) = 0;
                *self.last_read_at.get_mut(role) = Some(*at);
                self.updated_at = *at;
            }
            ConversationUpdate::Blocked { by, at } => {
                self.ensure_participant(*by)?;
                if !(self.is_blocked && self.blocked_by.is_some()) {
                    self.is_blocked = true;
                    self.blocked_by = Some(*by);
                    self.updated_at = *at;
                }
            }
            ConversationUpdate::Unblocked { by, at } => {
                self.ensure_participant(*by)?;
                if self.is_blocked && self.blocked_by.is_none_or(|blocker| blocker == *by) {
                    self.is_blocked = false;
                    self.blocked_by = None;
                    self.updated_at = *at;
                }
            }
            ConversationUpdate::HiddenFor { user_id, at } => {
                let role = self.ensure_participant(*user_id)?;
                *self.hidden.get_mut(role) = true;
                self.updated_at = *at;
            }
            ConversationUpdate::VoiceCallConsent {
                user_id,
                consent,
                at,
            } => {
                let role = self.ensure_participant(*user_id)?;
                *self.voice_call_consent.get_mut(role) = *consent;
                self.updated_at = *at;
            }
        }
        Ok(())
    }
}
