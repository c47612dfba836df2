use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::errors::DomainError;
use crate::message::Message;
use crate::value_objects::{CallId, ConversationId, MessageId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMediaType {
    Audio,
    Video,
}

impl CallMediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallMediaType::Audio => "audio",
            CallMediaType::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "audio" => Ok(CallMediaType::Audio),
            "video" => Ok(CallMediaType::Video),
            other => Err(DomainError::invalid_argument(
                "type",
                format!("unknown call type `{other}`"),
            )),
        }
    }
}

/// 通话状态机：`initiated -> ringing -> answered -> 终态`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Ended,
    Missed,
    Rejected,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
            CallStatus::Rejected => "rejected",
            CallStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        Ok(match value {
            "initiated" => CallStatus::Initiated,
            "ringing" => CallStatus::Ringing,
            "answered" => CallStatus::Answered,
            "ended" => CallStatus::Ended,
            "missed" => CallStatus::Missed,
            "rejected" => CallStatus::Rejected,
            "failed" => CallStatus::Failed,
            other => {
                return Err(DomainError::invalid_argument(
                    "status",
                    format!("unknown call status `{other}`"),
                ))
            }
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Missed | CallStatus::Rejected | CallStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallEndReason {
    Completed,
    Cancelled,
    Rejected,
    Timeout,
    Error,
    Network,
}

impl CallEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallEndReason::Completed => "completed",
            CallEndReason::Cancelled => "cancelled",
            CallEndReason::Rejected => "rejected",
            CallEndReason::Timeout => "timeout",
            CallEndReason::Error => "error",
            CallEndReason::Network => "network",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        Ok(match value {
            "completed" => CallEndReason::Completed,
            "cancelled" => CallEndReason::Cancelled,
            "rejected" => CallEndReason::Rejected,
            "timeout" => CallEndReason::Timeout,
            "error" => CallEndReason::Error,
            "network" => CallEndReason::Network,
            other => {
                return Err(DomainError::invalid_argument(
                    "reason",
                    format!("unknown end reason `{other}`"),
                ))
            }
        })
    }
}

/// 展示在会话中的通话结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Completed,
    Cancelled,
    Rejected,
    Missed,
    Failed,
}

/// 通话摘要，随系统消息和会话的 lastMessage 一起保存。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    pub call_id: CallId,
    #[serde(rename = "type")]
    pub media_type: CallMediaType,
    pub status: CallOutcome,
    pub reason: Option<CallEndReason>,
    pub duration: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<Timestamp>,
    pub initiator_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: CallId,
    pub conversation_id: ConversationId,
    pub participants: [UserId; 2],
    pub initiator_id: UserId,
    #[serde(rename = "type")]
    pub media_type: CallMediaType,
    pub status: CallStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<Timestamp>,
    /// 单位秒，仅在接通过的通话上有值
    pub duration: Option<i64>,
    pub end_reason: Option<CallEndReason>,
    /// 终态摘要消息落库后才有值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_message_id: Option<MessageId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

impl Call {
    pub fn initiate(
        id: CallId,
        conversation: &Conversation,
        initiator_id: UserId,
        media_type: CallMediaType,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        conversation.ensure_participant(initiator_id)?;
        Ok(Self {
            id,
            conversation_id: conversation.id,
            participants: conversation.participants(),
            initiator_id,
            media_type,
            status: CallStatus::Initiated,
            started_at: None,
            ended_at: None,
            duration: None,
            end_reason: None,
            summary_message_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }

    /// 被叫方
    pub fn callee(&self) -> UserId {
        if self.participants[0] == self.initiator_id {
            self.participants[1]
        } else {
            self.participants[0]
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 已进入终态但摘要消息还没写入
    pub fn awaits_summary(&self) -> bool {
        self.is_terminal() && self.summary_message_id.is_none()
    }

    pub fn mark_ringing(&mut self, now: Timestamp) -> Result<bool, DomainError> {
        match self.status {
            CallStatus::Initiated => {
                self.status = CallStatus::Ringing;
                self.updated_at = now;
                Ok(true)
            }
            CallStatus::Ringing | CallStatus::Answered => Ok(false),
            terminal => Err(DomainError::InvalidCallTransition {
                from: terminal.as_str(),
                to: CallStatus::Ringing.as_str(),
            }),
        }
    }

    pub fn mark_answered(&mut self, now: Timestamp) -> Result<bool, DomainError> {
        match self.status {
            CallStatus::Initiated | CallStatus::Ringing => {
                self.status = CallStatus::Answered;
                self.started_at = Some(now);
                self.updated_at = now;
                Ok(true)
            }
            CallStatus::Answered => Ok(false),
            terminal => Err(DomainError::InvalidCallTransition {
                from: terminal.as_str(),
                to: CallStatus::Answered.as_str(),
            }),
        }
    }

    /// 进入终态。已经是终态的通话保持原样并返回 `false`。
    pub fn finish(
        &mut self,
        status: CallStatus,
        reason: CallEndReason,
        now: Timestamp,
    ) -> Result<bool, DomainError> {
        if !status.is_terminal() {
            return Err(DomainError::InvalidCallTransition {
                from: self.status.as_str(),
                to: status.as_str(),
            });
        }
        if self.is_terminal() {
            return Ok(false);
        }
        self.status = status;
        self.end_reason = Some(reason);
        self.ended_at = Some(now);
        self.duration = self
            .started_at
            .map(|started_at| (now - started_at).whole_seconds().max(0));
        self.updated_at = now;
        Ok(true)
    }

    pub fn outcome(&self) -> Option<CallOutcome> {
        match self.status {
            CallStatus::Rejected => Some(CallOutcome::Rejected),
            CallStatus::Missed => Some(CallOutcome::Missed),
            CallStatus::Failed => Some(CallOutcome::Failed),
            CallStatus::Ended if self.started_at.is_some() => Some(CallOutcome::Completed),
            CallStatus::Ended => Some(CallOutcome::Cancelled),
            _ => None,
        }
    }

    /// 终态通话的摘要；进行中的通话返回 `None`。
    pub fn summary(&self) -> Option<CallSummary> {
        let status = self.outcome()?;
        Some(CallSummary {
            call_id: self.id,
            media_type: self.media_type,
            status,
            reason: self.end_reason,
            duration: self.duration,
            started_at: self.started_at,
            ended_at: self.ended_at,
            initiator_id: self.initiator_id,
        })
    }

    /// 终态摘要消息。消息 id 取自通话 id，重试时写的是同一条消息。
    pub fn summary_message(&self) -> Option<Message> {
        let summary = self.summary()?;
        Some(Message::call_summary(
            MessageId::from(uuid::Uuid::from(self.id)),
            self.conversation_id,
            self.initiator_id,
            self.callee(),
            summary,
            self.ended_at.unwrap_or(self.updated_at),
        ))
    }
}
