use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::call::CallSummary;
use crate::errors::DomainError;
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

pub const MAX_TEXT_CHARS: usize = 2000;
pub const MAX_ATTACHMENTS: usize = 5;
pub const MAX_AUDIO_DURATION_SECS: f64 = 600.0;
pub const MAX_WAVEFORM_SAMPLES: usize = 120;
pub const MAX_CLIENT_TEMP_ID_CHARS: usize = 100;
pub const MIN_REPORT_REASON_CHARS: usize = 3;
pub const MAX_REPORT_REASON_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Audio,
    /// 通话结束后由系统生成
    Call,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Audio => "audio",
            MessageType::Call => "call",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "text" => Ok(MessageType::Text),
            "audio" => Ok(MessageType::Audio),
            "call" => Ok(MessageType::Call),
            other => Err(DomainError::invalid_argument(
                "type",
                format!("unknown message type `{other}`"),
            )),
        }
    }
}

/// 投递状态，只能单向前进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// 已写入存储
    Sent,
    /// 接收方设备已确认收到
    Delivered,
    /// 接收方已读
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            other => Err(DomainError::invalid_argument(
                "status",
                format!("unknown message status `{other}`"),
            )),
        }
    }
}

/// 图片等附件描述，文件本身存放在对象存储中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Attachment {
    #[validate(length(min = 1, max = 512))]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 2048))]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 2048))]
    pub thumbnail_url: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub mime: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// 语音消息载荷。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AudioPayload {
    #[validate(length(min = 1, max = 512))]
    pub key: String,
    #[validate(length(min = 1, max = 2048))]
    pub url: String,
    #[validate(length(min = 1, max = 255))]
    pub mime: String,
    #[validate(range(min = 1))]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0, max = 600.0))]
    pub duration: Option<f64>,
    /// 归一化波形采样
    #[serde(default)]
    #[validate(length(max = 120), custom(function = "validate_waveform"))]
    pub waveform: Vec<f32>,
}

fn validate_waveform(samples: &[f32]) -> Result<(), ValidationError> {
    if samples
        .iter()
        .all(|sample| sample.is_finite() && (0.0..=1.0).contains(sample))
    {
        Ok(())
    } else {
        Err(ValidationError::new("waveform_range")
            .with_message("waveform samples must be within [0, 1]".into()))
    }
}

impl AudioPayload {
    fn check(&self) -> Result<(), DomainError> {
        if self.size == 0 {
            return Err(DomainError::invalid_argument("audio.size", "must be at least 1"));
        }
        if let Some(duration) = self.duration {
            if !(0.0..=MAX_AUDIO_DURATION_SECS).contains(&duration) {
                return Err(DomainError::invalid_argument(
                    "audio.duration",
                    "must be between 0 and 600 seconds",
                ));
            }
        }
        if self.waveform.len() > MAX_WAVEFORM_SAMPLES {
            return Err(DomainError::invalid_argument(
                "audio.waveform",
                "at most 120 samples",
            ));
        }
        validate_waveform(&self.waveform)
            .map_err(|_| DomainError::invalid_argument("audio.waveform", "samples must be within [0, 1]"))
    }
}

/// 举报记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReport {
    pub reason: String,
    pub reported_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub reported_at: Timestamp,
}

/// 用户提交的消息内容，尚未归属到会话。
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub message_type: MessageType,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub audio: Option<AudioPayload>,
    pub client_temp_id: Option<String>,
}

impl MessageDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Text,
            text: text.into(),
            attachments: Vec::new(),
            audio: None,
            client_temp_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub audio: Option<AudioPayload>,
    pub call: Option<CallSummary>,
    pub status: MessageStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub read_at: Option<Timestamp>,
    pub client_temp_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    #[serde(skip_serializing, default)] // 软删除标记不暴露给客户端
    pub is_deleted: bool,
    #[serde(skip_serializing, default)]
    pub report: Option<MessageReport>,
}

impl Message {
    /// 校验并创建一条用户消息，状态为 `sent`。
    pub fn compose(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        recipient_id: UserId,
        draft: MessageDraft,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        let text = draft.text.trim().to_owned();
        if text.chars().count() > MAX_TEXT_CHARS {
            return Err(DomainError::invalid_argument("text", "at most 2000 characters"));
        }
        if draft.attachments.len() > MAX_ATTACHMENTS {
            return Err(DomainError::invalid_argument("attachments", "at most 5 attachments"));
        }
        if let Some(temp_id) = &draft.client_temp_id {
            if temp_id.chars().count() > MAX_CLIENT_TEMP_ID_CHARS {
                return Err(DomainError::invalid_argument(
                    "clientTempId",
                    "at most 100 characters",
                ));
            }
        }
        match (draft.message_type, &draft.audio) {
            (MessageType::Call, _) => {
                return Err(DomainError::invalid_argument(
                    "type",
                    "call messages are generated by the server",
                ))
            }
            (MessageType::Audio, None) => {
                return Err(DomainError::invalid_argument(
                    "audio",
                    "required when type is audio",
                ))
            }
            (MessageType::Text, Some(_)) => {
                return Err(DomainError::invalid_argument(
                    "audio",
                    "only allowed when type is audio",
                ))
            }
            (_, Some(audio)) => audio.check()?,
            _ => {}
        }
        if text.is_empty() && draft.attachments.is_empty() && draft.audio.is_none() {
            return Err(DomainError::invalid_argument(
                "text",
                "message must contain text, attachments or audio",
            ));
        }

        Ok(Self {
            id,
            conversation_id,
            sender_id,
            recipient_id,
            message_type: draft.message_type,
            text,
            attachments: draft.attachments,
            audio: draft.audio,
            call: None,
            status: MessageStatus::Sent,
            delivered_at: None,
            read_at: None,
            client_temp_id: draft.client_temp_id,
            created_at: now,
            is_deleted: false,
            report: None,
        })
    }

    /// 通话结束后追加的系统消息，发送者记为通话发起人。
    pub fn call_summary(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        recipient_id: UserId,
        summary: CallSummary,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            recipient_id,
            message_type: MessageType::Call,
            text: String::new(),
            attachments: Vec::new(),
            audio: None,
            call: Some(summary),
            status: MessageStatus::Sent,
            delivered_at: None,
            read_at: None,
            client_temp_id: None,
            created_at: now,
            is_deleted: false,
            report: None,
        }
    }

    /// `sent -> delivered`，其余状态保持不变。返回是否发生了迁移。
    pub fn mark_delivered(&mut self, at: Timestamp) -> bool {
        if self.status != MessageStatus::Sent {
            return false;
        }
        self.status = MessageStatus::Delivered;
        self.delivered_at = Some(at);
        true
    }

    /// 任意未读状态 `-> read`。跳过 delivered 时一并补齐 deliveredAt。
    pub fn mark_read(&mut self, at: Timestamp) -> bool {
        if self.status == MessageStatus::Read {
            return false;
        }
        if self.delivered_at.is_none() {
            self.delivered_at = Some(at);
        }
        self.status = MessageStatus::Read;
        self.read_at = Some(at);
        true
    }

    pub fn is_reported(&self) -> bool {
        self.report.is_some()
    }

    pub fn report(
        &mut self,
        reporter: UserId,
        reason: &str,
        at: Timestamp,
    ) -> Result<(), DomainError> {
        if reporter == self.sender_id {
            return Err(DomainError::OperationNotAllowed("cannot report your own message"));
        }
        let reason = reason.trim();
        let length = reason.chars().count();
        if !(MIN_REPORT_REASON_CHARS..=MAX_REPORT_REASON_CHARS).contains(&length) {
            return Err(DomainError::invalid_argument(
                "reason",
                "must be between 3 and 500 characters",
            ));
        }
        self.report = Some(MessageReport {
            reason: reason.to_owned(),
            reported_by: reporter,
            reported_at: at,
        });
        Ok(())
    }
}
