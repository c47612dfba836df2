//! 客户端与服务端之间的事件定义
//!
//! 每一帧都是 `{"event": "<名称>", "data": {...}}`。入站事件先识别名称，
//! 再按名称解码载荷并做一次完整校验；未知字段直接拒绝，不做静默裁剪。

use std::borrow::Cow;

use domain::{
    Attachment, AudioPayload, CallEndReason, CallId, CallMediaType, ConversationId, Message,
    MessageId, Timestamp, UserId, MAX_ATTACHMENTS,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

use crate::error::ApplicationError;
use crate::presence::PresenceUpdate;

/// 入站事件名称
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JoinConversation,
    SendMessage,
    MessageReceived,
    MarkRead,
    TypingStart,
    TypingStop,
    CallInitiate,
    CallOffer,
    CallAnswer,
    CallIceCandidate,
    CallEnd,
    CallReject,
    CallCancel,
}

/// 入站事件对应的限流桶
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateBucket {
    Message,
    Typing,
}

impl EventKind {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "conversation:join" => EventKind::JoinConversation,
            "message:send" => EventKind::SendMessage,
            "message:received" => EventKind::MessageReceived,
            "messages:markRead" => EventKind::MarkRead,
            "typing:start" => EventKind::TypingStart,
            "typing:stop" => EventKind::TypingStop,
            "call:initiate" => EventKind::CallInitiate,
            "call:offer" => EventKind::CallOffer,
            "call:answer" => EventKind::CallAnswer,
            "call:ice-candidate" => EventKind::CallIceCandidate,
            "call:end" => EventKind::CallEnd,
            "call:reject" => EventKind::CallReject,
            "call:cancel" => EventKind::CallCancel,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::JoinConversation => "conversation:join",
            EventKind::SendMessage => "message:send",
            EventKind::MessageReceived => "message:received",
            EventKind::MarkRead => "messages:markRead",
            EventKind::TypingStart => "typing:start",
            EventKind::TypingStop => "typing:stop",
            EventKind::CallInitiate => "call:initiate",
            EventKind::CallOffer => "call:offer",
            EventKind::CallAnswer => "call:answer",
            EventKind::CallIceCandidate => "call:ice-candidate",
            EventKind::CallEnd => "call:end",
            EventKind::CallReject => "call:reject",
            EventKind::CallCancel => "call:cancel",
        }
    }

    pub fn rate_bucket(&self) -> Option<RateBucket> {
        match self {
            EventKind::SendMessage => Some(RateBucket::Message),
            EventKind::TypingStart | EventKind::TypingStop => Some(RateBucket::Typing),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// 已识别名称、尚未解码载荷的入站帧
#[derive(Debug)]
pub struct InboundFrame {
    pub kind: EventKind,
    data: Value,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, ApplicationError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|err| ApplicationError::invalid_field("frame", err))?;
        let kind = EventKind::parse(&envelope.event).ok_or_else(|| {
            ApplicationError::invalid_field(
                "event",
                format!("unknown event `{}`", envelope.event),
            )
        })?;
        Ok(Self {
            kind,
            data: envelope.data,
        })
    }

    pub fn decode(self) -> Result<ClientEvent, ApplicationError> {
        let data = self.data;
        Ok(match self.kind {
            EventKind::JoinConversation => ClientEvent::JoinConversation(decode(data)?),
            EventKind::SendMessage => ClientEvent::SendMessage(decode(data)?),
            EventKind::MessageReceived => ClientEvent::MessageReceived(decode(data)?),
            EventKind::MarkRead => ClientEvent::MarkRead(decode(data)?),
            EventKind::TypingStart => ClientEvent::TypingStart(decode(data)?),
            EventKind::TypingStop => ClientEvent::TypingStop(decode(data)?),
            EventKind::CallInitiate => ClientEvent::CallInitiate(decode(data)?),
            EventKind::CallOffer => ClientEvent::CallOffer(decode(data)?),
            EventKind::CallAnswer => ClientEvent::CallAnswer(decode(data)?),
            EventKind::CallIceCandidate => ClientEvent::CallIceCandidate(decode(data)?),
            EventKind::CallEnd => ClientEvent::CallEnd(decode(data)?),
            EventKind::CallReject => ClientEvent::CallReject(decode(data)?),
            EventKind::CallCancel => ClientEvent::CallCancel(decode(data)?),
        })
    }
}

/// 解码并校验一个载荷
pub fn decode<T>(data: Value) -> Result<T, ApplicationError>
where
    T: DeserializeOwned + Validate,
{
    let payload: T =
        serde_json::from_value(data).map_err(|err| ApplicationError::invalid_field("data", err))?;
    payload
        .validate()
        .map_err(|errors| ApplicationError::validation(flatten_errors(&errors)))?;
    Ok(payload)
}

/// 把嵌套的校验错误展开成 `path: message` 列表
pub fn flatten_errors(errors: &ValidationErrors) -> Vec<String> {
    let mut details = Vec::new();
    collect_errors("", errors, &mut details);
    details.sort();
    details
}

fn collect_errors(prefix: &str, errors: &ValidationErrors, out: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let path = if field == "__all__" {
            prefix.trim_end_matches('.').to_owned()
        } else if prefix.is_empty() {
            camel_case(field)
        } else {
            format!("{prefix}{}", camel_case(field))
        };
        match kind {
            ValidationErrorsKind::Field(items) => {
                for item in items {
                    let reason = item
                        .message
                        .clone()
                        .unwrap_or_else(|| item.code.clone());
                    let label = if path.is_empty() { "data" } else { path.as_str() };
                    out.push(format!("{label}: {reason}"));
                }
            }
            ValidationErrorsKind::Struct(nested) => {
                collect_errors(&format!("{path}."), nested, out);
            }
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_errors(&format!("{path}[{index}]."), nested, out);
                }
            }
        }
    }
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for ch in field.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn required_signal(value: &Value) -> Result<(), ValidationError> {
    if value.is_null() {
        Err(ValidationError::new("required").with_message(Cow::Borrowed("must not be null")))
    } else {
        Ok(())
    }
}

/// 解码后的入站事件
#[derive(Debug, Clone)]
pub enum ClientEvent {
    JoinConversation(JoinConversation),
    SendMessage(SendMessage),
    MessageReceived(MessageReceived),
    MarkRead(MarkRead),
    TypingStart(TypingSignal),
    TypingStop(TypingSignal),
    CallInitiate(CallInitiate),
    CallOffer(CallOffer),
    CallAnswer(CallAnswer),
    CallIceCandidate(CallIceCandidate),
    CallEnd(CallEnd),
    CallReject(CallRef),
    CallCancel(CallRef),
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JoinConversation {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub mark_as_read: bool,
}

/// 客户端可发送的消息类型，`call` 只由服务端生成
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendableType {
    #[default]
    Text,
    Audio,
}

impl From<SendableType> for domain::MessageType {
    fn from(value: SendableType) -> Self {
        match value {
            SendableType::Text => domain::MessageType::Text,
            SendableType::Audio => domain::MessageType::Audio,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[validate(schema(function = "validate_message_shape", skip_on_field_errors = false))]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    #[serde(default, deserialize_with = "trimmed_text")]
    #[validate(length(max = 2000, message = "at most 2000 characters"))]
    pub text: Option<String>,
    // 数量上限在 validate_message_shape 里检查
    #[serde(default)]
    #[validate(nested)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    #[validate(length(max = 100, message = "at most 100 characters"))]
    pub client_temp_id: Option<String>,
    #[serde(rename = "type", default)]
    pub message_type: SendableType,
    #[serde(default)]
    #[validate(nested)]
    pub audio: Option<AudioPayload>,
}

/// 解码时去掉首尾空白，长度校验针对去掉空白后的文本
pub(crate) fn trimmed_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let text = Option::<String>::deserialize(deserializer)?;
    Ok(text.map(|text| text.trim().to_owned()))
}

fn validate_message_shape(payload: &SendMessage) -> Result<(), ValidationError> {
    let has_text = payload
        .text
        .as_deref()
        .is_some_and(|text| !text.trim().is_empty());
    if payload.attachments.len() > MAX_ATTACHMENTS {
        return Err(ValidationError::new("too_many_attachments")
            .with_message(Cow::Borrowed("at most 5 attachments")));
    }
    match (payload.message_type, payload.audio.is_some()) {
        (SendableType::Audio, false) => {
            return Err(ValidationError::new("audio_required")
                .with_message(Cow::Borrowed("audio is required when type is audio")))
        }
        (SendableType::Text, true) => {
            return Err(ValidationError::new("audio_forbidden")
                .with_message(Cow::Borrowed("audio is only allowed when type is audio")))
        }
        _ => {}
    }
    if !has_text && payload.attachments.is_empty() && payload.audio.is_none() {
        return Err(ValidationError::new("empty_message").with_message(Cow::Borrowed(
            "message must contain text, attachments or audio",
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MessageReceived {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarkRead {
    pub conversation_id: ConversationId,
    #[validate(length(min = 1, max = 500, message = "between 1 and 500 ids"))]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallInitiate {
    pub conversation_id: ConversationId,
    #[serde(rename = "type")]
    pub media_type: CallMediaType,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallOffer {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    #[validate(custom(function = "required_signal"))]
    pub offer: Value,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallAnswer {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    #[validate(custom(function = "required_signal"))]
    pub answer: Value,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallIceCandidate {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    #[validate(custom(function = "required_signal"))]
    pub candidate: Value,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallEnd {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub reason: Option<CallEndReason>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallRef {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
}

// ---- 出站事件 ----

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "presence:update")]
    PresenceUpdate(PresenceUpdate),
    #[serde(rename = "conversation:joined")]
    ConversationJoined(ConversationJoined),
    #[serde(rename = "message:new")]
    MessageNew(MessageNew),
    #[serde(rename = "message:delivered")]
    MessageDelivered(MessageDelivered),
    #[serde(rename = "message:read")]
    MessageRead(MessagesRead),
    #[serde(rename = "typing:start")]
    TypingStart(TypingNotice),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingNotice),
    #[serde(rename = "call:incoming")]
    CallIncoming(CallIncoming),
    #[serde(rename = "call:offer")]
    CallOffer(RelayedOffer),
    #[serde(rename = "call:answer")]
    CallAnswer(RelayedAnswer),
    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate(RelayedCandidate),
    #[serde(rename = "call:ended")]
    CallEnded(CallTerminated),
    #[serde(rename = "call:rejected")]
    CallRejected(CallTerminated),
    #[serde(rename = "call:cancelled")]
    CallCancelled(CallTerminated),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PresenceUpdate(_) => "presence:update",
            ServerEvent::ConversationJoined(_) => "conversation:joined",
            ServerEvent::MessageNew(_) => "message:new",
            ServerEvent::MessageDelivered(_) => "message:delivered",
            ServerEvent::MessageRead(_) => "message:read",
            ServerEvent::TypingStart(_) => "typing:start",
            ServerEvent::TypingStop(_) => "typing:stop",
            ServerEvent::CallIncoming(_) => "call:incoming",
            ServerEvent::CallOffer(_) => "call:offer",
            ServerEvent::CallAnswer(_) => "call:answer",
            ServerEvent::CallIceCandidate(_) => "call:ice-candidate",
            ServerEvent::CallEnded(_) => "call:ended",
            ServerEvent::CallRejected(_) => "call:rejected",
            ServerEvent::CallCancelled(_) => "call:cancelled",
            ServerEvent::Error(_) => "error",
        }
    }

    pub fn error(err: &ApplicationError) -> Self {
        ServerEvent::Error(ErrorPayload::from(err))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationJoined {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNew {
    pub conversation_id: ConversationId,
    pub message: Message,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelivered {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    #[serde(with = "time::serde::rfc3339")]
    pub delivered_at: Timestamp,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesRead {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
    pub reader_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: Timestamp,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIncoming {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub initiator_id: UserId,
    #[serde(rename = "type")]
    pub media_type: CallMediaType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedOffer {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub from_user_id: UserId,
    pub offer: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedAnswer {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub from_user_id: UserId,
    pub answer: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedCandidate {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub from_user_id: UserId,
    pub candidate: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTerminated {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub status: domain::CallStatus,
    pub reason: Option<CallEndReason>,
    pub duration: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<Timestamp>,
    /// 触发终止的用户；超时等系统行为为空
    pub ended_by: Option<UserId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<&ApplicationError> for ErrorPayload {
    fn from(err: &ApplicationError) -> Self {
        Self {
            code: err.code(),
            message: err.client_message(),
            details: err.details(),
            retry_after: err.retry_after_secs(),
        }
    }
}
