use std::sync::Arc;

use application::{
    AdDirectory, CallRepository, ConversationRepository, MessageRepository, MessageSearch,
    UserRepository,
};
use async_trait::async_trait;
use domain::{
    AdId, AudioPayload, Attachment, Call, CallEndReason, CallId, CallMediaType, CallStatus,
    CallSummary, Conversation, ConversationId, ConversationUpdate, LastMessage, Message,
    MessageId, MessageReport, MessageStatus, MessageType, ParticipantMap, RepositoryError,
    Timestamp, User, UserId, UserRole, VoiceCallConsent,
};
use sqlx::{types::Json, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
        _ => RepositoryError::storage(err.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn unread_count(value: i32) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| invalid_data(format!("negative unread counter {value}")))
}

/// ILIKE 模式里 `\`、`%`、`_` 按字面匹配
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for ch in text.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn to_db_count(value: u32) -> Result<i32, RepositoryError> {
    i32::try_from(value).map_err(|_| invalid_data(format!("unread counter {value} out of range")))
}

const CONVERSATION_COLUMNS: &str = "id, ad_id, owner_id, buyer_id, last_message, last_message_at, \
     owner_unread, buyer_unread, owner_last_read_at, buyer_last_read_at, is_blocked, blocked_by, \
     owner_hidden, buyer_hidden, voice_call_consent, created_at, updated_at";

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    ad_id: Uuid,
    owner_id: Uuid,
    buyer_id: Uuid,
    last_message: Option<Json<LastMessage>>,
    last_message_at: Option<OffsetDateTime>,
    owner_unread: i32,
    buyer_unread: i32,
    owner_last_read_at: Option<OffsetDateTime>,
    buyer_last_read_at: Option<OffsetDateTime>,
    is_blocked: bool,
    blocked_by: Option<Uuid>,
    owner_hidden: bool,
    buyer_hidden: bool,
    voice_call_consent: Json<ParticipantMap<VoiceCallConsent>>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<ConversationRecord> for Conversation {
    type Error = RepositoryError;

    fn try_from(value: ConversationRecord) -> Result<Self, Self::Error> {
        Ok(Conversation {
            id: ConversationId::from(value.id),
            ad_id: AdId::from(value.ad_id),
            owner_id: UserId::from(value.owner_id),
            buyer_id: UserId::from(value.buyer_id),
            last_message: value.last_message.map(|json| json.0),
            last_message_at: value.last_message_at,
            unread: ParticipantMap::new(
                unread_count(value.owner_unread)?,
                unread_count(value.buyer_unread)?,
            ),
            last_read_at: ParticipantMap::new(value.owner_last_read_at, value.buyer_last_read_at),
            is_blocked: value.is_blocked,
            blocked_by: value.blocked_by.map(UserId::from),
            hidden: ParticipantMap::new(value.owner_hidden, value.buyer_hidden),
            voice_call_consent: value.voice_call_consent.0,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            r#"
            INSERT INTO conversations ({CONVERSATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(Uuid::from(conversation.id))
        .bind(Uuid::from(conversation.ad_id))
        .bind(Uuid::from(conversation.owner_id))
        .bind(Uuid::from(conversation.buyer_id))
        .bind(conversation.last_message.clone().map(Json))
        .bind(conversation.last_message_at)
        .bind(to_db_count(conversation.unread.owner)?)
        .bind(to_db_count(conversation.unread.buyer)?)
        .bind(conversation.last_read_at.owner)
        .bind(conversation.last_read_at.buyer)
        .bind(conversation.is_blocked)
        .bind(conversation.blocked_by.map(Uuid::from))
        .bind(conversation.hidden.owner)
        .bind(conversation.hidden.buyer)
        .bind(Json(conversation.voice_call_consent))
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Conversation::try_from(record)
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Conversation::try_from).transpose()
    }

    async fn find_by_triple(
        &self,
        ad_id: AdId,
        owner_id: UserId,
        buyer_id: UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations
            WHERE ad_id = $1 AND owner_id = $2 AND buyer_id = $3
            "#
        ))
        .bind(Uuid::from(ad_id))
        .bind(Uuid::from(owner_id))
        .bind(Uuid::from(buyer_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Conversation::try_from).transpose()
    }

    async fn apply(
        &self,
        id: ConversationId,
        update: ConversationUpdate,
    ) -> Result<Conversation, RepositoryError> {
        // 每种修改都是单条 UPDATE，计数在数据库里自增，避免读改写覆盖并发修改
        let record = match &update {
            ConversationUpdate::MessageRecorded {
                recipient_id,
                last_message,
            } => sqlx::query_as::<_, ConversationRecord>(&format!(
                r#"
                UPDATE conversations SET
                    last_message = CASE
                        WHEN last_message_at IS NULL OR last_message_at <= $3 THEN $2
                        ELSE last_message
                    END,
                    last_message_at = GREATEST(last_message_at, $3),
                    owner_unread = owner_unread + CASE WHEN owner_id = $4 THEN 1 ELSE 0 END,
                    buyer_unread = buyer_unread + CASE WHEN buyer_id = $4 THEN 1 ELSE 0 END,
                    owner_hidden = FALSE,
                    buyer_hidden = FALSE,
                    updated_at = GREATEST(updated_at, $3)
                WHERE id = $1 AND (owner_id = $4 OR buyer_id = $4)
                RETURNING {CONVERSATION_COLUMNS}
                "#
            ))
            .bind(Uuid::from(id))
            .bind(Json(last_message.clone()))
            .bind(last_message.timestamp)
            .bind(Uuid::from(*recipient_id))
            .fetch_optional(&self.pool)
            .await,
            ConversationUpdate::ReadBy { user_id, at } => {
                sqlx::query_as::<_, ConversationRecord>(&format!(
                    r#"
                    UPDATE conversations SET
                        owner_unread = CASE WHEN owner_id = $2 THEN 0 ELSE owner_unread END,
                        buyer_unread = CASE WHEN buyer_id = $2 THEN 0 ELSE buyer_unread END,
                        owner_last_read_at = CASE WHEN owner_id = $2 THEN $3 ELSE owner_last_read_at END,
                        buyer_last_read_at = CASE WHEN buyer_id = $2 THEN $3 ELSE buyer_last_read_at END,
                        updated_at = $3
                    WHERE id = $1 AND (owner_id = $2 OR buyer_id = $2)
                    RETURNING {CONVERSATION_COLUMNS}
                    "#
                ))
                .bind(Uuid::from(id))
                .bind(Uuid::from(*user_id))
                .bind(*at)
                .fetch_optional(&self.pool)
                .await
            }
            // 已被屏蔽时保留最初的屏蔽人
            ConversationUpdate::Blocked { by, at } => sqlx::query_as::<_, ConversationRecord>(
                &format!(
                    r#"
                    UPDATE conversations SET
                        blocked_by = CASE
                            WHEN is_blocked AND blocked_by IS NOT NULL THEN blocked_by
                            ELSE $2
                        END,
                        updated_at = CASE
                            WHEN is_blocked AND blocked_by IS NOT NULL THEN updated_at
                            ELSE $3
                        END,
                        is_blocked = TRUE
                    WHERE id = $1 AND (owner_id = $2 OR buyer_id = $2)
                    RETURNING {CONVERSATION_COLUMNS}
                    "#
                ),
            )
            .bind(Uuid::from(id))
            .bind(Uuid::from(*by))
            .bind(*at)
            .fetch_optional(&self.pool)
            .await,
            ConversationUpdate::Unblocked { by, at } => {
                sqlx::query_as::<_, ConversationRecord>(&format!(
                    r#"
                    UPDATE conversations SET
                        is_blocked = FALSE,
                        blocked_by = NULL,
                        updated_at = $3
                    WHERE id = $1
                      AND (owner_id = $2 OR buyer_id = $2)
                      AND is_blocked
                      AND (blocked_by IS NULL OR blocked_by = $2)
                    RETURNING {CONVERSATION_COLUMNS}
                    "#
                ))
                .bind(Uuid::from(id))
                .bind(Uuid::from(*by))
                .bind(*at)
                .fetch_optional(&self.pool)
                .await
            }
            ConversationUpdate::HiddenFor { user_id, at } => {
                sqlx::query_as::<_, ConversationRecord>(&format!(
                    r#"
                    UPDATE conversations SET
                        owner_hidden = owner_hidden OR owner_id = $2,
                        buyer_hidden = buyer_hidden OR buyer_id = $2,
                        updated_at = $3
                    WHERE id = $1 AND (owner_id = $2 OR buyer_id = $2)
                    RETURNING {CONVERSATION_COLUMNS}
                    "#
                ))
                .bind(Uuid::from(id))
                .bind(Uuid::from(*user_id))
                .bind(*at)
                .fetch_optional(&self.pool)
                .await
            }
            ConversationUpdate::VoiceCallConsent {
                user_id,
                consent,
                at,
            } => sqlx::query_as::<_, ConversationRecord>(&format!(
                r#"
                UPDATE conversations SET
                    voice_call_consent = jsonb_set(
                        voice_call_consent,
                        ARRAY[CASE WHEN owner_id = $2 THEN 'owner' ELSE 'buyer' END],
                        $3
                    ),
                    updated_at = $4
                WHERE id = $1 AND (owner_id = $2 OR buyer_id = $2)
                RETURNING {CONVERSATION_COLUMNS}
                "#
            ))
            .bind(Uuid::from(id))
            .bind(Uuid::from(*user_id))
            .bind(Json(*consent))
            .bind(*at)
            .fetch_optional(&self.pool)
            .await,
        };

        match record.map_err(map_sqlx_err)? {
            Some(record) => Conversation::try_from(record),
            // 解除屏蔽的条件不满足时保持原样
            None if matches!(update, ConversationUpdate::Unblocked { .. }) => self
                .find_by_id(id)
                .await?
                .ok_or(RepositoryError::NotFound),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let records = sqlx::query_as::<_, ConversationRecord>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations
            WHERE (owner_id = $1 AND NOT owner_hidden) OR (buyer_id = $1 AND NOT buyer_hidden)
            ORDER BY COALESCE(last_message_at, created_at) DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(Uuid::from(user_id))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Conversation::try_from).collect()
    }

    async fn total_unread_for(&self, user_id: UserId) -> Result<u64, RepositoryError> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(
                CASE
                    WHEN owner_id = $1 AND NOT owner_hidden THEN owner_unread
                    WHEN buyer_id = $1 AND NOT buyer_hidden THEN buyer_unread
                    ELSE 0
                END
            ), 0)::BIGINT
            FROM conversations
            WHERE owner_id = $1 OR buyer_id = $1
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        u64::try_from(total).map_err(|_| invalid_data(format!("negative unread total {total}")))
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, recipient_id, message_type, text, \
     attachments, audio, call, status, delivered_at, read_at, client_temp_id, created_at, \
     is_deleted, report";

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    recipient_id: Uuid,
    message_type: String,
    text: String,
    attachments: Json<Vec<Attachment>>,
    audio: Option<Json<AudioPayload>>,
    call: Option<Json<CallSummary>>,
    status: String,
    delivered_at: Option<OffsetDateTime>,
    read_at: Option<OffsetDateTime>,
    client_temp_id: Option<String>,
    created_at: OffsetDateTime,
    is_deleted: bool,
    report: Option<Json<MessageReport>>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let message_type =
            MessageType::parse(&value.message_type).map_err(|err| invalid_data(err.to_string()))?;
        let status =
            MessageStatus::parse(&value.status).map_err(|err| invalid_data(err.to_string()))?;

        Ok(Message {
            id: MessageId::from(value.id),
            conversation_id: ConversationId::from(value.conversation_id),
            sender_id: UserId::from(value.sender_id),
            recipient_id: UserId::from(value.recipient_id),
            message_type,
            text: value.text,
            attachments: value.attachments.0,
            audio: value.audio.map(|json| json.0),
            call: value.call.map(|json| json.0),
            status,
            delivered_at: value.delivered_at,
            read_at: value.read_at,
            client_temp_id: value.client_temp_id,
            created_at: value.created_at,
            is_deleted: value.is_deleted,
            report: value.report.map(|json| json.0),
        })
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            INSERT INTO messages ({MESSAGE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.conversation_id))
        .bind(Uuid::from(message.sender_id))
        .bind(Uuid::from(message.recipient_id))
        .bind(message.message_type.as_str())
        .bind(&message.text)
        .bind(Json(&message.attachments))
        .bind(message.audio.as_ref().map(Json))
        .bind(message.call.as_ref().map(Json))
        .bind(message.status.as_str())
        .bind(message.delivered_at)
        .bind(message.read_at)
        .bind(message.client_temp_id.as_deref())
        .bind(message.created_at)
        .bind(message.is_deleted)
        .bind(message.report.as_ref().map(Json))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Message::try_from(record)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn save(&self, message: &Message) -> Result<(), RepositoryError> {
        // 消息内容不可变，只回写状态类字段
        let result = sqlx::query(
            r#"
            UPDATE messages SET
                status = $2,
                delivered_at = $3,
                read_at = $4,
                is_deleted = $5,
                report = $6
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(message.id))
        .bind(message.status.as_str())
        .bind(message.delivered_at)
        .bind(message.read_at)
        .bind(message.is_deleted)
        .bind(message.report.as_ref().map(Json))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn find_by_ids(
        &self,
        conversation_id: ConversationId,
        ids: &[MessageId],
    ) -> Result<Vec<Message>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = ids.iter().copied().map(Uuid::from).collect();
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = $1 AND id = ANY($2)
            ORDER BY created_at ASC
            "#
        ))
        .bind(Uuid::from(conversation_id))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn find_unread_for(
        &self,
        conversation_id: ConversationId,
        recipient_id: UserId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = $1 AND recipient_id = $2 AND status <> 'read'
            ORDER BY created_at ASC
            "#
        ))
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(recipient_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        before: Option<Timestamp>,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = $1
              AND NOT is_deleted
              AND ($2::TIMESTAMPTZ IS NULL OR created_at < $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#
        ))
        .bind(Uuid::from(conversation_id))
        .bind(before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn search(&self, query: &MessageSearch) -> Result<Vec<Message>, RepositoryError> {
        let (before_at, before_id) = query.before.unzip();
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE (sender_id = $1 OR recipient_id = $1)
              AND NOT is_deleted
              AND text ILIKE $2 ESCAPE '\'
              AND ($3::UUID IS NULL OR conversation_id = $3)
              AND ($4::TIMESTAMPTZ IS NULL OR (created_at, id) < ($4, $5))
            ORDER BY created_at DESC, id DESC
            LIMIT $6
            "#
        ))
        .bind(Uuid::from(query.user_id))
        .bind(like_pattern(&query.text))
        .bind(query.conversation_id.map(Uuid::from))
        .bind(before_at)
        .bind(before_id.map(Uuid::from))
        .bind(i64::from(query.limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }
}

const CALL_COLUMNS: &str = "id, conversation_id, participants, initiator_id, media_type, status, \
     started_at, ended_at, duration, end_reason, summary_message_id, created_at, updated_at";

#[derive(Debug, FromRow)]
struct CallRecord {
    id: Uuid,
    conversation_id: Uuid,
    participants: Vec<Uuid>,
    initiator_id: Uuid,
    media_type: String,
    status: String,
    started_at: Option<OffsetDateTime>,
    ended_at: Option<OffsetDateTime>,
    duration: Option<i64>,
    end_reason: Option<String>,
    summary_message_id: Option<Uuid>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CallRecord> for Call {
    type Error = RepositoryError;

    fn try_from(value: CallRecord) -> Result<Self, Self::Error> {
        let participants: [Uuid; 2] = value.participants.try_into().map_err(|ids: Vec<Uuid>| {
            invalid_data(format!("call expects 2 participants, found {}", ids.len()))
        })?;
        let media_type =
            CallMediaType::parse(&value.media_type).map_err(|err| invalid_data(err.to_string()))?;
        let status = CallStatus::parse(&value.status).map_err(|err| invalid_data(err.to_string()))?;
        let end_reason = value
            .end_reason
            .as_deref()
            .map(CallEndReason::parse)
            .transpose()
            .map_err(|err| invalid_data(err.to_string()))?;

        Ok(Call {
            id: CallId::from(value.id),
            conversation_id: ConversationId::from(value.conversation_id),
            participants: participants.map(UserId::from),
            initiator_id: UserId::from(value.initiator_id),
            media_type,
            status,
            started_at: value.started_at,
            ended_at: value.ended_at,
            duration: value.duration,
            end_reason,
            summary_message_id: value.summary_message_id.map(MessageId::from),
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgCallRepository {
    pool: PgPool,
}

impl PgCallRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallRepository for PgCallRepository {
    async fn create(&self, call: Call) -> Result<Call, RepositoryError> {
        let participants: Vec<Uuid> = call.participants.iter().copied().map(Uuid::from).collect();
        let record = sqlx::query_as::<_, CallRecord>(&format!(
            r#"
            INSERT INTO calls ({CALL_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {CALL_COLUMNS}
            "#
        ))
        .bind(Uuid::from(call.id))
        .bind(Uuid::from(call.conversation_id))
        .bind(participants)
        .bind(Uuid::from(call.initiator_id))
        .bind(call.media_type.as_str())
        .bind(call.status.as_str())
        .bind(call.started_at)
        .bind(call.ended_at)
        .bind(call.duration)
        .bind(call.end_reason.map(|reason| reason.as_str()))
        .bind(call.summary_message_id.map(Uuid::from))
        .bind(call.created_at)
        .bind(call.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Call::try_from(record)
    }

    async fn find_by_id(&self, id: CallId) -> Result<Option<Call>, RepositoryError> {
        let record = sqlx::query_as::<_, CallRecord>(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Call::try_from).transpose()
    }

    async fn update(&self, call: &Call) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE calls SET
                status = $2,
                started_at = $3,
                ended_at = $4,
                duration = $5,
                end_reason = $6,
                summary_message_id = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(call.id))
        .bind(call.status.as_str())
        .bind(call.started_at)
        .bind(call.ended_at)
        .bind(call.duration)
        .bind(call.end_reason.map(|reason| reason.as_str()))
        .bind(call.summary_message_id.map(Uuid::from))
        .bind(call.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Call>, RepositoryError> {
        let records = sqlx::query_as::<_, CallRecord>(&format!(
            r#"
            SELECT {CALL_COLUMNS} FROM calls
            WHERE conversation_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(Uuid::from(conversation_id))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Call::try_from).collect()
    }
}

/// 账号与广告的只读镜像，由外部系统同步写入
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert_user(&self, user: &User) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, role) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET role = EXCLUDED.role
            "#,
        )
        .bind(Uuid::from(user.id))
        .bind(user.role.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    pub async fn upsert_ad(&self, ad_id: AdId, owner_id: UserId) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO ads (id, owner_id) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET owner_id = EXCLUDED.owner_id
            "#,
        )
        .bind(Uuid::from(ad_id))
        .bind(Uuid::from(owner_id))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl UserRepository for PgDirectory {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let row: Option<(Uuid, String)> = sqlx::query_as("SELECT id, role FROM users WHERE id = $1")
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(row.map(|(id, role)| User::new(UserId::from(id), UserRole::parse(&role))))
    }
}

#[async_trait]
impl AdDirectory for PgDirectory {
    async fn find_owner(&self, ad_id: AdId) -> Result<Option<UserId>, RepositoryError> {
        let owner: Option<Uuid> = sqlx::query_scalar("SELECT owner_id FROM ads WHERE id = $1")
            .bind(Uuid::from(ad_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(owner.map(UserId::from))
    }
}

/// 共享同一个连接池的全部仓储
#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub conversations: Arc<PgConversationRepository>,
    pub messages: Arc<PgMessageRepository>,
    pub calls: Arc<PgCallRepository>,
    pub directory: Arc<PgDirectory>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            conversations: Arc::new(PgConversationRepository::new(pool.clone())),
            messages: Arc::new(PgMessageRepository::new(pool.clone())),
            calls: Arc::new(PgCallRepository::new(pool.clone())),
            directory: Arc::new(PgDirectory::new(pool.clone())),
            pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::like_pattern;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), r"%50\%\_off%");
        assert_eq!(like_pattern(r"a\b"), r"%a\\b%");
        assert_eq!(like_pattern("plain"), "%plain%");
    }
}
