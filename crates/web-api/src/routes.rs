use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use application::{
    events::{self, SendMessage},
    ConversationView, MessagePage, MessageSearchPage, PresenceUpdate, RateBucket,
    ReportMessageRequest, SearchMessagesRequest, StartConversationRequest, StartedConversation,
};
use domain::{Call, ConversationId, Message, MessageId, UserId};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    skip: Option<u32>,
}

impl PageQuery {
    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn skip(&self) -> u32 {
        self.skip.unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default, with = "time::serde::rfc3339::option")]
    before: Option<OffsetDateTime>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct VoiceConsentPayload {
    allowed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCount {
    total_unread: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadResult {
    message_ids: Vec<MessageId>,
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(cors_origins)),
        )
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|origin| origin == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(crate::ws::websocket_upgrade))
        .route(
            "/conversations",
            post(start_conversation).get(list_conversations),
        )
        .route("/conversations/unread-count", get(unread_count))
        .route("/conversations/{conversation_id}", get(get_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(get_messages).post(send_message),
        )
        .route("/conversations/{conversation_id}/read", post(mark_read))
        .route("/conversations/{conversation_id}/block", post(block))
        .route("/conversations/{conversation_id}/unblock", post(unblock))
        .route("/conversations/{conversation_id}/hide", post(hide))
        .route(
            "/conversations/{conversation_id}/voice-consent",
            put(set_voice_consent),
        )
        .route("/conversations/{conversation_id}/calls", get(call_history))
        .route("/messages/search", get(search_messages))
        .route("/messages/{message_id}/report", post(report_message))
        .route("/users/{user_id}/presence", get(presence))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn start_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<StartedConversation>), ApiError> {
    let request: StartConversationRequest = events::decode(body)?;
    // 带首条消息时与发送消息共用限流
    if request.text.as_deref().is_some_and(|text| !text.is_empty()) {
        state.gateway.check_rate(RateBucket::Message, user.id())?;
    }
    let started = state
        .conversation_service
        .start_conversation(user.id(), request)
        .await?;
    let status = if started.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(started)))
}

async fn list_conversations(
    State(state): State<AppState>,
    user: AuthUser,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<ConversationView>>, ApiError> {
    let items = state
        .conversation_service
        .list(user.id(), page.limit(), page.skip())
        .await?;
    Ok(Json(items))
}

async fn unread_count(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UnreadCount>, ApiError> {
    let total_unread = state.conversation_service.total_unread(user.id()).await?;
    Ok(Json(UnreadCount { total_unread }))
}

async fn get_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ConversationView>, ApiError> {
    let view = state
        .conversation_service
        .get(user.id(), ConversationId::from(conversation_id))
        .await?;
    Ok(Json(view))
}

async fn get_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    let page = state
        .chat_service
        .get_messages(
            user.id(),
            ConversationId::from(conversation_id),
            query.before,
            query.limit,
        )
        .await?;
    Ok(Json(page))
}

/// 与 `message:send` 相同的限流、校验和广播
async fn send_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(mut body): Json<Value>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let Some(fields) = body.as_object_mut() else {
        return Err(ApiError::bad_request("request body must be a JSON object"));
    };
    fields.insert("conversationId".into(), Value::String(conversation_id.to_string()));

    state.gateway.check_rate(RateBucket::Message, user.id())?;
    let request: SendMessage = events::decode(body)?;
    let message = state.chat_service.send(user.id(), request).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ReadResult>, ApiError> {
    let message_ids = state
        .chat_service
        .mark_all_read(user.id(), ConversationId::from(conversation_id))
        .await?;
    Ok(Json(ReadResult { message_ids }))
}

async fn block(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ConversationView>, ApiError> {
    let view = state
        .conversation_service
        .block(user.id(), ConversationId::from(conversation_id))
        .await?;
    Ok(Json(view))
}

async fn unblock(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ConversationView>, ApiError> {
    let view = state
        .conversation_service
        .unblock(user.id(), ConversationId::from(conversation_id))
        .await?;
    Ok(Json(view))
}

async fn hide(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ConversationView>, ApiError> {
    let view = state
        .conversation_service
        .hide(user.id(), ConversationId::from(conversation_id))
        .await?;
    Ok(Json(view))
}

async fn set_voice_consent(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<VoiceConsentPayload>,
) -> Result<Json<ConversationView>, ApiError> {
    let view = state
        .conversation_service
        .set_voice_call_consent(
            user.id(),
            ConversationId::from(conversation_id),
            payload.allowed,
        )
        .await?;
    Ok(Json(view))
}

async fn search_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Query(request): Query<SearchMessagesRequest>,
) -> Result<Json<MessageSearchPage>, ApiError> {
    let page = state
        .chat_service
        .search_messages(user.id(), request)
        .await?;
    Ok(Json(page))
}

async fn report_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(message_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let request: ReportMessageRequest = events::decode(body)?;
    state
        .conversation_service
        .report_message(user.id(), MessageId::from(message_id), request)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn call_history(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Call>>, ApiError> {
    let calls = state
        .call_service
        .history(
            user.id(),
            ConversationId::from(conversation_id),
            page.limit(),
            page.skip(),
        )
        .await?;
    Ok(Json(calls))
}

async fn presence(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<PresenceUpdate>, ApiError> {
    Ok(Json(state.gateway.presence_of(UserId::from(user_id)).await))
}
