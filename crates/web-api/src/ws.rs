//! WebSocket 传输
//!
//! 握手阶段完成认证，失败直接返回 401，不建立连接。
//! 连接建立后，入站文本帧交给 `ChatGateway`，出站事件由独立的发送任务写回。

use application::{ConnectionContext, ServerEvent};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use domain::User;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{
    auth::{collect_credentials, TokenQuery, ACCESS_TOKEN_PROTOCOL},
    error::ApiError,
    state::AppState,
};

pub(crate) async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let credentials = collect_credentials(&headers, query.token, true);
    let user = state.authenticator.authenticate(&credentials).await.map_err(|err| {
        tracing::warn!(error = %err, "websocket handshake rejected");
        ApiError::from(err)
    })?;

    // 客户端用子协议携带令牌时必须回显协议名，否则浏览器会关闭连接
    Ok(ws
        .protocols([ACCESS_TOKEN_PROTOCOL])
        .on_upgrade(move |socket| run_connection(socket, state, user)))
}

async fn run_connection(socket: WebSocket, state: AppState, user: User) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let ctx = state.gateway.connect(user.id, events_tx).await;
    tracing::info!(user_id = %ctx.user_id, connection_id = %ctx.connection_id, "websocket connected");

    let (mut sender, mut incoming) = socket.split();

    // 发送任务：唯一持有 sender 的地方
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    tracing::warn!(error = %err, event = event.name(), "failed to serialize websocket payload");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let gateway_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = incoming.next().await {
            if !handle_incoming(&gateway_state, ctx, message).await {
                break;
            }
        }
    });

    // 任意一侧结束即视为断开
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.gateway.disconnect(ctx).await;
    tracing::info!(user_id = %ctx.user_id, connection_id = %ctx.connection_id, "websocket disconnected");
}

/// 返回 false 表示连接应当结束
async fn handle_incoming(state: &AppState, ctx: ConnectionContext, message: WsMessage) -> bool {
    match message {
        WsMessage::Text(text) => state.gateway.handle_text(ctx, text.as_str()).await,
        WsMessage::Binary(data) => match std::str::from_utf8(&data) {
            Ok(text) => state.gateway.handle_text(ctx, text).await,
            Err(_) => tracing::debug!(connection_id = %ctx.connection_id, "ignoring non-utf8 binary frame"),
        },
        // tungstenite 会自动回复 pong
        WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        WsMessage::Close(_) => return false,
    }
    true
}
