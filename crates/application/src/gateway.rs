//! 单个连接的事件入口
//!
//! 传输层只负责收发文本帧，连接注册、在线状态、限流、解码和分发都在这里完成。
//! 任何失败都只回给触发它的连接，连接本身保持打开。

use std::sync::Arc;

use domain::UserId;

use crate::{
    error::{ApplicationError, ErrorKind},
    events::{ClientEvent, InboundFrame, RateBucket, ServerEvent},
    presence::{PresenceTracker, PresenceUpdate},
    rate_limiter::RateLimiter,
    rooms::{ConnectionContext, EventSender, RoomManager},
    services::{CallService, ChatService},
};

/// 两个按用户计数的限流桶
pub struct RateLimits {
    pub messages: Arc<RateLimiter>,
    pub typing: Arc<RateLimiter>,
}

impl RateLimits {
    pub fn bucket(&self, bucket: RateBucket) -> &RateLimiter {
        match bucket {
            RateBucket::Message => &self.messages,
            RateBucket::Typing => &self.typing,
        }
    }

    /// 清理过期窗口，返回清理的条目数
    pub fn purge_expired(&self) -> usize {
        self.messages.purge_expired() + self.typing.purge_expired()
    }
}

pub struct ChatGatewayDependencies {
    pub rooms: Arc<RoomManager>,
    pub presence: Arc<PresenceTracker>,
    pub chat: Arc<ChatService>,
    pub calls: Arc<CallService>,
    pub limits: Arc<RateLimits>,
}

pub struct ChatGateway {
    deps: ChatGatewayDependencies,
}

impl ChatGateway {
    pub fn new(deps: ChatGatewayDependencies) -> Self {
        Self { deps }
    }

    pub async fn presence_of(&self, user_id: UserId) -> PresenceUpdate {
        self.deps.presence.snapshot(user_id).await
    }

    pub fn check_rate(&self, bucket: RateBucket, user_id: UserId) -> Result<(), ApplicationError> {
        self.deps.limits.bucket(bucket).consume(user_id)?;
        Ok(())
    }

    /// 已认证连接上线：注册、订阅私有频道、必要时广播在线状态
    pub async fn connect(&self, user_id: UserId, sender: EventSender) -> ConnectionContext {
        let ctx = self.deps.rooms.register(user_id, sender).await;
        let change = self
            .deps
            .presence
            .go_online(user_id, ctx.connection_id)
            .await;
        if change.changed {
            self.deps
                .rooms
                .broadcast_all(ServerEvent::PresenceUpdate(change.update))
                .await;
        }
        ctx
    }

    pub async fn disconnect(&self, ctx: ConnectionContext) {
        self.deps.rooms.unregister(ctx.connection_id).await;
        let change = self
            .deps
            .presence
            .go_offline(ctx.user_id, ctx.connection_id)
            .await;
        if change.changed {
            self.deps
                .rooms
                .broadcast_all(ServerEvent::PresenceUpdate(change.update))
                .await;
        }
    }

    /// 处理一帧入站文本，失败时向该连接回送 `error` 事件
    pub async fn handle_text(&self, ctx: ConnectionContext, raw: &str) {
        if let Err(err) = self.dispatch(ctx, raw).await {
            match err.kind() {
                ErrorKind::Infrastructure => {
                    tracing::error!(user_id = %ctx.user_id, error = %err, "事件处理失败")
                }
                ErrorKind::RateLimited => {}
                _ => tracing::debug!(user_id = %ctx.user_id, code = err.code(), error = %err, "事件被拒绝"),
            }
            self.deps
                .rooms
                .send_to(ctx.connection_id, ServerEvent::error(&err))
                .await;
        }
    }

    async fn dispatch(&self, ctx: ConnectionContext, raw: &str) -> Result<(), ApplicationError> {
        let frame = InboundFrame::parse(raw)?;
        if let Some(bucket) = frame.kind.rate_bucket() {
            self.check_rate(bucket, ctx.user_id)?;
        }
        let user_id = ctx.user_id;

        match frame.decode()? {
            ClientEvent::JoinConversation(request) => self.deps.chat.join(ctx, request).await,
            ClientEvent::SendMessage(request) => {
                self.deps.chat.send(user_id, request).await.map(|_| ())
            }
            ClientEvent::MessageReceived(request) => self
                .deps
                .chat
                .acknowledge_delivery(user_id, request)
                .await
                .map(|_| ()),
            ClientEvent::MarkRead(request) => {
                self.deps.chat.mark_read(user_id, request).await.map(|_| ())
            }
            ClientEvent::TypingStart(signal) => self.deps.chat.typing(ctx, signal, true).await,
            ClientEvent::TypingStop(signal) => self.deps.chat.typing(ctx, signal, false).await,
            ClientEvent::CallInitiate(request) => {
                self.deps.calls.initiate(ctx, request).await.map(|_| ())
            }
            ClientEvent::CallOffer(request) => self.deps.calls.offer(ctx, request).await.map(|_| ()),
            ClientEvent::CallAnswer(request) => {
                self.deps.calls.answer(ctx, request).await.map(|_| ())
            }
            ClientEvent::CallIceCandidate(request) => {
                self.deps.calls.ice_candidate(ctx, request).await
            }
            ClientEvent::CallEnd(request) => self.deps.calls.end(user_id, request).await.map(|_| ()),
            ClientEvent::CallReject(request) => {
                self.deps.calls.reject(user_id, request).await.map(|_| ())
            }
            ClientEvent::CallCancel(request) => {
                self.deps.calls.cancel(user_id, request).await.map(|_| ())
            }
        }
    }
}
