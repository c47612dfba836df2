use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use domain::{
    Call, CallEndReason, CallId, CallStatus, ConversationId, DomainError, RepositoryError,
    Timestamp, UserId,
};

use crate::{
    clock::Clock,
    error::ApplicationError,
    events::{
        CallAnswer, CallEnd, CallIceCandidate, CallIncoming, CallInitiate, CallOffer, CallRef,
        CallTerminated, RelayedAnswer, RelayedCandidate, RelayedOffer, ServerEvent,
    },
    repository::CallRepository,
    rooms::{Channel, ConnectionContext, RoomManager},
    services::ChatService,
};

pub struct CallServiceDependencies {
    pub calls: Arc<dyn CallRepository>,
    pub chat: Arc<ChatService>,
    pub rooms: Arc<RoomManager>,
    pub clock: Arc<dyn Clock>,
}

/// 通话信令中继
///
/// 维护通话记录的状态机，并在两位参与者之间原样转发 offer / answer / ICE。
/// 进入终态时通过消息持久化路径追加一条 `call` 类型的摘要消息。
pub struct CallService {
    deps: CallServiceDependencies,
    /// 正在进入终态的通话，防止并发的 end/reject 重复写摘要
    finalizing: Mutex<HashSet<CallId>>,
}

/// 终态转换期间持有，离开作用域时释放
struct FinalizeGuard<'a> {
    set: &'a Mutex<HashSet<CallId>>,
    call_id: CallId,
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.call_id);
    }
}

/// 转发目标：会话房间加上对方的私有频道，按连接去重
fn relay_targets(call: &Call, from: UserId) -> Vec<Channel> {
    let mut channels = vec![Channel::Conversation(call.conversation_id)];
    channels.extend(
        call.participants
            .iter()
            .filter(|participant| **participant != from)
            .map(|participant| Channel::User(*participant)),
    );
    channels
}

impl CallService {
    pub fn new(deps: CallServiceDependencies) -> Self {
        Self {
            deps,
            finalizing: Mutex::new(HashSet::new()),
        }
    }

    fn now(&self) -> Timestamp {
        self.deps.clock.now()
    }

    fn begin_finalize(&self, call_id: CallId) -> Option<FinalizeGuard<'_>> {
        let inserted = self
            .finalizing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(call_id);
        inserted.then_some(FinalizeGuard {
            set: &self.finalizing,
            call_id,
        })
    }

    async fn load_call(&self, call_id: CallId) -> Result<Call, ApplicationError> {
        self.deps
            .calls
            .find_by_id(call_id)
            .await?
            .ok_or_else(ApplicationError::call_not_found)
    }

    /// 加载通话并校验参与者身份与所属会话
    async fn call_for(
        &self,
        user_id: UserId,
        call_id: CallId,
        conversation_id: ConversationId,
    ) -> Result<Call, ApplicationError> {
        let call = self.load_call(call_id).await?;
        if call.conversation_id != conversation_id {
            return Err(ApplicationError::call_not_found());
        }
        if !call.is_participant(user_id) {
            return Err(DomainError::NotParticipant.into());
        }
        Ok(call)
    }

    pub async fn initiate(
        &self,
        ctx: ConnectionContext,
        request: CallInitiate,
    ) -> Result<Call, ApplicationError> {
        let conversation = self
            .deps
            .chat
            .conversation_for(ctx.user_id, request.conversation_id)
            .await?;
        conversation.ensure_can_send(ctx.user_id)?;

        let now = self.now();
        let call = Call::initiate(
            CallId::generate(),
            &conversation,
            ctx.user_id,
            request.media_type,
            now,
        )?;
        let call = self.deps.calls.create(call).await?;

        tracing::info!(
            call_id = %call.id,
            conversation_id = %call.conversation_id,
            initiator_id = %call.initiator_id,
            media_type = call.media_type.as_str(),
            "发起通话"
        );

        let event = ServerEvent::CallIncoming(CallIncoming {
            call_id: call.id,
            conversation_id: call.conversation_id,
            initiator_id: call.initiator_id,
            media_type: call.media_type,
            timestamp: now,
        });
        self.deps
            .rooms
            .user(call.callee())
            .publish(event.clone())
            .await;
        // 发起方从这里拿到通话 id
        self.deps.rooms.send_to(ctx.connection_id, event).await;
        Ok(call)
    }

    pub async fn offer(
        &self,
        ctx: ConnectionContext,
        request: CallOffer,
    ) -> Result<Call, ApplicationError> {
        let mut call = self
            .call_for(ctx.user_id, request.call_id, request.conversation_id)
            .await?;
        if call.mark_ringing(self.now())? {
            self.deps.calls.update(&call).await?;
            tracing::info!(call_id = %call.id, "通话振铃");
        }

        let event = ServerEvent::CallOffer(RelayedOffer {
            call_id: call.id,
            conversation_id: call.conversation_id,
            from_user_id: ctx.user_id,
            offer: request.offer,
        });
        self.deps
            .rooms
            .publish(&relay_targets(&call, ctx.user_id), event, Some(ctx.connection_id))
            .await;
        Ok(call)
    }

    pub async fn answer(
        &self,
        ctx: ConnectionContext,
        request: CallAnswer,
    ) -> Result<Call, ApplicationError> {
        let mut call = self
            .call_for(ctx.user_id, request.call_id, request.conversation_id)
            .await?;
        if call.mark_answered(self.now())? {
            self.deps.calls.update(&call).await?;
            tracing::info!(call_id = %call.id, user_id = %ctx.user_id, "通话接通");
        }

        let event = ServerEvent::CallAnswer(RelayedAnswer {
            call_id: call.id,
            conversation_id: call.conversation_id,
            from_user_id: ctx.user_id,
            answer: request.answer,
        });
        self.deps
            .rooms
            .publish(&relay_targets(&call, ctx.user_id), event, Some(ctx.connection_id))
            .await;
        Ok(call)
    }

    /// 纯转发，不改变通话状态
    pub async fn ice_candidate(
        &self,
        ctx: ConnectionContext,
        request: CallIceCandidate,
    ) -> Result<(), ApplicationError> {
        let joined = self
            .deps
            .rooms
            .is_subscribed(
                ctx.connection_id,
                Channel::Conversation(request.conversation_id),
            )
            .await;
        if !joined {
            return Err(ApplicationError::not_joined());
        }
        let call = self
            .call_for(ctx.user_id, request.call_id, request.conversation_id)
            .await?;

        let event = ServerEvent::CallIceCandidate(RelayedCandidate {
            call_id: call.id,
            conversation_id: call.conversation_id,
            from_user_id: ctx.user_id,
            candidate: request.candidate,
        });
        self.deps
            .rooms
            .publish(&relay_targets(&call, ctx.user_id), event, Some(ctx.connection_id))
            .await;
        Ok(())
    }

    /// 任一参与者结束通话。`error` 原因记为 `failed`。
    pub async fn end(&self, user_id: UserId, request: CallEnd) -> Result<Call, ApplicationError> {
        let call = self
            .call_for(user_id, request.call_id, request.conversation_id)
            .await?;
        let reason = request.reason.unwrap_or(if call.started_at.is_some() {
            CallEndReason::Completed
        } else {
            CallEndReason::Cancelled
        });
        let status = match reason {
            CallEndReason::Error => CallStatus::Failed,
            _ => CallStatus::Ended,
        };
        self.finalize(call, status, reason, Some(user_id), ServerEvent::CallEnded)
            .await
    }

    /// 只有被叫方可以拒接
    pub async fn reject(&self, user_id: UserId, request: CallRef) -> Result<Call, ApplicationError> {
        let call = self
            .call_for(user_id, request.call_id, request.conversation_id)
            .await?;
        if call.is_terminal() && !call.awaits_summary() {
            return Ok(call);
        }
        if call.callee() != user_id {
            return Err(
                DomainError::OperationNotAllowed("only the callee can reject a call").into(),
            );
        }
        self.finalize(
            call,
            CallStatus::Rejected,
            CallEndReason::Rejected,
            Some(user_id),
            ServerEvent::CallRejected,
        )
        .await
    }

    /// 只有发起方可以在接通前取消
    pub async fn cancel(&self, user_id: UserId, request: CallRef) -> Result<Call, ApplicationError> {
        let call = self
            .call_for(user_id, request.call_id, request.conversation_id)
            .await?;
        if call.is_terminal() && !call.awaits_summary() {
            return Ok(call);
        }
        if call.initiator_id != user_id {
            return Err(
                DomainError::OperationNotAllowed("only the initiator can cancel a call").into(),
            );
        }
        if call.status == CallStatus::Answered {
            return Err(DomainError::InvalidCallTransition {
                from: CallStatus::Answered.as_str(),
                to: "cancelled",
            }
            .into());
        }
        self.finalize(
            call,
            CallStatus::Ended,
            CallEndReason::Cancelled,
            Some(user_id),
            ServerEvent::CallCancelled,
        )
        .await
    }

    /// 振铃超时，由外部定时器调用
    pub async fn mark_missed(&self, call_id: CallId) -> Result<Call, ApplicationError> {
        let call = self.load_call(call_id).await?;
        if call.status == CallStatus::Answered {
            return Err(DomainError::InvalidCallTransition {
                from: CallStatus::Answered.as_str(),
                to: CallStatus::Missed.as_str(),
            }
            .into());
        }
        self.finalize(
            call,
            CallStatus::Missed,
            CallEndReason::Timeout,
            None,
            ServerEvent::CallEnded,
        )
        .await
    }

    async fn finalize(
        &self,
        call: Call,
        status: CallStatus,
        reason: CallEndReason,
        ended_by: Option<UserId>,
        into_event: fn(CallTerminated) -> ServerEvent,
    ) -> Result<Call, ApplicationError> {
        let Some(_guard) = self.begin_finalize(call.id) else {
            tracing::debug!(call_id = %call.id, "通话正在结束，忽略重复请求");
            return Ok(call);
        };
        // 拿到标记后重新读取，避免基于过期状态写入
        let mut call = self.load_call(call.id).await?;
        let now = self.now();
        if call.finish(status, reason, now)? {
            self.deps.calls.update(&call).await?;
            tracing::info!(
                call_id = %call.id,
                conversation_id = %call.conversation_id,
                status = call.status.as_str(),
                reason = reason.as_str(),
                duration = ?call.duration,
                "通话结束"
            );
        } else if !call.awaits_summary() {
            tracing::debug!(call_id = %call.id, status = call.status.as_str(), "通话已是终态");
            return Ok(call);
        }

        // 摘要写入失败时通话保持待补写状态，下一次结束请求会重试
        if let Some(message) = call.summary_message() {
            let message_id = message.id;
            let conversation = self.deps.chat.load_conversation(call.conversation_id).await?;
            match self.deps.chat.append_message(conversation, message).await {
                Ok(_) => {}
                Err(ApplicationError::Repository(RepositoryError::Conflict)) => {
                    tracing::debug!(call_id = %call.id, "摘要消息已存在");
                }
                Err(err) => {
                    tracing::warn!(call_id = %call.id, error = %err, "通话摘要写入失败");
                    return Err(err);
                }
            }
            call.summary_message_id = Some(message_id);
            self.deps.calls.update(&call).await?;
        }

        let event = into_event(CallTerminated {
            call_id: call.id,
            conversation_id: call.conversation_id,
            status: call.status,
            reason: call.end_reason,
            duration: call.duration,
            ended_at: call.ended_at,
            ended_by,
        });
        let [first, second] = call.participants;
        self.deps
            .rooms
            .publish(
                &[
                    Channel::Conversation(call.conversation_id),
                    Channel::User(first),
                    Channel::User(second),
                ],
                event,
                None,
            )
            .await;
        Ok(call)
    }

    /// 会话的通话记录，最新的在前
    pub async fn history(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Call>, ApplicationError> {
        let conversation = self
            .deps
            .chat
            .conversation_for(user_id, conversation_id)
            .await?;
        Ok(self
            .deps
            .calls
            .list_for_conversation(conversation.id, limit, offset)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_targets_skip_sender_private_channel() {
        let conversation = domain::Conversation::start(
            ConversationId::generate(),
            domain::AdId::generate(),
            UserId::generate(),
            UserId::generate(),
            Timestamp::now_utc(),
        )
        .unwrap();
        let call = Call::initiate(
            CallId::generate(),
            &conversation,
            conversation.owner_id,
            domain::CallMediaType::Audio,
            Timestamp::now_utc(),
        )
        .unwrap();

        let targets = relay_targets(&call, conversation.owner_id);
        assert_eq!(
            targets,
            vec![
                Channel::Conversation(conversation.id),
                Channel::User(conversation.buyer_id)
            ]
        );
    }
}
