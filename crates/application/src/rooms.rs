//! 连接与房间管理
//!
//! 每个连接在注册时自动订阅自己用户的私有频道（来电、定向通知），
//! 加入会话后再订阅会话频道。广播时按连接去重，同一连接即便同时在多个
//! 目标频道里也只收到一次。

use std::collections::{HashMap, HashSet};
use std::fmt;

use domain::{ConversationId, UserId};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::events::ServerEvent;

/// 单个连接的出站队列
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 已认证连接的身份标签，整个连接生命周期内不变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    User(UserId),
    Conversation(ConversationId),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::User(id) => write!(f, "user:{id}"),
            Channel::Conversation(id) => write!(f, "conversation:{id}"),
        }
    }
}

struct ConnectionEntry {
    user_id: UserId,
    sender: EventSender,
    channels: HashSet<Channel>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    channels: HashMap<Channel, HashSet<ConnectionId>>,
}

impl Registry {
    fn subscribe(&mut self, connection_id: ConnectionId, channel: Channel) -> bool {
        let Some(entry) = self.connections.get_mut(&connection_id) else {
            return false;
        };
        entry.channels.insert(channel);
        self.channels
            .entry(channel)
            .or_default()
            .insert(connection_id)
    }
}

#[derive(Default)]
pub struct RoomManager {
    registry: RwLock<Registry>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册新连接并订阅用户私有频道
    pub async fn register(&self, user_id: UserId, sender: EventSender) -> ConnectionContext {
        let connection_id = ConnectionId::generate();
        let mut registry = self.registry.write().await;
        registry.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                sender,
                channels: HashSet::new(),
            },
        );
        registry.subscribe(connection_id, Channel::User(user_id));
        tracing::debug!(user_id = %user_id, connection_id = %connection_id, "连接已注册");

        ConnectionContext {
            connection_id,
            user_id,
        }
    }

    /// 注销连接并退出全部频道，返回连接所属用户
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<UserId> {
        let mut registry = self.registry.write().await;
        let entry = registry.connections.remove(&connection_id)?;
        for channel in &entry.channels {
            if let Some(members) = registry.channels.get_mut(channel) {
                members.remove(&connection_id);
                if members.is_empty() {
                    registry.channels.remove(channel);
                }
            }
        }
        tracing::debug!(
            user_id = %entry.user_id,
            connection_id = %connection_id,
            channels = entry.channels.len(),
            "连接已注销"
        );
        Some(entry.user_id)
    }

    /// 订阅会话频道。参与者校验由调用方完成。
    pub async fn join_conversation(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> bool {
        self.registry
            .write()
            .await
            .subscribe(connection_id, Channel::Conversation(conversation_id))
    }

    pub async fn is_subscribed(&self, connection_id: ConnectionId, channel: Channel) -> bool {
        self.registry
            .read()
            .await
            .channels
            .get(&channel)
            .is_some_and(|members| members.contains(&connection_id))
    }

    pub async fn subscriber_count(&self, channel: Channel) -> usize {
        self.registry
            .read()
            .await
            .channels
            .get(&channel)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn room(&self, conversation_id: ConversationId) -> Room<'_> {
        Room {
            manager: self,
            channel: Channel::Conversation(conversation_id),
        }
    }

    pub fn user(&self, user_id: UserId) -> Room<'_> {
        Room {
            manager: self,
            channel: Channel::User(user_id),
        }
    }

    /// 只发给一个连接，用于错误和确认类事件
    pub async fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let registry = self.registry.read().await;
        match registry.connections.get(&connection_id) {
            Some(entry) => entry.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// 向若干频道的并集投递，每个连接最多一次；返回投递成功的连接数
    pub async fn publish(
        &self,
        channels: &[Channel],
        event: ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let registry = self.registry.read().await;
        let mut targets: HashSet<ConnectionId> = HashSet::new();
        for channel in channels {
            if let Some(members) = registry.channels.get(channel) {
                targets.extend(members.iter().copied());
            }
        }
        if let Some(except) = except {
            targets.remove(&except);
        }

        let mut delivered = 0;
        for connection_id in targets {
            let Some(entry) = registry.connections.get(&connection_id) else {
                continue;
            };
            if entry.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(connection_id = %connection_id, "连接出站队列已关闭，跳过");
            }
        }
        tracing::trace!(event = event.name(), delivered, "事件已投递");
        delivered
    }

    /// 发给所有在线连接
    pub async fn broadcast_all(&self, event: ServerEvent) -> usize {
        let registry = self.registry.read().await;
        registry
            .connections
            .values()
            .filter(|entry| entry.sender.send(event.clone()).is_ok())
            .count()
    }
}

/// 单个频道的发布句柄
pub struct Room<'a> {
    manager: &'a RoomManager,
    channel: Channel,
}

impl Room<'_> {
    pub async fn publish(&self, event: ServerEvent) -> usize {
        self.manager.publish(&[self.channel], event, None).await
    }

    pub async fn publish_except(&self, except: ConnectionId, event: ServerEvent) -> usize {
        self.manager
            .publish(&[self.channel], event, Some(except))
            .await
    }

    pub async fn member_count(&self) -> usize {
        self.manager.subscriber_count(self.channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ServerEvent, TypingNotice};

    fn typing(conversation_id: ConversationId, user_id: UserId) -> ServerEvent {
        ServerEvent::TypingStart(TypingNotice {
            conversation_id,
            user_id,
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn room_broadcast_reaches_every_subscribed_connection_once() {
        let rooms = RoomManager::new();
        let alice = UserId::generate();
        let bob = UserId::generate();
        let conversation = ConversationId::generate();

        let (tx_a1, mut rx_a1) = mpsc::unbounded_channel();
        let (tx_a2, mut rx_a2) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a1 = rooms.register(alice, tx_a1).await;
        let a2 = rooms.register(alice, tx_a2).await;
        let b = rooms.register(bob, tx_b).await;

        for ctx in [a1, a2, b] {
            assert!(rooms.join_conversation(ctx.connection_id, conversation).await);
        }
        assert!(!rooms.join_conversation(a1.connection_id, conversation).await);

        let delivered = rooms
            .publish(
                &[Channel::Conversation(conversation), Channel::User(alice)],
                typing(conversation, alice),
                Some(a1.connection_id),
            )
            .await;

        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut rx_a1), 0);
        assert_eq!(drain(&mut rx_a2), 1);
        assert_eq!(drain(&mut rx_b), 1);
    }

    #[tokio::test]
    async fn unregister_removes_all_subscriptions() {
        let rooms = RoomManager::new();
        let alice = UserId::generate();
        let conversation = ConversationId::generate();
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = rooms.register(alice, tx).await;
        rooms.join_conversation(ctx.connection_id, conversation).await;

        assert_eq!(rooms.room(conversation).member_count().await, 1);
        assert_eq!(rooms.unregister(ctx.connection_id).await, Some(alice));
        assert_eq!(rooms.room(conversation).member_count().await, 0);
        assert_eq!(rooms.user(alice).member_count().await, 0);
        assert!(!rooms.join_conversation(ctx.connection_id, conversation).await);
    }

    #[tokio::test]
    async fn closed_receivers_are_skipped() {
        let rooms = RoomManager::new();
        let alice = UserId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        rooms.register(alice, tx).await;
        drop(rx);

        assert_eq!(rooms.user(alice).publish(typing(ConversationId::generate(), alice)).await, 0);
    }
}
