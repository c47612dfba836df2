//! 在线状态跟踪
//!
//! 进程内维护 用户 -> 活跃连接集合。只有第一个连接建立和最后一个连接断开
//! 才算状态迁移，多标签页、多设备之间切换不会来回抖动。
//! 状态不持久化，进程重启后全部用户视为离线。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domain::{Timestamp, UserId};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::rooms::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
}

/// 广播给客户端的在线状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub state: PresenceState,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<Timestamp>,
}

/// `go_online` / `go_offline` 的结果，`changed` 为真时需要广播
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub update: PresenceUpdate,
    pub changed: bool,
}

#[derive(Default)]
struct PresenceTable {
    online: HashMap<UserId, HashSet<ConnectionId>>,
    last_seen: HashMap<UserId, Timestamp>,
}

pub struct PresenceTracker {
    clock: Arc<dyn Clock>,
    table: RwLock<PresenceTable>,
}

impl PresenceTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            table: RwLock::new(PresenceTable::default()),
        }
    }

    pub async fn go_online(&self, user_id: UserId, connection_id: ConnectionId) -> PresenceChange {
        let mut table = self.table.write().await;
        let connections = table.online.entry(user_id).or_default();
        let changed = connections.is_empty();
        connections.insert(connection_id);
        let count = connections.len();

        if changed {
            tracing::info!(user_id = %user_id, connection_id = %connection_id, "用户上线");
        } else {
            tracing::debug!(user_id = %user_id, connections = count, "用户新增连接");
        }

        PresenceChange {
            update: PresenceUpdate {
                user_id,
                state: PresenceState::Online,
                last_seen_at: None,
            },
            changed,
        }
    }

    pub async fn go_offline(&self, user_id: UserId, connection_id: ConnectionId) -> PresenceChange {
        let mut guard = self.table.write().await;
        let table = &mut *guard;

        let Some(connections) = table.online.get_mut(&user_id) else {
            let last_seen_at = table.last_seen.get(&user_id).copied();
            return PresenceChange {
                update: PresenceUpdate {
                    user_id,
                    state: PresenceState::Offline,
                    last_seen_at,
                },
                changed: false,
            };
        };

        connections.remove(&connection_id);
        if !connections.is_empty() {
            return PresenceChange {
                update: PresenceUpdate {
                    user_id,
                    state: PresenceState::Online,
                    last_seen_at: None,
                },
                changed: false,
            };
        }

        table.online.remove(&user_id);
        let now = self.clock.now();
        table.last_seen.insert(user_id, now);
        tracing::info!(user_id = %user_id, "用户离线");

        PresenceChange {
            update: PresenceUpdate {
                user_id,
                state: PresenceState::Offline,
                last_seen_at: Some(now),
            },
            changed: true,
        }
    }

    pub async fn snapshot(&self, user_id: UserId) -> PresenceUpdate {
        let table = self.table.read().await;
        if table.online.contains_key(&user_id) {
            PresenceUpdate {
                user_id,
                state: PresenceState::Online,
                last_seen_at: None,
            }
        } else {
            PresenceUpdate {
                user_id,
                state: PresenceState::Offline,
                last_seen_at: table.last_seen.get(&user_id).copied(),
            }
        }
    }

    pub async fn connection_count(&self, user_id: UserId) -> usize {
        self.table
            .read()
            .await
            .online
            .get(&user_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use time::macros::datetime;

    fn tracker() -> (PresenceTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
        (PresenceTracker::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn second_connection_does_not_flap() {
        let (tracker, clock) = tracker();
        let user = UserId::generate();
        let tab_a = ConnectionId::generate();
        let tab_b = ConnectionId::generate();

        assert!(tracker.go_online(user, tab_a).await.changed);
        assert!(!tracker.go_online(user, tab_b).await.changed);
        assert_eq!(tracker.connection_count(user).await, 2);

        let first = tracker.go_offline(user, tab_a).await;
        assert!(!first.changed);
        assert_eq!(first.update.state, PresenceState::Online);

        clock.advance(time::Duration::minutes(1));
        let second = tracker.go_offline(user, tab_b).await;
        assert!(second.changed);
        assert_eq!(second.update.state, PresenceState::Offline);
        assert_eq!(second.update.last_seen_at, Some(datetime!(2024-05-01 10:01 UTC)));
    }

    #[tokio::test]
    async fn snapshot_reports_last_seen_after_disconnect() {
        let (tracker, _clock) = tracker();
        let user = UserId::generate();
        let connection = ConnectionId::generate();

        assert_eq!(tracker.snapshot(user).await.last_seen_at, None);
        tracker.go_online(user, connection).await;
        assert_eq!(tracker.snapshot(user).await.state, PresenceState::Online);
        tracker.go_offline(user, connection).await;

        let snapshot = tracker.snapshot(user).await;
        assert_eq!(snapshot.state, PresenceState::Offline);
        assert_eq!(snapshot.last_seen_at, Some(datetime!(2024-05-01 10:00 UTC)));
    }

    #[tokio::test]
    async fn unknown_connection_going_offline_is_ignored() {
        let (tracker, _clock) = tracker();
        let change = tracker
            .go_offline(UserId::generate(), ConnectionId::generate())
            .await;
        assert!(!change.changed);
    }
}
