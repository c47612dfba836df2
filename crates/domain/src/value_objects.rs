use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// 统一的时间戳类型。
pub type Timestamp = OffsetDateTime;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

entity_id!(
    /// 用户唯一标识，由外部账号系统分配。
    UserId
);
entity_id!(
    /// 广告唯一标识。
    AdId
);
entity_id!(
    /// 会话唯一标识。
    ConversationId
);
entity_id!(
    /// 消息唯一标识。
    MessageId
);
entity_id!(
    /// 通话记录唯一标识。
    CallId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_uuid_strings() {
        let raw = Uuid::new_v4();
        let id = ConversationId::from(raw);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{raw}\""));
        let back: ConversationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
