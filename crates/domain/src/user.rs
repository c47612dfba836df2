use serde::{Deserialize, Serialize};

use crate::value_objects::UserId;

/// 用户角色。账号本身由外部系统维护，这里只保留鉴权所需的最小信息。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
        }
    }

    /// 未知角色按普通用户处理
    pub fn parse(value: &str) -> Self {
        match value {
            "admin" => UserRole::Admin,
            _ => UserRole::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub role: UserRole,
}

impl User {
    pub fn new(id: UserId, role: UserRole) -> Self {
        Self { id, role }
    }
}
