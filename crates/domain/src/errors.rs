//! 领域模型错误定义
//!
//! 领域层只描述业务规则被违反的原因，不关心传输层如何呈现。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 参数不满足不变式
    #[error("invalid argument `{field}`: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 用户不是会话参与者
    #[error("user is not a participant of this conversation")]
    NotParticipant,

    /// 会话已被对方屏蔽
    #[error("conversation is blocked by the other participant")]
    ConversationBlocked,

    /// 广告发布者不能和自己发起会话
    #[error("ad owner cannot start a conversation with themselves")]
    SelfConversation,

    /// 通话状态迁移非法
    #[error("call cannot move from {from} to {to}")]
    InvalidCallTransition {
        from: &'static str,
        to: &'static str,
    },

    /// 业务上不允许的操作
    #[error("operation not allowed: {0}")]
    OperationNotAllowed(&'static str),
}

impl DomainError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 存储层错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("entity not found")]
    NotFound,
    #[error("entity already exists")]
    Conflict,
    #[error("storage failure: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
