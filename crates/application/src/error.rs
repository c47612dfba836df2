use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::rate_limiter::RateLimitError;

/// 错误分类，传输层据此决定 HTTP 状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimited,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("validation failed: {}", details.join("; "))]
    Validation { details: Vec<String> },
    #[error("{message}")]
    Forbidden { code: &'static str, message: String },
    #[error("{message}")]
    NotFound { code: &'static str, message: String },
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl ApplicationError {
    pub fn validation(details: Vec<String>) -> Self {
        ApplicationError::Validation { details }
    }

    pub fn invalid_field(field: &str, reason: impl std::fmt::Display) -> Self {
        ApplicationError::Validation {
            details: vec![format!("{field}: {reason}")],
        }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        ApplicationError::Forbidden {
            code,
            message: message.into(),
        }
    }

    pub fn not_joined() -> Self {
        Self::forbidden("NOT_JOINED", "join the conversation before sending this event")
    }

    pub fn conversation_not_found() -> Self {
        ApplicationError::NotFound {
            code: "CONVERSATION_NOT_FOUND",
            message: "conversation not found".into(),
        }
    }

    pub fn message_not_found() -> Self {
        ApplicationError::NotFound {
            code: "MESSAGE_NOT_FOUND",
            message: "message not found".into(),
        }
    }

    pub fn call_not_found() -> Self {
        ApplicationError::NotFound {
            code: "CALL_NOT_FOUND",
            message: "call not found".into(),
        }
    }

    pub fn ad_not_found() -> Self {
        ApplicationError::NotFound {
            code: "AD_NOT_FOUND",
            message: "ad not found".into(),
        }
    }

    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApplicationError::Validation { .. } => ErrorKind::Validation,
            ApplicationError::Forbidden { .. } => ErrorKind::Authorization,
            ApplicationError::NotFound { .. } => ErrorKind::NotFound,
            ApplicationError::RateLimited(_) => ErrorKind::RateLimited,
            ApplicationError::Authentication(_) => ErrorKind::Authentication,
            ApplicationError::Domain(err) => match err {
                DomainError::InvalidArgument { .. } => ErrorKind::Validation,
                DomainError::InvalidCallTransition { .. } => ErrorKind::Conflict,
                DomainError::NotParticipant
                | DomainError::ConversationBlocked
                | DomainError::SelfConversation
                | DomainError::OperationNotAllowed(_) => ErrorKind::Authorization,
            },
            ApplicationError::Repository(err) => match err {
                RepositoryError::NotFound => ErrorKind::NotFound,
                RepositoryError::Conflict => ErrorKind::Conflict,
                RepositoryError::Storage { .. } => ErrorKind::Infrastructure,
            },
            ApplicationError::Infrastructure(_) => ErrorKind::Infrastructure,
        }
    }

    /// 对客户端稳定的错误码
    pub fn code(&self) -> &'static str {
        match self {
            ApplicationError::Validation { .. } => "VALIDATION_ERROR",
            ApplicationError::Forbidden { code, .. } | ApplicationError::NotFound { code, .. } => {
                code
            }
            ApplicationError::RateLimited(_) => "RATE_LIMITED",
            ApplicationError::Authentication(_) => "UNAUTHORIZED",
            ApplicationError::Domain(err) => match err {
                DomainError::InvalidArgument { .. } => "VALIDATION_ERROR",
                DomainError::NotParticipant => "NOT_PARTICIPANT",
                DomainError::ConversationBlocked => "CONVERSATION_BLOCKED",
                DomainError::InvalidCallTransition { .. } => "INVALID_CALL_STATE",
                DomainError::SelfConversation | DomainError::OperationNotAllowed(_) => {
                    "NOT_ALLOWED"
                }
            },
            ApplicationError::Repository(err) => match err {
                RepositoryError::NotFound => "NOT_FOUND",
                RepositoryError::Conflict => "CONFLICT",
                RepositoryError::Storage { .. } => "INTERNAL_ERROR",
            },
            ApplicationError::Infrastructure(_) => "INTERNAL_ERROR",
        }
    }

    /// 返回给客户端的描述。基础设施错误不暴露内部细节。
    pub fn client_message(&self) -> String {
        match self.kind() {
            ErrorKind::Infrastructure => "internal server error".to_owned(),
            ErrorKind::Validation => "validation failed".to_owned(),
            _ => self.to_string(),
        }
    }

    pub fn details(&self) -> Option<Vec<String>> {
        match self {
            ApplicationError::Validation { details } => Some(details.clone()),
            ApplicationError::Domain(DomainError::InvalidArgument { field, reason }) => {
                Some(vec![format!("{field}: {reason}")])
            }
            _ => None,
        }
    }

    /// 以秒为单位的重试提示，向上取整且至少为 1
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApplicationError::RateLimited(err) => Some(err.retry_after_ms().div_ceil(1000).max(1)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_hint_rounds_up_to_seconds() {
        let err = ApplicationError::from(RateLimitError::Exceeded {
            bucket: "message",
            limit: 60,
            retry_after_ms: 1_200,
        });
        assert_eq!(err.code(), "RATE_LIMITED");
        assert_eq!(err.retry_after_secs(), Some(2));

        let err = ApplicationError::from(RateLimitError::Exceeded {
            bucket: "typing",
            limit: 20,
            retry_after_ms: 1,
        });
        assert_eq!(err.retry_after_secs(), Some(1));
    }

    #[test]
    fn storage_failures_are_not_leaked() {
        let err = ApplicationError::from(RepositoryError::storage("connection refused"));
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(err.client_message(), "internal server error");
    }

    #[test]
    fn domain_errors_map_to_stable_codes() {
        assert_eq!(
            ApplicationError::from(DomainError::ConversationBlocked).code(),
            "CONVERSATION_BLOCKED"
        );
        let invalid = ApplicationError::from(DomainError::invalid_argument("text", "too long"));
        assert_eq!(invalid.code(), "VALIDATION_ERROR");
        assert_eq!(invalid.details(), Some(vec!["text: too long".to_owned()]));
    }
}
