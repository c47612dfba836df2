//! 连接认证
//!
//! 握手请求可能在四个位置携带凭证，按固定优先级取第一个非空的：
//! 认证载荷（子协议）、查询参数、Authorization 头、Cookie。

use std::sync::Arc;

use domain::{User, UserId};
use thiserror::Error;

use crate::error::ApplicationError;
use crate::repository::UserRepository;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// 凭证校验，返回令牌里声明的用户
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserId, TokenError>;
}

/// 握手请求中收集到的候选凭证
#[derive(Debug, Clone, Default)]
pub struct HandshakeCredentials {
    pub auth_token: Option<String>,
    pub query_token: Option<String>,
    pub authorization_header: Option<String>,
    pub cookie_token: Option<String>,
}

fn normalize(raw: &str) -> Option<&str> {
    let token = raw.trim();
    let token = token
        .strip_prefix("Bearer ")
        .or_else(|| token.strip_prefix("bearer "))
        .unwrap_or(token)
        .trim();
    (!token.is_empty()).then_some(token)
}

impl HandshakeCredentials {
    pub fn select(&self) -> Option<&str> {
        [
            &self.auth_token,
            &self.query_token,
            &self.authorization_header,
            &self.cookie_token,
        ]
        .into_iter()
        .filter_map(|candidate| candidate.as_deref())
        .find_map(normalize)
    }
}

pub struct SessionAuthenticator {
    verifier: Arc<dyn TokenVerifier>,
    users: Arc<dyn UserRepository>,
}

impl SessionAuthenticator {
    pub fn new(verifier: Arc<dyn TokenVerifier>, users: Arc<dyn UserRepository>) -> Self {
        Self { verifier, users }
    }

    pub async fn authenticate(
        &self,
        credentials: &HandshakeCredentials,
    ) -> Result<User, ApplicationError> {
        let token = credentials
            .select()
            .ok_or_else(|| ApplicationError::Authentication("missing credential".into()))?;
        let user_id = self.verifier.verify(token).map_err(|err| {
            tracing::debug!(error = %err, "凭证校验失败");
            ApplicationError::Authentication(err.to_string())
        })?;
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| ApplicationError::Authentication("unknown user".into()))?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDirectory;
    use domain::UserRole;

    struct PlainVerifier;

    impl TokenVerifier for PlainVerifier {
        fn verify(&self, token: &str) -> Result<UserId, TokenError> {
            token
                .parse::<uuid::Uuid>()
                .map(UserId::from)
                .map_err(|err| TokenError::Invalid(err.to_string()))
        }
    }

    #[test]
    fn credentials_follow_priority_and_strip_bearer() {
        let credentials = HandshakeCredentials {
            auth_token: Some("  ".into()),
            query_token: None,
            authorization_header: Some("Bearer header-token".into()),
            cookie_token: Some("cookie-token".into()),
        };
        assert_eq!(credentials.select(), Some("header-token"));

        let credentials = HandshakeCredentials {
            auth_token: Some("Bearer payload".into()),
            query_token: Some("query".into()),
            ..Default::default()
        };
        assert_eq!(credentials.select(), Some("payload"));
        assert_eq!(HandshakeCredentials::default().select(), None);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let directory = Arc::new(InMemoryDirectory::new());
        let known = UserId::generate();
        directory.insert_user(User::new(known, UserRole::User)).await;
        let authenticator = SessionAuthenticator::new(Arc::new(PlainVerifier), directory);

        let ok = HandshakeCredentials {
            query_token: Some(known.to_string()),
            ..Default::default()
        };
        assert_eq!(authenticator.authenticate(&ok).await.unwrap().id, known);

        let stranger = HandshakeCredentials {
            query_token: Some(UserId::generate().to_string()),
            ..Default::default()
        };
        let err = authenticator.authenticate(&stranger).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        let garbage = HandshakeCredentials {
            cookie_token: Some("not-a-token".into()),
            ..Default::default()
        };
        assert!(authenticator.authenticate(&garbage).await.is_err());
    }
}
