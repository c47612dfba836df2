//! JWT 认证
//!
//! `JwtService` 负责签发和校验令牌，并作为应用层的 `TokenVerifier`。
//! 凭证的收集规则在这里实现：子协议、查询参数、Authorization 头、Cookie。

use application::{HandshakeCredentials, TokenError, TokenVerifier};
use axum::{
    extract::{FromRequestParts, Query},
    http::{header, request::Parts, HeaderMap},
};
use config::JwtConfig;
use domain::{User, UserId};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind as JwtErrorKind, Algorithm, DecodingKey, EncodingKey,
    Header, Validation,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// 浏览器无法自定义握手头，令牌通过 `Sec-WebSocket-Protocol: access_token, <token>` 传入
pub const ACCESS_TOKEN_PROTOCOL: &str = "access_token";
const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token
    pub fn generate_token(&self, user_id: UserId) -> Result<String, ApiError> {
        let now = OffsetDateTime::now_utc();
        let exp = now + time::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|err| {
            ApiError::internal_server_error(format!("token generation failed: {err}"))
        })
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, TokenError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map(|token_data| token_data.claims)
            .map_err(|err| match err.kind() {
                JwtErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(err.to_string()),
            })
    }
}

impl TokenVerifier for JwtService {
    fn verify(&self, token: &str) -> Result<UserId, TokenError> {
        let claims = self.verify_token(token)?;
        Uuid::parse_str(&claims.sub)
            .map(UserId::from)
            .map_err(|_| TokenError::Invalid("subject is not a user id".into()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenQuery {
    pub token: Option<String>,
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// `access_token, <token>` 中紧跟在标记后面的那一项
fn protocol_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)?
        .to_str()
        .ok()?;
    let mut items = raw.split(',').map(str::trim);
    items.find(|item| *item == ACCESS_TOKEN_PROTOCOL)?;
    items.next().map(str::to_owned)
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == ACCESS_TOKEN_COOKIE)
        .map(|(_, value)| value.to_owned())
}

/// 收集握手请求里的全部候选凭证；REST 请求不读取子协议
pub(crate) fn collect_credentials(
    headers: &HeaderMap,
    query_token: Option<String>,
    include_protocol: bool,
) -> HandshakeCredentials {
    HandshakeCredentials {
        auth_token: include_protocol.then(|| protocol_token(headers)).flatten(),
        query_token,
        authorization_header: header_str(headers, header::AUTHORIZATION),
        cookie_token: cookie_token(headers),
    }
}

/// 已认证的 REST 调用方
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl AuthUser {
    pub fn id(&self) -> UserId {
        self.0.id
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let query = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .map(|Query(query)| query)
            .unwrap_or_default();
        let credentials = collect_credentials(&parts.headers, query.token, false);
        let user = state.authenticator.authenticate(&credentials).await?;
        Ok(AuthUser(user))
    }
}
