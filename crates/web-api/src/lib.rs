//! Web API 层。
//!
//! 提供 Axum 路由：`/api/v1/ws` 上的实时事件通道，以及会话管理相关的 REST 接口。
//! 所有业务都委托给应用层的服务。

mod auth;
mod error;
mod routes;
mod state;
mod ws;

pub use auth::{AuthUser, Claims, JwtService, ACCESS_TOKEN_PROTOCOL};
pub use config::JwtConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::{AppState, StateDependencies};
