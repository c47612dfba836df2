//! 应用层实现。
//!
//! 实时聊天核心：连接认证、房间与在线状态、限流、消息分发和通话信令。
//! 持久化通过 `repository` 中的接口访问，传输层只需要把文本帧交给 `ChatGateway`。

pub mod auth;
pub mod clock;
pub mod error;
pub mod events;
pub mod gateway;
pub mod memory;
pub mod presence;
pub mod rate_limiter;
pub mod repository;
pub mod rooms;
pub mod services;

pub use auth::{HandshakeCredentials, SessionAuthenticator, TokenError, TokenVerifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ApplicationError, ErrorKind};
pub use events::{ClientEvent, EventKind, InboundFrame, RateBucket, ServerEvent};
pub use gateway::{ChatGateway, ChatGatewayDependencies, RateLimits};
pub use presence::{PresenceChange, PresenceState, PresenceTracker, PresenceUpdate};
pub use rate_limiter::{RateLimitError, RateLimiter};
pub use repository::{
    AdDirectory, CallRepository, ConversationRepository, MessageRepository, MessageSearch,
    UserRepository,
};
pub use rooms::{Channel, ConnectionContext, ConnectionId, EventSender, Room, RoomManager};
pub use services::{
    CallService, CallServiceDependencies, ChatService, ChatServiceDependencies,
    ConversationService, ConversationServiceDependencies, ConversationView, HistoryLimits,
    MessagePage, MessageSearchPage, ReportMessageRequest, SearchMessagesRequest,
    StartConversationRequest, StartedConversation,
};
