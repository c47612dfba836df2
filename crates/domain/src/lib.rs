//! 实时聊天核心领域模型
//!
//! 会话、消息、通话三个实体以及它们的状态机。领域层不做 I/O，
//! 所有时间都由调用方传入。

pub mod call;
pub mod conversation;
pub mod errors;
pub mod message;
pub mod user;
pub mod value_objects;

pub use call::*;
pub use conversation::*;
pub use errors::*;
pub use message::*;
pub use user::*;
pub use value_objects::*;
