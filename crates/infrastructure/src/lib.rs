//! 基础设施层实现。
//!
//! 提供 PostgreSQL 连接池、迁移以及应用层存储接口的数据库实现。

pub mod db;
pub mod repository;

pub use db::{connect, create_pg_pool, InfrastructureError, MIGRATOR};
pub use repository::{
    PgCallRepository, PgConversationRepository, PgDirectory, PgMessageRepository, PgStorage,
};
