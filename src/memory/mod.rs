//! 记忆层：对话记忆（按会话滑动窗口）、待办意图队列、可选 SQLite 持久化

pub mod conversation;
pub mod pending;
pub mod sqlite;

pub use conversation::{ChatMemory, InMemoryChatMemory, Message, Role};
pub use pending::{InMemoryPendingIntentStore, PendingIntentStore};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;
