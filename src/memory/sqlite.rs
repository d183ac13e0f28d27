//! 异步 SQLite 持久化：对话记忆与待办意图
//!
//! 需要启用 `async-sqlite` feature。表结构：
//! - chat_messages(id, conversation_id, role, content, created_at)
//! - pending_intents(id, conversation_id, skill_name, sub_task)
//! - ask_streaks(conversation_id, skill_name, streak)

#[cfg(feature = "async-sqlite")]
mod sqlx_impl {
    use std::path::Path;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use crate::core::AgentError;
    use crate::memory::{ChatMemory, Message, PendingIntentStore, Role};
    use crate::router::Intent;

    fn store_err(e: sqlx::Error) -> AgentError {
        AgentError::Store(e.to_string())
    }

    /// SQLite 存储：同一个连接池同时实现 ChatMemory 与 PendingIntentStore
    pub struct SqliteStore {
        pool: SqlitePool,
        max_messages: usize,
    }

    impl SqliteStore {
        pub async fn new(
            db_path: impl AsRef<Path>,
            max_messages: usize,
        ) -> Result<Self, sqlx::Error> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await?;

            let store = Self {
                pool,
                max_messages: max_messages.max(1),
            };
            store.init_tables().await?;
            Ok(store)
        }

        async fn init_tables(&self) -> Result<(), sqlx::Error> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS chat_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS pending_intents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation_id TEXT NOT NULL,
                    skill_name TEXT NOT NULL,
                    sub_task TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS ask_streaks (
                    conversation_id TEXT NOT NULL,
                    skill_name TEXT NOT NULL,
                    streak INTEGER NOT NULL,
                    PRIMARY KEY (conversation_id, skill_name)
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_chat_conversation ON chat_messages(conversation_id)",
            )
            .execute(&self.pool)
            .await?;

            Ok(())
        }
    }

    #[async_trait]
    impl ChatMemory for SqliteStore {
        async fn append(&self, conversation_id: &str, message: Message) -> Result<(), AgentError> {
            let now = chrono::Utc::now().to_rfc3339();
            sqlx::query(
                "INSERT INTO chat_messages (conversation_id, role, content, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(conversation_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

            // 滑动窗口：只保留最近 max_messages 条
            sqlx::query(
                "DELETE FROM chat_messages WHERE conversation_id = ? AND id NOT IN (
                    SELECT id FROM chat_messages WHERE conversation_id = ? ORDER BY id DESC LIMIT ?
                )",
            )
            .bind(conversation_id)
            .bind(conversation_id)
            .bind(self.max_messages as i64)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
            Ok(())
        }

        async fn read(&self, conversation_id: &str) -> Result<Vec<Message>, AgentError> {
            let rows = sqlx::query(
                "SELECT role, content FROM chat_messages WHERE conversation_id = ? ORDER BY id",
            )
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

            Ok(rows
                .iter()
                .map(|row| Message {
                    role: Role::parse(row.get::<String, _>("role").as_str()),
                    content: row.get("content"),
                })
                .collect())
        }
    }

    #[async_trait]
    impl PendingIntentStore for SqliteStore {
        async fn get(&self, conversation_id: &str) -> Result<Vec<Intent>, AgentError> {
            let rows = sqlx::query(
                "SELECT skill_name, sub_task FROM pending_intents WHERE conversation_id = ? ORDER BY id",
            )
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

            Ok(rows
                .iter()
                .map(|row| {
                    Intent::new(
                        row.get::<String, _>("skill_name"),
                        row.get::<String, _>("sub_task"),
                    )
                })
                .collect())
        }

        async fn replace(
            &self,
            conversation_id: &str,
            intents: Vec<Intent>,
        ) -> Result<(), AgentError> {
            let mut tx = self.pool.begin().await.map_err(store_err)?;
            sqlx::query("DELETE FROM pending_intents WHERE conversation_id = ?")
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            for intent in &intents {
                sqlx::query(
                    "INSERT INTO pending_intents (conversation_id, skill_name, sub_task) VALUES (?, ?, ?)",
                )
                .bind(conversation_id)
                .bind(&intent.skill_name)
                .bind(&intent.sub_task)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            }
            tx.commit().await.map_err(store_err)?;
            tracing::info!(conversation_id, count = intents.len(), "[MultiIntent] 保存待办意图");
            Ok(())
        }

        async fn clear(&self, conversation_id: &str) -> Result<(), AgentError> {
            sqlx::query("DELETE FROM pending_intents WHERE conversation_id = ?")
                .bind(conversation_id)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
            Ok(())
        }

        async fn ask_streak(
            &self,
            conversation_id: &str,
            skill: &str,
        ) -> Result<usize, AgentError> {
            let row = sqlx::query(
                "SELECT streak FROM ask_streaks WHERE conversation_id = ? AND skill_name = ?",
            )
            .bind(conversation_id)
            .bind(skill)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
            Ok(row
                .map(|r| r.get::<i64, _>("streak").max(0) as usize)
                .unwrap_or(0))
        }

        async fn set_ask_streak(
            &self,
            conversation_id: &str,
            skill: &str,
            count: usize,
        ) -> Result<(), AgentError> {
            if count == 0 {
                sqlx::query("DELETE FROM ask_streaks WHERE conversation_id = ? AND skill_name = ?")
                    .bind(conversation_id)
                    .bind(skill)
                    .execute(&self.pool)
                    .await
                    .map_err(store_err)?;
                return Ok(());
            }
            sqlx::query(
                "INSERT INTO ask_streaks (conversation_id, skill_name, streak) VALUES (?, ?, ?)
                 ON CONFLICT(conversation_id, skill_name) DO UPDATE SET streak = excluded.streak",
            )
            .bind(conversation_id)
            .bind(skill)
            .bind(count as i64)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
            Ok(())
        }

        async fn clear_ask_streaks(&self, conversation_id: &str) -> Result<(), AgentError> {
            sqlx::query("DELETE FROM ask_streaks WHERE conversation_id = ?")
                .bind(conversation_id)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
            Ok(())
        }
    }

}

#[cfg(feature = "async-sqlite")]
pub use sqlx_impl::SqliteStore;
