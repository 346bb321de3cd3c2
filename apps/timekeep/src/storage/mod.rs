//! Persistence boundary for users, sessions and timers.
//!
//! The sync engine and the session resolver only see the traits below. Two
//! adapters exist: [`MemoryStore`] for development and tests, and
//! [`PostgresStore`] for deployments with `DATABASE_URL` set.

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

pub type UserId = i64;
pub type TimerId = i64;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SessionRecord {
    pub token: String,
    pub user_id: UserId,
    pub created_at: i64,
}

/// A running timer. `start` is authoritative; `progress` is a cached `now - start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActiveTimer {
    pub id: TimerId,
    pub user_id: UserId,
    pub start: i64,
    pub progress: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CompletedTimer {
    pub id: TimerId,
    pub user_id: UserId,
    pub start: i64,
    pub end: i64,
    pub duration: i64,
    pub description: String,
}

impl ActiveTimer {
    /// Refreshes the cached progress against `now`. Clock skew never yields a negative value.
    pub fn refresh(&mut self, now: i64) {
        self.progress = now.saturating_sub(self.start).max(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTable {
    Active,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    Active(ActiveTimer),
    Completed(CompletedTimer),
}

impl Timer {
    pub fn user_id(&self) -> UserId {
        match self {
            Timer::Active(timer) => timer.user_id,
            Timer::Completed(timer) => timer.user_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("username already registered")]
    UsernameTaken,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Inserts a user; fails with [`StoreError::UsernameTaken`] on a duplicate username.
    async fn create_user(&self, username: &str, password_digest: &str)
        -> Result<User, StoreError>;
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: SessionRecord) -> Result<(), StoreError>;
    async fn find_session(&self, token: &str) -> Result<Option<SessionRecord>, StoreError>;
    /// Removing an unknown token is not an error.
    async fn delete_session(&self, token: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TimerStore: Send + Sync {
    async fn start_timer(
        &self,
        user_id: UserId,
        description: &str,
        start: i64,
    ) -> Result<ActiveTimer, StoreError>;

    async fn get_timer(&self, table: TimerTable, id: TimerId) -> Result<Option<Timer>, StoreError>;

    /// Newest id first.
    async fn list_active(&self, user_id: UserId) -> Result<Vec<ActiveTimer>, StoreError>;

    /// Newest id first.
    async fn list_completed(&self, user_id: UserId) -> Result<Vec<CompletedTimer>, StoreError>;

    async fn touch_progress(&self, id: TimerId, progress: i64) -> Result<(), StoreError>;

    /// Consumes the active timer `id` owned by `owner` and records it as completed at `end`.
    ///
    /// The delete and the insert happen as one unit: of two concurrent calls for the
    /// same id exactly one succeeds, the other gets [`StoreError::NotFound`].
    async fn stop_timer(
        &self,
        owner: UserId,
        id: TimerId,
        end: i64,
    ) -> Result<CompletedTimer, StoreError>;
}

/// The three store handles the service is wired with.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub timers: Arc<dyn TimerStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }

    pub async fn postgres(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let store = PostgresStore::connect(url, max_connections).await?;
        Ok(Self::from_backend(Arc::new(store)))
    }

    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UserStore + SessionStore + TimerStore + 'static,
    {
        Self {
            users: backend.clone(),
            sessions: backend.clone(),
            timers: backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn refresh_computes_elapsed_and_clamps_skew() {
        let mut timer = ActiveTimer {
            id: 1,
            user_id: 1,
            start: 10_000,
            progress: 0,
            description: String::new(),
        };
        timer.refresh(12_500);
        assert_eq!(timer.progress, 2_500);
        timer.refresh(9_000);
        assert_eq!(timer.progress, 0);
    }

    #[test_timeout::timeout]
    fn timer_wire_shape_uses_snake_case_fields() {
        let timer = CompletedTimer {
            id: 7,
            user_id: 3,
            start: 100,
            end: 400,
            duration: 300,
            description: "write spec".into(),
        };
        let value = serde_json::to_value(&timer).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": 7,
                "user_id": 3,
                "start": 100,
                "end": 400,
                "duration": 300,
                "description": "write spec",
            })
        );
    }
}
