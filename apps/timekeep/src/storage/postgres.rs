use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use super::{
    ActiveTimer, CompletedTimer, SessionRecord, SessionStore, StoreError, Timer, TimerId,
    TimerStore, TimerTable, User, UserId, UserStore,
};

/// Postgres-backed store. Schema lives in `migrations/` and is applied on connect.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations applied");
        Ok(Self { pool })
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn create_user(
        &self,
        username: &str,
        password_digest: &str,
    ) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, password_digest)
            VALUES ($1, $2)
            ON CONFLICT (username) DO NOTHING
            RETURNING id, username, password_digest
            "#,
        )
        .bind(username)
        .bind(password_digest)
        .fetch_optional(&self.pool)
        .await?;
        user.ok_or(StoreError::UsernameTaken)
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"SELECT id, username, password_digest FROM users WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"SELECT id, username, password_digest FROM users WHERE username = $1 LIMIT 1"#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn insert_session(&self, session: SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO sessions (token, user_id, created_at) VALUES ($1, $2, $3)"#,
        )
        .bind(&session.token)
        .bind(session.user_id)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<SessionRecord>, StoreError> {
        let session = sqlx::query_as::<_, SessionRecord>(
            r#"SELECT token, user_id, created_at FROM sessions WHERE token = $1"#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn delete_session(&self, token: &str) -> Result<(), StoreError> {
        sqlx::query(r#"DELETE FROM sessions WHERE token = $1"#)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TimerStore for PostgresStore {
    async fn start_timer(
        &self,
        user_id: UserId,
        description: &str,
        start: i64,
    ) -> Result<ActiveTimer, StoreError> {
        let timer = sqlx::query_as::<_, ActiveTimer>(
            r#"
            INSERT INTO active_timers (user_id, start, progress, description)
            VALUES ($1, $2, 0, $3)
            RETURNING id, user_id, start, progress, description
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        Ok(timer)
    }

    async fn get_timer(&self, table: TimerTable, id: TimerId) -> Result<Option<Timer>, StoreError> {
        let timer = match table {
            TimerTable::Active => sqlx::query_as::<_, ActiveTimer>(
                r#"
                SELECT id, user_id, start, progress, description
                FROM active_timers WHERE id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Timer::Active),
            TimerTable::Completed => sqlx::query_as::<_, CompletedTimer>(
                r#"
                SELECT id, user_id, start, "end", duration, description
                FROM old_timers WHERE id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Timer::Completed),
        };
        Ok(timer)
    }

    async fn list_active(&self, user_id: UserId) -> Result<Vec<ActiveTimer>, StoreError> {
        let timers = sqlx::query_as::<_, ActiveTimer>(
            r#"
            SELECT id, user_id, start, progress, description
            FROM active_timers
            WHERE user_id = $1
            ORDER BY id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(timers)
    }

    async fn list_completed(&self, user_id: UserId) -> Result<Vec<CompletedTimer>, StoreError> {
        let timers = sqlx::query_as::<_, CompletedTimer>(
            r#"
            SELECT id, user_id, start, "end", duration, description
            FROM old_timers
            WHERE user_id = $1
            ORDER BY id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(timers)
    }

    async fn touch_progress(&self, id: TimerId, progress: i64) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE active_timers SET progress = $2 WHERE id = $1"#)
            .bind(id)
            .bind(progress)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stop_timer(
        &self,
        owner: UserId,
        id: TimerId,
        end: i64,
    ) -> Result<CompletedTimer, StoreError> {
        // Single statement: a racing stop blocks on the row lock and then deletes nothing.
        let completed = sqlx::query_as::<_, CompletedTimer>(
            r#"
            WITH consumed AS (
                DELETE FROM active_timers
                WHERE id = $1 AND user_id = $2
                RETURNING id, user_id, start, description
            )
            INSERT INTO old_timers (id, user_id, start, "end", duration, description)
            SELECT id, user_id, start, $3::BIGINT, $3::BIGINT - start, description FROM consumed
            RETURNING id, user_id, start, "end", duration, description
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(end)
        .fetch_optional(&self.pool)
        .await?;
        completed.ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect() -> Option<PostgresStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(PostgresStore::connect(&url, 2).await.expect("connect"))
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_stop_round_trip() {
        let Some(store) = connect().await else {
            return;
        };
        let username = format!("pg-{}", uuid::Uuid::new_v4());
        let user = store.create_user(&username, "digest").await.unwrap();
        let timer = store.start_timer(user.id, "pg timer", 1_000).await.unwrap();

        let completed = store.stop_timer(user.id, timer.id, 3_000).await.unwrap();
        assert_eq!(completed.id, timer.id);
        assert_eq!(completed.duration, 2_000);

        let err = store.stop_timer(user.id, timer.id, 4_000).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert!(store.list_active(user.id).await.unwrap().is_empty());
        assert_eq!(store.list_completed(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_duplicate_username() {
        let Some(store) = connect().await else {
            return;
        };
        let username = format!("pg-{}", uuid::Uuid::new_v4());
        store.create_user(&username, "a").await.unwrap();
        let err = store.create_user(&username, "b").await.unwrap_err();
        assert!(matches!(err, StoreError::UsernameTaken));
    }
}
