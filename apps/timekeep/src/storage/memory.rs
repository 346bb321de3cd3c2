use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    ActiveTimer, CompletedTimer, SessionRecord, SessionStore, StoreError, Timer, TimerId,
    TimerStore, TimerTable, User, UserId, UserStore,
};

/// In-process store. Every operation runs under one lock, which is what makes
/// `stop_timer` atomic against a concurrent stop of the same id.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_user_id: UserId,
    next_timer_id: TimerId,
    users: BTreeMap<UserId, User>,
    sessions: HashMap<String, SessionRecord>,
    active: BTreeMap<TimerId, ActiveTimer>,
    completed: BTreeMap<TimerId, CompletedTimer>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(
        &self,
        username: &str,
        password_digest: &str,
    ) -> Result<User, StoreError> {
        let mut state = self.inner.lock().await;
        if state.users.values().any(|u| u.username == username) {
            return Err(StoreError::UsernameTaken);
        }
        state.next_user_id += 1;
        let user = User {
            id: state.next_user_id,
            username: username.to_string(),
            password_digest: password_digest.to_string(),
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state.users.values().find(|u| u.username == username).cloned())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: SessionRecord) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        state.sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.inner.lock().await.sessions.get(token).cloned())
    }

    async fn delete_session(&self, token: &str) -> Result<(), StoreError> {
        self.inner.lock().await.sessions.remove(token);
        Ok(())
    }
}

#[async_trait]
impl TimerStore for MemoryStore {
    async fn start_timer(
        &self,
        user_id: UserId,
        description: &str,
        start: i64,
    ) -> Result<ActiveTimer, StoreError> {
        let mut state = self.inner.lock().await;
        state.next_timer_id += 1;
        let timer = ActiveTimer {
            id: state.next_timer_id,
            user_id,
            start,
            progress: 0,
            description: description.to_string(),
        };
        state.active.insert(timer.id, timer.clone());
        Ok(timer)
    }

    async fn get_timer(&self, table: TimerTable, id: TimerId) -> Result<Option<Timer>, StoreError> {
        let state = self.inner.lock().await;
        Ok(match table {
            TimerTable::Active => state.active.get(&id).cloned().map(Timer::Active),
            TimerTable::Completed => state.completed.get(&id).cloned().map(Timer::Completed),
        })
    }

    async fn list_active(&self, user_id: UserId) -> Result<Vec<ActiveTimer>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .active
            .values()
            .rev()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_completed(&self, user_id: UserId) -> Result<Vec<CompletedTimer>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .completed
            .values()
            .rev()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn touch_progress(&self, id: TimerId, progress: i64) -> Result<(), StoreError> {
        if let Some(timer) = self.inner.lock().await.active.get_mut(&id) {
            timer.progress = progress;
        }
        Ok(())
    }

    async fn stop_timer(
        &self,
        owner: UserId,
        id: TimerId,
        end: i64,
    ) -> Result<CompletedTimer, StoreError> {
        let mut state = self.inner.lock().await;
        match state.active.get(&id) {
            Some(timer) if timer.user_id == owner => {}
            _ => return Err(StoreError::NotFound),
        }
        let Some(active) = state.active.remove(&id) else {
            return Err(StoreError::NotFound);
        };
        let completed = CompletedTimer {
            id: active.id,
            user_id: active.user_id,
            start: active.start,
            end,
            duration: end - active.start,
            description: active.description,
        };
        state.completed.insert(completed.id, completed.clone());
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn lists_are_newest_first_and_scoped_to_user() {
        let store = MemoryStore::new();
        let a = store.start_timer(1, "first", 100).await.unwrap();
        let other = store.start_timer(2, "someone else", 150).await.unwrap();
        let b = store.start_timer(1, "second", 200).await.unwrap();

        let ids: Vec<_> = store
            .list_active(1)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![b.id, a.id]);
        assert_eq!(store.list_active(2).await.unwrap()[0].id, other.id);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stop_moves_timer_between_collections() {
        let store = MemoryStore::new();
        let timer = store.start_timer(1, "write spec", 1_000).await.unwrap();

        let completed = store.stop_timer(1, timer.id, 4_500).await.unwrap();
        assert_eq!(completed.id, timer.id);
        assert_eq!(completed.duration, 3_500);
        assert_eq!(completed.end - completed.start, completed.duration);
        assert_eq!(completed.description, "write spec");

        assert!(store
            .get_timer(TimerTable::Active, timer.id)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            store.get_timer(TimerTable::Completed, timer.id).await.unwrap(),
            Some(Timer::Completed(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_stop_is_not_found() {
        let store = MemoryStore::new();
        let timer = store.start_timer(1, "", 0).await.unwrap();
        store.stop_timer(1, timer.id, 10).await.unwrap();

        let err = store.stop_timer(1, timer.id, 20).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert_eq!(store.list_completed(1).await.unwrap().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_stops_insert_once() {
        let store = Arc::new(MemoryStore::new());
        let id = store.start_timer(1, "race", 0).await.unwrap().id;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.stop_timer(1, id, 100 + i).await })
            })
            .collect();
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.list_completed(1).await.unwrap().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stop_by_foreign_owner_leaves_timer_alone() {
        let store = MemoryStore::new();
        let timer = store.start_timer(1, "mine", 0).await.unwrap();

        let err = store.stop_timer(2, timer.id, 50).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert_eq!(store.list_active(1).await.unwrap().len(), 1);
        assert!(store.list_completed(2).await.unwrap().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn duplicate_username_is_rejected() {
        let store = MemoryStore::new();
        store.create_user("ada", "digest").await.unwrap();
        let err = store.create_user("ada", "other").await.unwrap_err();
        assert!(matches!(err, StoreError::UsernameTaken));
    }

    #[test_timeout::tokio_timeout_test]
    async fn touch_progress_overwrites_cached_value() {
        let store = MemoryStore::new();
        let timer = store.start_timer(1, "", 0).await.unwrap();
        store.touch_progress(timer.id, 1_234).await.unwrap();
        store.touch_progress(9_999, 1).await.unwrap();
        assert_eq!(store.list_active(1).await.unwrap()[0].progress, 1_234);
    }
}
