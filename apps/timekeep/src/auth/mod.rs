//! Session tokens and user accounts.
//!
//! [`SessionResolver`] is what the realtime path depends on: it turns an opaque
//! token into a [`User`] or reports that the caller is anonymous. [`Accounts`]
//! layers signup and login on top of it.

mod password;
mod token;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::storage::{SessionRecord, SessionStore, StoreError, Stores, User, UserId, UserStore};

pub use password::{hash_password, verify_password};
pub use token::{
    clear_session_cookie, generate_token, session_cookie, token_from_headers, SESSION_COOKIE,
};

#[derive(Clone)]
pub struct SessionResolver {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    ttl: Option<Duration>,
}

impl SessionResolver {
    pub fn new(stores: &Stores, clock: Arc<dyn Clock>, ttl: Option<Duration>) -> Self {
        Self {
            users: stores.users.clone(),
            sessions: stores.sessions.clone(),
            clock,
            ttl,
        }
    }

    /// Resolve a token to its user. Unknown, missing or expired tokens yield `Ok(None)`.
    pub async fn resolve_by_token(&self, token: Option<&str>) -> Result<Option<User>, StoreError> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let Some(session) = self.sessions.find_session(token).await? else {
            return Ok(None);
        };
        if self.is_expired(&session) {
            debug!(user_id = session.user_id, "session expired");
            self.sessions.delete_session(token).await?;
            return Ok(None);
        }
        self.users.find_user(session.user_id).await
    }

    pub async fn create_session(&self, user_id: UserId) -> Result<String, StoreError> {
        let token = generate_token();
        self.sessions
            .insert_session(SessionRecord {
                token: token.clone(),
                user_id,
                created_at: self.clock.now_millis(),
            })
            .await?;
        Ok(token)
    }

    pub async fn delete_session(&self, token: &str) -> Result<(), StoreError> {
        self.sessions.delete_session(token).await
    }

    fn is_expired(&self, session: &SessionRecord) -> bool {
        match self.ttl {
            Some(ttl) => {
                let age = self.clock.now_millis().saturating_sub(session.created_at);
                age > i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
            }
            None => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("username and password are required")]
    MissingCredentials,
    #[error("unknown username")]
    UnknownUsername,
    #[error("wrong password")]
    WrongPassword,
    #[error("username already registered")]
    UsernameTaken,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UsernameTaken => AuthError::UsernameTaken,
            other => AuthError::Store(other),
        }
    }
}

impl AuthError {
    /// Text shown to the user on the login form; `None` for server-side failures.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            AuthError::MissingCredentials => Some("Username and password are required"),
            AuthError::UnknownUsername => Some("Unknown username"),
            AuthError::WrongPassword => Some("Wrong password"),
            AuthError::UsernameTaken => Some("The user is already registered"),
            AuthError::Store(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct Accounts {
    users: Arc<dyn UserStore>,
    sessions: SessionResolver,
}

impl Accounts {
    pub fn new(stores: &Stores, sessions: SessionResolver) -> Self {
        Self {
            users: stores.users.clone(),
            sessions,
        }
    }

    /// Create a user and log them in. Returns the user and a fresh session token.
    pub async fn signup(&self, username: &str, password: &str) -> Result<(User, String), AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        if self.users.find_user_by_username(username).await?.is_some() {
            return Err(AuthError::UsernameTaken);
        }
        let user = self
            .users
            .create_user(username, &hash_password(password))
            .await?;
        let token = self.sessions.create_session(user.id).await?;
        Ok((user, token))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(User, String), AuthError> {
        let user = self
            .users
            .find_user_by_username(username.trim())
            .await?
            .ok_or(AuthError::UnknownUsername)?;
        if !verify_password(password, &user.password_digest) {
            return Err(AuthError::WrongPassword);
        }
        let token = self.sessions.create_session(user.id).await?;
        Ok((user, token))
    }

    pub fn sessions(&self) -> &SessionResolver {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn accounts(clock: Arc<ManualClock>, ttl: Option<Duration>) -> Accounts {
        let stores = Stores::memory();
        let resolver = SessionResolver::new(&stores, clock, ttl);
        Accounts::new(&stores, resolver)
    }

    #[test_timeout::tokio_timeout_test]
    async fn signup_then_resolve() {
        let accounts = accounts(Arc::new(ManualClock::new(0)), None);
        let (user, token) = accounts.signup("ada", "hunter2").await.unwrap();

        let resolved = accounts
            .sessions()
            .resolve_by_token(Some(&token))
            .await
            .unwrap();
        assert_eq!(resolved.map(|u| u.id), Some(user.id));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_or_missing_token_is_anonymous() {
        let accounts = accounts(Arc::new(ManualClock::new(0)), None);
        let resolver = accounts.sessions();
        assert!(resolver.resolve_by_token(None).await.unwrap().is_none());
        assert!(resolver.resolve_by_token(Some("")).await.unwrap().is_none());
        assert!(resolver
            .resolve_by_token(Some("not-a-session"))
            .await
            .unwrap()
            .is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn delete_session_is_idempotent() {
        let accounts = accounts(Arc::new(ManualClock::new(0)), None);
        let (_, token) = accounts.signup("ada", "pw").await.unwrap();
        let resolver = accounts.sessions();

        resolver.delete_session(&token).await.unwrap();
        resolver.delete_session(&token).await.unwrap();
        assert!(resolver.resolve_by_token(Some(&token)).await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn multiple_sessions_per_user() {
        let accounts = accounts(Arc::new(ManualClock::new(0)), None);
        let (user, first) = accounts.signup("ada", "pw").await.unwrap();
        let (_, second) = accounts.login("ada", "pw").await.unwrap();
        assert_ne!(first, second);

        accounts.sessions().delete_session(&first).await.unwrap();
        let still = accounts
            .sessions()
            .resolve_by_token(Some(&second))
            .await
            .unwrap();
        assert_eq!(still.map(|u| u.id), Some(user.id));
    }

    #[test_timeout::tokio_timeout_test]
    async fn login_failures_are_distinguished() {
        let accounts = accounts(Arc::new(ManualClock::new(0)), None);
        accounts.signup("ada", "pw").await.unwrap();

        assert!(matches!(
            accounts.login("bob", "pw").await,
            Err(AuthError::UnknownUsername)
        ));
        assert!(matches!(
            accounts.login("ada", "nope").await,
            Err(AuthError::WrongPassword)
        ));
        assert!(matches!(
            accounts.signup("ada", "again").await,
            Err(AuthError::UsernameTaken)
        ));
        assert!(matches!(
            accounts.signup("  ", "pw").await,
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn sessions_expire_when_ttl_configured() {
        let clock = Arc::new(ManualClock::new(1_000));
        let accounts = accounts(clock.clone(), Some(Duration::from_secs(60)));
        let (_, token) = accounts.signup("ada", "pw").await.unwrap();
        let resolver = accounts.sessions();

        clock.advance(59_000);
        assert!(resolver.resolve_by_token(Some(&token)).await.unwrap().is_some());

        clock.advance(2_000);
        assert!(resolver.resolve_by_token(Some(&token)).await.unwrap().is_none());

        clock.set(1_000);
        assert!(resolver.resolve_by_token(Some(&token)).await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn huge_ttl_never_expires() {
        let clock = Arc::new(ManualClock::new(1_000));
        let accounts = accounts(clock.clone(), Some(Duration::from_secs(u64::MAX)));
        let (_, token) = accounts.signup("ada", "pw").await.unwrap();

        clock.advance(365 * 24 * 3_600_000);
        let resolver = accounts.sessions();
        assert!(resolver.resolve_by_token(Some(&token)).await.unwrap().is_some());
    }
}
