//! Realtime synchronization of a user's timers with their live connection.
//!
//! The engine holds no per-user state of its own: every snapshot is read back
//! from the [`TimerStore`] after the mutation that triggered it. Per-connection
//! state lives in [`ConnectionScope`], which also owns the connection's
//! registry entry and heartbeat and releases both when dropped.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::heartbeat::Heartbeat;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{ClientChannel, ConnectionRegistry};
use crate::storage::{
    ActiveTimer, StoreError, Timer, TimerId, TimerStore, TimerTable, UserId,
};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub heartbeat_interval: Duration,
    /// Close the previous connection of a user when a new one registers.
    pub close_superseded: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            close_superseded: false,
        }
    }
}

/// Result of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Created(TimerId),
    Stopped(TimerId),
    /// Stop for a timer that is not (or no longer) an active timer of this user.
    Ignored,
    /// Frame did not parse; nothing was done.
    Malformed,
}

#[derive(Clone)]
pub struct SyncEngine {
    timers: Arc<dyn TimerStore>,
    registry: ConnectionRegistry,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        timers: Arc<dyn TimerStore>,
        registry: ConnectionRegistry,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            timers,
            registry,
            clock,
            config,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Register `channel` as the user's live connection and push the initial snapshot.
    ///
    /// If the snapshot cannot be read the registration is rolled back and the error
    /// returned; the caller should end the connection.
    pub async fn connect(
        &self,
        user_id: UserId,
        channel: ClientChannel,
    ) -> Result<ConnectionScope, StoreError> {
        if let Some(previous) = self.registry.register(user_id, channel.clone()) {
            debug!(
                user_id,
                previous = %previous.connection_id(),
                current = %channel.connection_id(),
                "superseding live connection"
            );
            if self.config.close_superseded {
                previous.close("superseded by a newer connection");
            }
        }

        let mut scope = ConnectionScope {
            engine: self.clone(),
            user_id,
            channel,
            turn: Arc::new(Mutex::new(())),
            heartbeat: None,
        };
        self.push_snapshot(user_id, &scope.channel).await?;

        scope.heartbeat = Some(Heartbeat::spawn(
            self.clone(),
            user_id,
            scope.channel.clone(),
            scope.turn.clone(),
            self.config.heartbeat_interval,
        ));
        info!(
            user_id,
            connection_id = %scope.channel.connection_id(),
            "timer sync connected"
        );
        Ok(scope)
    }

    /// Active timers with progress recomputed against now.
    ///
    /// The refreshed progress is written back in the background; a failed write
    /// is logged and never affects the returned values.
    pub async fn active_timers(&self, user_id: UserId) -> Result<Vec<ActiveTimer>, StoreError> {
        let now = self.clock.now_millis();
        let mut timers = self.timers.list_active(user_id).await?;
        for timer in timers.iter_mut() {
            timer.refresh(now);
        }

        let updates: Vec<(TimerId, i64)> = timers.iter().map(|t| (t.id, t.progress)).collect();
        if !updates.is_empty() {
            let store = self.timers.clone();
            tokio::spawn(async move {
                for (id, progress) in updates {
                    if let Err(err) = store.touch_progress(id, progress).await {
                        warn!(timer_id = id, error = %err, "failed to persist timer progress");
                        break;
                    }
                }
            });
        }
        Ok(timers)
    }

    /// Full snapshot of the user's timers.
    pub async fn snapshot(&self, user_id: UserId) -> Result<ServerMessage, StoreError> {
        let active_timers = self.active_timers(user_id).await?;
        let old_timers = self.timers.list_completed(user_id).await?;
        Ok(ServerMessage::AllTimers {
            active_timers,
            old_timers,
        })
    }

    /// Heartbeat payload: running timers only.
    pub async fn active_update(&self, user_id: UserId) -> Result<ServerMessage, StoreError> {
        Ok(ServerMessage::ActiveTimers {
            active_timers: self.active_timers(user_id).await?,
        })
    }

    pub async fn push_snapshot(
        &self,
        user_id: UserId,
        channel: &ClientChannel,
    ) -> Result<(), StoreError> {
        let snapshot = self.snapshot(user_id).await?;
        channel.send(snapshot);
        Ok(())
    }

    /// Apply one command for `user_id` and push its acknowledgment followed by a snapshot.
    ///
    /// A failed mutation pushes nothing. Once the mutation succeeds the acknowledgment
    /// is always sent, even if reading the snapshot afterwards fails.
    pub async fn handle_command(
        &self,
        user_id: UserId,
        channel: &ClientChannel,
        command: ClientMessage,
    ) -> Result<CommandOutcome, StoreError> {
        counter!("timekeep_commands_total", 1, "kind" => command.kind());
        match command {
            ClientMessage::CreateTimer { description } => {
                let description = description.unwrap_or_default();
                self.create_timer(user_id, channel, description).await
            }
            ClientMessage::StopTimer { id } => self.stop_timer(user_id, channel, id).await,
        }
    }

    async fn create_timer(
        &self,
        user_id: UserId,
        channel: &ClientChannel,
        description: String,
    ) -> Result<CommandOutcome, StoreError> {
        let timer = self
            .timers
            .start_timer(user_id, &description, self.clock.now_millis())
            .await?;
        debug!(user_id, timer_id = timer.id, "timer started");

        channel.send(ServerMessage::TimerCreated {
            timer_id: timer.id,
            description: timer.description,
        });
        self.push_snapshot(user_id, channel).await?;
        Ok(CommandOutcome::Created(timer.id))
    }

    async fn stop_timer(
        &self,
        user_id: UserId,
        channel: &ClientChannel,
        id: TimerId,
    ) -> Result<CommandOutcome, StoreError> {
        match self.timers.get_timer(TimerTable::Active, id).await? {
            Some(Timer::Active(timer)) if timer.user_id == user_id => {}
            Some(other) => {
                warn!(
                    user_id,
                    timer_id = id,
                    owner = other.user_id(),
                    "ignoring stop for a timer owned by another user"
                );
                return Ok(CommandOutcome::Ignored);
            }
            None => {
                debug!(user_id, timer_id = id, "ignoring stop for inactive timer");
                return Ok(CommandOutcome::Ignored);
            }
        }

        let completed = match self
            .timers
            .stop_timer(user_id, id, self.clock.now_millis())
            .await
        {
            Ok(completed) => completed,
            Err(StoreError::NotFound) => {
                debug!(user_id, timer_id = id, "timer stopped concurrently");
                return Ok(CommandOutcome::Ignored);
            }
            Err(err) => return Err(err),
        };
        debug!(
            user_id,
            timer_id = completed.id,
            duration_ms = completed.duration,
            "timer stopped"
        );

        channel.send(ServerMessage::TimerStopped {
            timer_id: completed.id,
        });
        self.push_snapshot(user_id, channel).await?;
        Ok(CommandOutcome::Stopped(completed.id))
    }
}

/// One authenticated live connection.
///
/// Dropping the scope cancels the heartbeat and removes the registry entry if it
/// still belongs to this connection.
pub struct ConnectionScope {
    engine: SyncEngine,
    user_id: UserId,
    channel: ClientChannel,
    turn: Arc<Mutex<()>>,
    heartbeat: Option<Heartbeat>,
}

impl ConnectionScope {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn channel(&self) -> &ClientChannel {
        &self.channel
    }

    /// Handle one inbound text frame. Malformed frames are dropped without reply.
    ///
    /// Holds the connection's send turn for the whole command so a heartbeat push
    /// cannot land between the acknowledgment and its snapshot.
    pub async fn dispatch(&self, text: &str) -> Result<CommandOutcome, StoreError> {
        let command = match ClientMessage::decode(text) {
            Ok(command) => command,
            Err(err) => {
                counter!("timekeep_malformed_messages_total", 1);
                debug!(user_id = self.user_id, error = %err, "dropping malformed message");
                return Ok(CommandOutcome::Malformed);
            }
        };
        let _turn = self.turn.lock().await;
        self.engine
            .handle_command(self.user_id, &self.channel, command)
            .await
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        let removed = self.engine.registry.unregister(self.user_id, &self.channel);
        debug!(
            user_id = self.user_id,
            connection_id = %self.channel.connection_id(),
            removed,
            "timer sync disconnected"
        );
    }
}
