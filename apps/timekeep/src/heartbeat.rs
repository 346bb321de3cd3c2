use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::ClientChannel;
use crate::storage::UserId;
use crate::sync::SyncEngine;

/// Periodic `active_timers` push for one connection.
///
/// The task lives exactly as long as this value. Dropping it cancels the token
/// and aborts the task.
pub struct Heartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(
        engine: SyncEngine,
        user_id: UserId,
        channel: ClientChannel,
        turn: Arc<Mutex<()>>,
        period: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if channel.is_closed() {
                    break;
                }

                let _turn = turn.lock().await;
                let message = match engine.active_update(user_id).await {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(user_id, error = %err, "heartbeat refresh failed");
                        continue;
                    }
                };
                if token.is_cancelled() {
                    break;
                }
                channel.send(message);
            }
            debug!(
                user_id,
                connection_id = %channel.connection_id(),
                "heartbeat stopped"
            );
        });
        Self { cancel, task }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel();
    }
}
