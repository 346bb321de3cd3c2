use serde::{Deserialize, Serialize};

use crate::storage::{ActiveTimer, CompletedTimer, TimerId};

/// Messages sent from a browser client to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Start a new timer
    #[serde(rename = "createTimer")]
    CreateTimer {
        #[serde(default)]
        description: Option<String>,
    },
    /// Stop an active timer, turning it into a completed one
    #[serde(rename = "addOldTimer")]
    StopTimer { id: TimerId },
}

impl ClientMessage {
    /// Parse a text frame. Anything that is not one of the known shapes is an error.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateTimer { .. } => "create_timer",
            ClientMessage::StopTimer { .. } => "stop_timer",
        }
    }
}

/// Messages sent from the server to a browser client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot: on connect and after every create/stop
    AllTimers {
        #[serde(rename = "activeTimers")]
        active_timers: Vec<ActiveTimer>,
        #[serde(rename = "oldTimers")]
        old_timers: Vec<CompletedTimer>,
    },
    /// Heartbeat refresh of running timers only
    ActiveTimers {
        #[serde(rename = "activeTimers")]
        active_timers: Vec<ActiveTimer>,
    },
    /// Acknowledges a `createTimer` from this connection
    #[serde(rename = "add_new_timers")]
    TimerCreated {
        #[serde(rename = "timerId")]
        timer_id: TimerId,
        description: String,
    },
    /// Acknowledges an `addOldTimer` from this connection
    #[serde(rename = "add_old_timers")]
    TimerStopped {
        #[serde(rename = "timerId")]
        timer_id: TimerId,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AllTimers { .. } => "all_timers",
            ServerMessage::ActiveTimers { .. } => "active_timers",
            ServerMessage::TimerCreated { .. } => "add_new_timers",
            ServerMessage::TimerStopped { .. } => "add_old_timers",
        }
    }
}
