//! Timekeep: session-authenticated realtime timer tracking.
//!
//! Each authenticated user holds one live websocket. Commands on it start or
//! stop timers; every mutation is acknowledged and followed by a full snapshot,
//! and a heartbeat keeps running timers' progress fresh between commands.

pub mod auth;
pub mod clock;
pub mod config;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod state;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod websocket;

pub use routes::build_router;
pub use state::AppState;
