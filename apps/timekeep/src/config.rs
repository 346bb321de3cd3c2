use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;

use crate::sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(
    name = "timekeep",
    author,
    version,
    about = "Session-authenticated realtime timer tracking server"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "TIMEKEEP_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Postgres connection string. Without it everything is kept in memory.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "TIMEKEEP_DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub db_max_connections: u32,

    /// Interval between `active_timers` pushes on each live connection.
    #[arg(long, env = "TIMEKEEP_HEARTBEAT_MS", default_value_t = 1000)]
    pub heartbeat_ms: u64,

    /// Expire sessions this many seconds after login. Sessions never expire when unset.
    #[arg(long, env = "TIMEKEEP_SESSION_TTL_SECS")]
    pub session_ttl_secs: Option<u64>,

    /// Close a user's previous live connection when a newer one registers.
    #[arg(long, env = "TIMEKEEP_CLOSE_SUPERSEDED", default_value_t = false)]
    pub close_superseded: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TIMEKEEP_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub session_ttl: Option<Duration>,
    pub sync: SyncConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.heartbeat_ms > 0, "heartbeat interval must be positive");
        ensure!(
            cli.db_max_connections > 0,
            "database pool needs at least one connection"
        );
        if let Some(ttl) = cli.session_ttl_secs {
            ensure!(ttl > 0, "session ttl must be positive when set");
        }

        Ok(ServerConfig {
            listen_addr,
            database_url: cli.database_url.filter(|url| !url.trim().is_empty()),
            db_max_connections: cli.db_max_connections,
            session_ttl: cli.session_ttl_secs.map(Duration::from_secs),
            sync: SyncConfig {
                heartbeat_interval: Duration::from_millis(cli.heartbeat_ms),
                close_superseded: cli.close_superseded,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec!["timekeep"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test_timeout::timeout]
    fn explicit_flags_are_validated() {
        let config = parse(&[
            "--listen-addr",
            "127.0.0.1:4000",
            "--database-url",
            "postgres://localhost/timekeep",
            "--db-max-connections",
            "5",
            "--heartbeat-ms",
            "250",
            "--session-ttl-secs",
            "3600",
            "--close-superseded",
            "--shutdown-grace-secs",
            "2",
        ])
        .unwrap();
        assert_eq!(config.listen_addr.port(), 4000);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/timekeep")
        );
        assert_eq!(config.sync.heartbeat_interval, Duration::from_millis(250));
        assert!(config.sync.close_superseded);
        assert_eq!(config.session_ttl, Some(Duration::from_secs(3600)));
    }

    #[test_timeout::timeout]
    fn rejects_invalid_values() {
        assert!(parse(&["--listen-addr", "not an address"]).is_err());
        assert!(parse(&["--listen-addr", "127.0.0.1:0", "--heartbeat-ms", "0"]).is_err());
        assert!(parse(&["--listen-addr", "127.0.0.1:0", "--session-ttl-secs", "0"]).is_err());
    }
}
