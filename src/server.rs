//! Server configuration and the WebSocket accept loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::presence::DEFAULT_PALETTE;
use crate::reaper;
use crate::registry::RoomRegistry;
use crate::session;

/// Server configuration. Defaults mirror the deployment constants; every
/// knob can be overridden from the environment via [`ServerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How long a granted lease lives without a refresh
    pub lease_ttl: Duration,
    /// How long a silent participant survives before the reaper evicts it
    pub user_ttl: Duration,
    /// Reaper sweep period
    pub reaper_interval: Duration,
    /// Outbound frames buffered per session before it counts as a laggard
    pub session_outbound_queue: usize,
    /// Upper bound on a stored workspace snapshot
    pub snapshot_max_bytes: usize,
    /// Participant colors, cycled in join order
    pub color_palette: Vec<String>,
    /// `max_users` for rooms created without explicit metadata
    pub max_users_default: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            lease_ttl: Duration::from_millis(10_000),
            user_ttl: Duration::from_millis(30_000),
            reaper_interval: Duration::from_millis(3_000),
            session_outbound_queue: 256,
            snapshot_max_bytes: 1024 * 1024,
            color_palette: DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect(),
            max_users_default: 10,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the environment, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            lease_ttl: env_ms("LEASE_TTL_MS", defaults.lease_ttl),
            user_ttl: env_ms("USER_TTL_MS", defaults.user_ttl),
            reaper_interval: env_ms("REAPER_INTERVAL_MS", defaults.reaper_interval),
            session_outbound_queue: env_usize(
                "SESSION_OUTBOUND_QUEUE",
                defaults.session_outbound_queue,
            ),
            snapshot_max_bytes: env_usize("SNAPSHOT_MAX_BYTES", defaults.snapshot_max_bytes),
            color_palette: std::env::var("COLOR_PALETTE")
                .ok()
                .map(|raw| parse_palette(&raw))
                .filter(|palette| !palette.is_empty())
                .unwrap_or(defaults.color_palette),
            max_users_default: env_usize("MAX_USERS_DEFAULT", defaults.max_users_default),
        }
    }
}

fn env_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Parse a comma-separated palette, skipping empty entries.
fn parse_palette(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Server-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub active_rooms: usize,
}

/// The collaboration server: room registry, reaper, accept loop.
pub struct CollabServer {
    config: Arc<ServerConfig>,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let config = Arc::new(config);
        Self {
            registry: Arc::new(RoomRegistry::new(config.clone())),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Current statistics snapshot.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Bind and serve. Runs the accept loop; call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("workspace server listening on {}", self.config.bind_addr);

        let _reaper = reaper::spawn(self.registry.clone(), self.config.clone());

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            {
                let mut stats = self.stats.write().await;
                stats.total_connections += 1;
                stats.active_connections += 1;
            }

            let registry = self.registry.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = session::run(stream, addr, registry, config).await {
                    log::error!("session error from {addr}: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_match_deployment_constants() {
        let config = ServerConfig::default();
        assert_eq!(config.lease_ttl, Duration::from_secs(10));
        assert_eq!(config.user_ttl, Duration::from_secs(30));
        assert_eq!(config.reaper_interval, Duration::from_secs(3));
        assert_eq!(config.session_outbound_queue, 256);
        assert_eq!(config.snapshot_max_bytes, 1024 * 1024);
        assert_eq!(config.color_palette.len(), 4);
        assert_eq!(config.max_users_default, 10);
    }

    #[test]
    fn test_parse_palette() {
        assert_eq!(
            parse_palette("#111111, #222222 ,#333333"),
            vec!["#111111", "#222222", "#333333"]
        );
        assert!(parse_palette(" , ,").is_empty());
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.config().max_users_default, 10);

        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_stats_reflect_registry() {
        let server = CollabServer::with_defaults();
        server.registry().get_or_create("R1").await.unwrap();
        server.registry().get_or_create("R2").await.unwrap();
        assert_eq!(server.stats().await.active_rooms, 2);
    }
}
