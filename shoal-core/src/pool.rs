//! Bounded, reusable pool of outbound peer connections
//!
//! Each cached connection carries its own async lock, so one caller at a
//! time may run a request/response exchange on it while the pool-wide map
//! lock stays free for other peers. Eviction is least-recently-used when
//! the pool is full, plus a background reaper for idle entries.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as MapMutex;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::task::{BackgroundTask, shutdown_channel};

/// Errors that can occur while acquiring a pooled connection.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to connect to {peer}: {source}")]
    Connect {
        peer: IpAddr,
        source: std::io::Error,
    },

    #[error("Connection to {peer} timed out")]
    ConnectTimeout { peer: IpAddr },
}

/// Shared handle to one pooled connection.
///
/// Locking yields exclusive use of the socket for a single exchange; the
/// pool may hand the same connection to another caller as soon as the guard
/// is released.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    stream: Arc<Mutex<TcpStream>>,
}

impl PooledConnection {
    /// Takes the per-connection lock for one request/response exchange.
    pub async fn lock(&self) -> MutexGuard<'_, TcpStream> {
        self.stream.lock().await
    }
}

#[derive(Debug)]
struct Entry {
    stream: Arc<Mutex<TcpStream>>,
    last_used: Instant,
}

/// Thread-safe cache of live outbound connections, keyed by peer address.
///
/// Cheap to clone; clones share the pool. Never holds more than
/// `max_connections` entries.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    entries: Arc<MapMutex<HashMap<IpAddr, Entry>>>,
    config: NetworkConfig,
}

impl ConnectionPool {
    pub fn new(config: NetworkConfig) -> Self {
        info!(
            "Connection pool initialized with max_connections={}, timeout={:?}",
            config.max_connections, config.connection_timeout
        );
        Self {
            entries: Arc::new(MapMutex::new(HashMap::new())),
            config,
        }
    }

    /// Returns a live connection to the peer, reusing a cached one if able.
    ///
    /// A cached entry is probed for liveness; a stale entry is purged and
    /// replaced. When the pool is full the least-recently-used entry is
    /// evicted before the new connection is admitted.
    ///
    /// # Errors
    /// - `PoolError::Connect` - TCP connect failed
    /// - `PoolError::ConnectTimeout` - Connect exceeded the bound
    pub async fn acquire(&self, peer: IpAddr) -> Result<PooledConnection, PoolError> {
        if let Some(connection) = self.checkout_cached(peer) {
            debug!("Reusing connection to {peer}");
            return Ok(connection);
        }

        // Connect outside the map lock so a slow peer does not stall
        // acquires for other peers.
        let port = self.config.peer_port;
        debug!("Creating new connection to {peer}:{port}");
        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((peer, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(PoolError::Connect { peer, source }),
            Err(_) => return Err(PoolError::ConnectTimeout { peer }),
        };

        let stream = Arc::new(Mutex::new(stream));
        let mut entries = self.entries.lock();
        if entries.len() >= self.config.max_connections && !entries.contains_key(&peer) {
            Self::evict_lru(&mut entries);
        }
        entries.insert(
            peer,
            Entry {
                stream: Arc::clone(&stream),
                last_used: Instant::now(),
            },
        );

        Ok(PooledConnection { stream })
    }

    /// Force-closes and evicts a peer's connection after a transport error.
    pub fn remove(&self, peer: IpAddr) {
        if self.entries.lock().remove(&peer).is_some() {
            debug!("Evicted connection to {peer}");
        }
    }

    /// Closes every cached connection. Called at shutdown.
    pub fn close_all(&self) {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        info!("Closed all {count} pooled connections");
    }

    /// Returns the number of currently cached connections.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Spawns the idle-connection reaper.
    ///
    /// Wakes every `interval` and evicts entries unused for longer than the
    /// configured connection timeout.
    pub fn spawn_reaper(&self, interval: Duration) -> BackgroundTask {
        let pool = self.clone();
        let (shutdown_tx, mut shutdown_rx) = shutdown_channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => pool.reap_idle(),
                }
            }
        });

        BackgroundTask::new(shutdown_tx, handle)
    }

    /// Looks up a cached entry and probes it for liveness.
    fn checkout_cached(&self, peer: IpAddr) -> Option<PooledConnection> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&peer)?;

        // A connection mid-exchange holds its own lock; it is necessarily
        // live, so only probe when the socket is free. Peer-side closes are
        // otherwise caught on next use and evicted by the caller.
        if let Ok(stream) = entry.stream.try_lock() {
            if stream.peer_addr().is_err() {
                drop(stream);
                debug!("Dead connection to {peer}, removing");
                entries.remove(&peer);
                return None;
            }
        }

        entry.last_used = Instant::now();
        Some(PooledConnection {
            stream: Arc::clone(&entry.stream),
        })
    }

    fn evict_lru(entries: &mut HashMap<IpAddr, Entry>) {
        if let Some(oldest) = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(peer, _)| *peer)
        {
            debug!("Pool full, evicting least-recently-used connection to {oldest}");
            entries.remove(&oldest);
        }
    }

    fn reap_idle(&self) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let timeout = self.config.connection_timeout;

        let idle: Vec<IpAddr> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) > timeout)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in idle {
            info!("Removing stale connection to {peer}");
            entries.remove(&peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::net::TcpListener;

    use super::*;

    /// Accepts connections on `ip:port` and keeps them open.
    async fn spawn_peer(ip: Ipv4Addr, port: u16) -> tokio::task::JoinHandle<()> {
        let listener = TcpListener::bind((ip, port)).await.unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        })
    }

    /// Picks a port free on loopback for the test peers to share.
    async fn free_port() -> u16 {
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        probe.local_addr().unwrap().port()
    }

    fn pool_config(port: u16, max_connections: usize) -> NetworkConfig {
        NetworkConfig {
            peer_port: port,
            max_connections,
            connect_timeout: Duration::from_secs(2),
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_reuses_cached_connection() {
        let port = free_port().await;
        let _peer = spawn_peer(Ipv4Addr::LOCALHOST, port).await;
        let pool = ConnectionPool::new(pool_config(port, 10));
        let peer = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let first = pool.acquire(peer).await.unwrap();
        let second = pool.acquire(peer).await.unwrap();

        assert!(Arc::ptr_eq(&first.stream, &second.stream));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_bound_evicts_least_recently_used() {
        let port = free_port().await;
        let ips = [
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(127, 0, 0, 2),
            Ipv4Addr::new(127, 0, 0, 3),
        ];
        for ip in ips {
            spawn_peer(ip, port).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pool = ConnectionPool::new(pool_config(port, 2));
        pool.acquire(IpAddr::V4(ips[0])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.acquire(IpAddr::V4(ips[1])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.acquire(IpAddr::V4(ips[2])).await.unwrap();

        assert_eq!(pool.len(), 2);
        // The first-acquired (least recently used) peer was evicted.
        let entries = pool.entries.lock();
        assert!(!entries.contains_key(&IpAddr::V4(ips[0])));
        assert!(entries.contains_key(&IpAddr::V4(ips[1])));
        assert!(entries.contains_key(&IpAddr::V4(ips[2])));
    }

    #[tokio::test]
    async fn test_remove_forces_a_fresh_connection() {
        let port = free_port().await;
        let _peer = spawn_peer(Ipv4Addr::LOCALHOST, port).await;
        let pool = ConnectionPool::new(pool_config(port, 10));
        let peer = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let first = pool.acquire(peer).await.unwrap();
        pool.remove(peer);
        assert_eq!(pool.len(), 0);

        let second = pool.acquire(peer).await.unwrap();
        assert!(!Arc::ptr_eq(&first.stream, &second.stream));
    }

    #[tokio::test]
    async fn test_acquire_fails_when_no_peer_listens() {
        let port = free_port().await;
        let pool = ConnectionPool::new(pool_config(port, 10));

        let result = pool.acquire(IpAddr::V4(Ipv4Addr::LOCALHOST)).await;
        assert!(matches!(
            result,
            Err(PoolError::Connect { .. } | PoolError::ConnectTimeout { .. })
        ));
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_close_all_empties_the_pool() {
        let port = free_port().await;
        let _peer = spawn_peer(Ipv4Addr::LOCALHOST, port).await;
        let pool = ConnectionPool::new(pool_config(port, 10));

        pool.acquire(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();
        pool.close_all();

        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_reaper_evicts_idle_connections() {
        let port = free_port().await;
        let _peer = spawn_peer(Ipv4Addr::LOCALHOST, port).await;
        let mut config = pool_config(port, 10);
        config.connection_timeout = Duration::from_millis(10);
        let pool = ConnectionPool::new(config);

        pool.acquire(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();

        let reaper = pool.spawn_reaper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        reaper.stop().await;

        assert!(pool.is_empty());
    }
}
