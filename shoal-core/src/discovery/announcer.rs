//! Periodic broadcast of the local chunk inventory

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use super::message::{ChunkEntry, encode_batches};
use super::DiscoveryError;
use crate::config::DiscoveryConfig;
use crate::storage::ChunkStore;
use crate::task::{BackgroundTask, shutdown_channel};

/// Broadcasts the local chunk inventory on every announce interval.
///
/// Each cycle scans the chunk store, batches the inventory into datagrams,
/// and delivers every batch to each target port with a three-step fallback:
/// directed subnet broadcast, then limited broadcast, then loopback. A
/// failed send is logged and the cycle proceeds; the discovery protocol
/// tolerates lost announcements.
pub struct Announcer {
    store: ChunkStore,
    config: DiscoveryConfig,
}

impl Announcer {
    pub fn new(store: ChunkStore, config: DiscoveryConfig) -> Self {
        Self { store, config }
    }

    /// Spawns the announce loop.
    ///
    /// # Errors
    /// - `DiscoveryError::Io` - The broadcast socket could not be created
    pub async fn start(self) -> Result<BackgroundTask, DiscoveryError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        info!(
            "Announcer started with target ports: {:?}",
            self.config.target_ports
        );

        let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.announce_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.announce_cycle(&socket).await {
                            error!("Error in announcement cycle: {e}");
                        }
                    }
                }
            }
        });

        Ok(BackgroundTask::new(shutdown_tx, handle))
    }

    /// Runs one announcement cycle: scan, batch, deliver.
    async fn announce_cycle(&self, socket: &UdpSocket) -> Result<(), DiscoveryError> {
        let inventory = self.inventory().await?;
        if inventory.is_empty() {
            debug!("No chunks available to announce");
            return Ok(());
        }

        let local_ip = local_ip().await;
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let batches = encode_batches(
            &local_ip.to_string(),
            &inventory,
            &timestamp,
            self.config.max_batch_entries,
        )?;

        let total = batches.len();
        for (index, data) in batches.iter().enumerate() {
            self.send_with_fallback(socket, data, local_ip, index + 1, total)
                .await;
        }

        info!("Announced {} chunks in {} batches", inventory.len(), total);
        Ok(())
    }

    /// Scans the chunk store into announcement entries.
    async fn inventory(&self) -> Result<BTreeMap<String, ChunkEntry>, DiscoveryError> {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let scanned = self.store.scan().await?;

        Ok(scanned
            .into_iter()
            .map(|(name, chunk)| {
                (
                    name,
                    ChunkEntry {
                        size: chunk.size,
                        checksum: chunk.checksum,
                        timestamp: timestamp.clone(),
                    },
                )
            })
            .collect())
    }

    /// Delivers one batch to every target port, first strategy wins.
    async fn send_with_fallback(
        &self,
        socket: &UdpSocket,
        data: &[u8],
        local_ip: IpAddr,
        batch: usize,
        total: usize,
    ) {
        for &port in &self.config.target_ports {
            let mut delivered = false;
            for addr in delivery_addresses(local_ip) {
                match socket.send_to(data, (addr, port)).await {
                    Ok(_) => {
                        debug!("Sent batch {batch}/{total} to {addr}:{port}");
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        warn!("Broadcast to {addr}:{port} failed: {e}");
                    }
                }
            }
            if !delivered {
                error!("All broadcast methods failed for port {port}");
            }
        }
    }
}

/// Delivery strategies in preference order for one target port.
///
/// Directed subnet broadcast reaches the local /24; the limited broadcast
/// address covers hosts where the subnet form is rejected; loopback is the
/// last resort for single-host setups.
fn delivery_addresses(local_ip: IpAddr) -> [IpAddr; 3] {
    [
        broadcast_address(local_ip),
        IpAddr::V4(Ipv4Addr::BROADCAST),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    ]
}

/// Computes the directed broadcast address for the local /24 subnet.
fn broadcast_address(local_ip: IpAddr) -> IpAddr {
    match local_ip {
        IpAddr::V4(v4) if !v4.is_loopback() => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 255))
        }
        _ => IpAddr::V4(Ipv4Addr::BROADCAST),
    }
}

/// Discovers the local IP by the routing-table trick.
///
/// A UDP connect to a public address selects the outbound interface without
/// sending any packet; loopback is the fallback when that fails.
pub async fn local_ip() -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0)).await else {
        return fallback;
    };
    if socket.connect(("8.8.8.8", 80)).await.is_err() {
        warn!("Could not determine local IP, using localhost");
        return fallback;
    }
    socket.local_addr().map(|addr| addr.ip()).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::fs;

    #[test]
    fn test_broadcast_address_for_private_subnet() {
        let addr = broadcast_address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42)));
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 255)));
    }

    #[test]
    fn test_broadcast_address_falls_back_for_loopback() {
        let addr = broadcast_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::BROADCAST));
    }

    #[test]
    fn test_delivery_order_ends_with_loopback() {
        let addrs = delivery_addresses(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(addrs[0], IpAddr::V4(Ipv4Addr::new(10, 1, 2, 255)));
        assert_eq!(addrs[1], IpAddr::V4(Ipv4Addr::BROADCAST));
        assert_eq!(addrs[2], IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_inventory_reflects_store_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        fs::write(store.chunk_path("f_1"), b"hello").await.unwrap();

        let announcer = Announcer::new(store, DiscoveryConfig::default());
        let inventory = announcer.inventory().await.unwrap();

        let entry = inventory.get("f_1").unwrap();
        assert_eq!(entry.size, 5);
        assert_eq!(
            entry.checksum,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_empty_store_yields_empty_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());

        let announcer = Announcer::new(store, DiscoveryConfig::default());
        assert!(announcer.inventory().await.unwrap().is_empty());
    }
}
