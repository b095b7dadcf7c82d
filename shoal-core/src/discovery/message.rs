//! Announcement datagram wire format and size-bounded batching

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::DiscoveryError;

/// Working margin below the ~65507-byte UDP payload ceiling.
pub const MAX_DATAGRAM_BYTES: usize = 60_000;

/// Metadata announced for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Chunk size in bytes
    pub size: u64,
    /// Hex-encoded SHA-256 of the chunk bytes
    pub checksum: String,
    /// Wall-clock time the chunk was last observed locally
    pub timestamp: String,
}

/// Position of one datagram within an announcement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    /// 1-based batch number
    pub current: usize,
    /// Total batches in this cycle
    pub total: usize,
}

/// One announcement datagram.
///
/// A peer's full inventory may span several of these per cycle; each batch
/// stands alone and the listener merges them per-peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Announcing peer's IPv4 address
    pub peer_ip: String,
    /// Chunk name to metadata for this batch
    pub chunks: BTreeMap<String, ChunkEntry>,
    /// Wall-clock send time
    pub timestamp: String,
    /// Batch position within the cycle
    pub batch_info: BatchInfo,
}

impl Announcement {
    /// Decodes a received datagram.
    ///
    /// # Errors
    /// - `DiscoveryError::Encode` - Payload is not a well-formed announcement
    pub fn decode(data: &[u8]) -> Result<Self, DiscoveryError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Splits an inventory into encoded announcement datagrams.
///
/// Starts at `max_entries` chunk entries per batch; if any encoded batch
/// exceeds [`MAX_DATAGRAM_BYTES`] the batch size is halved and the whole
/// split retried, down to one entry per batch.
///
/// # Errors
/// - `DiscoveryError::AnnouncementTooLarge` - A single entry alone exceeds
///   the datagram limit
/// - `DiscoveryError::Encode` - JSON encoding failed
pub fn encode_batches(
    peer_ip: &str,
    inventory: &BTreeMap<String, ChunkEntry>,
    timestamp: &str,
    max_entries: usize,
) -> Result<Vec<Vec<u8>>, DiscoveryError> {
    let entries: Vec<(&String, &ChunkEntry)> = inventory.iter().collect();
    let mut batch_size = max_entries.max(1);

    'retry: loop {
        let total = entries.len().div_ceil(batch_size);
        let mut encoded = Vec::with_capacity(total);

        for (batch_index, batch) in entries.chunks(batch_size).enumerate() {
            let announcement = Announcement {
                peer_ip: peer_ip.to_string(),
                chunks: batch
                    .iter()
                    .map(|(name, entry)| ((*name).clone(), (*entry).clone()))
                    .collect(),
                timestamp: timestamp.to_string(),
                batch_info: BatchInfo {
                    current: batch_index + 1,
                    total,
                },
            };

            let data = serde_json::to_vec(&announcement)?;
            if data.len() > MAX_DATAGRAM_BYTES {
                if batch_size == 1 {
                    return Err(DiscoveryError::AnnouncementTooLarge { size: data.len() });
                }
                batch_size = (batch_size / 2).max(1);
                continue 'retry;
            }
            encoded.push(data);
        }

        return Ok(encoded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(checksum: &str) -> ChunkEntry {
        ChunkEntry {
            size: 1024,
            checksum: checksum.to_string(),
            timestamp: "2024-01-01 00:00:00".to_string(),
        }
    }

    fn inventory(count: usize) -> BTreeMap<String, ChunkEntry> {
        (1..=count)
            .map(|i| (format!("f_{i}"), entry(&format!("{i:064x}"))))
            .collect()
    }

    #[test]
    fn test_announcement_round_trip() {
        let announcement = Announcement {
            peer_ip: "192.168.1.7".to_string(),
            chunks: inventory(2),
            timestamp: "2024-01-01 00:00:00".to_string(),
            batch_info: BatchInfo {
                current: 1,
                total: 1,
            },
        };

        let data = serde_json::to_vec(&announcement).unwrap();
        let decoded = Announcement::decode(&data).unwrap();

        assert_eq!(decoded, announcement);
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        assert!(Announcement::decode(b"{not json").is_err());
        assert!(Announcement::decode(b"{\"peer_ip\": \"1.2.3.4\"}").is_err());
    }

    #[test]
    fn test_batching_respects_max_entries() {
        let batches = encode_batches("10.0.0.1", &inventory(20), "now", 8).unwrap();

        assert_eq!(batches.len(), 3); // 8 + 8 + 4

        let first = Announcement::decode(&batches[0]).unwrap();
        let last = Announcement::decode(&batches[2]).unwrap();
        assert_eq!(first.chunks.len(), 8);
        assert_eq!(first.batch_info, BatchInfo { current: 1, total: 3 });
        assert_eq!(last.chunks.len(), 4);
        assert_eq!(last.batch_info, BatchInfo { current: 3, total: 3 });
    }

    #[test]
    fn test_batching_halves_until_datagrams_fit() {
        // Entries with ~16 KiB checksums: 8 per batch blows the 60 KB margin,
        // 2 per batch fits.
        let mut big = BTreeMap::new();
        for i in 0..8 {
            let mut chunk = entry("");
            chunk.checksum = "ab".repeat(8192);
            big.insert(format!("f_{i}"), chunk);
        }

        let batches = encode_batches("10.0.0.1", &big, "now", 8).unwrap();

        assert!(batches.len() >= 4);
        for data in &batches {
            assert!(data.len() <= MAX_DATAGRAM_BYTES);
        }
    }

    #[test]
    fn test_single_oversized_entry_is_an_error() {
        let mut big = BTreeMap::new();
        let mut chunk = entry("");
        chunk.checksum = "ab".repeat(40_000);
        big.insert("f_1".to_string(), chunk);

        assert!(matches!(
            encode_batches("10.0.0.1", &big, "now", 8),
            Err(DiscoveryError::AnnouncementTooLarge { .. })
        ));
    }

    #[test]
    fn test_batches_cover_whole_inventory() {
        let inv = inventory(11);
        let batches = encode_batches("10.0.0.1", &inv, "now", 4).unwrap();

        let mut seen = BTreeMap::new();
        for data in &batches {
            seen.extend(Announcement::decode(data).unwrap().chunks);
        }
        assert_eq!(seen, inv);
    }
}
