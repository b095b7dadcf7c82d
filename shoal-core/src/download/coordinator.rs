//! Download coordinator: worker pool, per-peer retry, and stitching

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::DownloadError;
use crate::config::ShoalConfig;
use crate::discovery::ContentEntry;
use crate::pool::ConnectionPool;
use crate::storage::{ChunkStore, parse_ordinal, split_content_name};
use crate::transfer::{FetchError, fetch_chunk};

/// One unit of work: a chunk, its expected checksum, and candidate peers.
#[derive(Debug, Clone)]
struct ChunkJob {
    name: String,
    checksum: String,
    peers: Vec<String>,
}

/// Shared state of one download job.
struct JobState {
    /// Work still to be claimed by a worker
    queue: Mutex<VecDeque<ChunkJob>>,
    /// Chunk names confirmed transferred and verified
    succeeded: Mutex<HashSet<String>>,
    /// Chunk names whose candidate peers are all exhausted
    failed: Mutex<HashSet<String>>,
    /// All required chunk names, for reporting what is missing
    required: Vec<String>,
    /// Signalled once every required chunk is accounted for
    complete: Notify,
}

impl JobState {
    fn new(jobs: Vec<ChunkJob>) -> Self {
        Self {
            required: jobs.iter().map(|job| job.name.clone()).collect(),
            queue: Mutex::new(jobs.into()),
            succeeded: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashSet::new()),
            complete: Notify::new(),
        }
    }

    /// Records one finished work item and signals completion when every
    /// chunk is accounted for.
    fn record(&self, chunk_name: String, success: bool) {
        let accounted = {
            if success {
                self.succeeded.lock().insert(chunk_name);
            } else {
                self.failed.lock().insert(chunk_name);
            }
            self.succeeded.lock().len() + self.failed.lock().len()
        };
        if accounted >= self.required.len() {
            self.complete.notify_one();
        }
    }

    /// Required chunks not yet verified into the store.
    fn missing(&self) -> Vec<String> {
        let succeeded = self.succeeded.lock();
        self.required
            .iter()
            .filter(|name| !succeeded.contains(*name))
            .cloned()
            .collect()
    }
}

/// Coordinates one content download end to end.
///
/// Cheap to clone; clones share the connection pool and chunk store.
#[derive(Clone)]
pub struct DownloadCoordinator {
    store: ChunkStore,
    pool: ConnectionPool,
    config: ShoalConfig,
}

impl DownloadCoordinator {
    pub fn new(config: ShoalConfig, store: ChunkStore, pool: ConnectionPool) -> Self {
        Self {
            store,
            pool,
            config,
        }
    }

    /// Downloads and reassembles one content item.
    ///
    /// Resolves required chunks from the persisted content directory, runs
    /// the worker pool, and stitches once every chunk has been transferred
    /// and verified. A failed job never writes a partial output file.
    ///
    /// Returns the path of the reassembled file.
    ///
    /// # Errors
    /// - `DownloadError::NoChunksAvailable` - Nothing in the content
    ///   directory matches the content name
    /// - `DownloadError::ChunksExhausted` - Some chunk failed against every
    ///   candidate peer
    /// - `DownloadError::Timeout` - The overall deadline elapsed first
    pub async fn fetch(&self, content_name: &str) -> Result<PathBuf, DownloadError> {
        let (base_name, _extension) = split_content_name(content_name);
        let jobs = self.resolve(base_name).await?;
        if jobs.is_empty() {
            warn!("No chunks available for {content_name}");
            return Err(DownloadError::NoChunksAvailable {
                content: content_name.to_string(),
            });
        }

        let total = jobs.len();
        info!("Starting download of {content_name} with {total} chunks");
        let state = Arc::new(JobState::new(jobs));

        let workers = self.config.download.max_workers.min(total);
        for _ in 0..workers {
            let coordinator = self.clone();
            let state = Arc::clone(&state);
            tokio::spawn(async move { coordinator.worker_loop(state).await });
        }

        let overall = self.config.download.overall_timeout;
        match tokio::time::timeout(overall, state.complete.notified()).await {
            Err(_) => {
                // Workers are not force-cancelled; they drain the queue and
                // exit on their own.
                let missing = state.missing();
                error!("Download of {content_name} timed out; missing {missing:?}");
                Err(DownloadError::Timeout { missing })
            }
            Ok(()) => {
                let missing = state.missing();
                if missing.is_empty() {
                    info!("All chunks downloaded successfully");
                    self.stitch(content_name, base_name).await
                } else {
                    error!("Download of {content_name} incomplete; missing {missing:?}");
                    Err(DownloadError::ChunksExhausted { missing })
                }
            }
        }
    }

    /// Resolves the required chunks of a content item from the persisted
    /// content directory.
    async fn resolve(&self, base_name: &str) -> Result<Vec<ChunkJob>, DownloadError> {
        let path = &self.config.storage.content_dict_path;
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            warn!("Content directory not found at {path:?}");
            return Ok(Vec::new());
        }

        let data = tokio::fs::read(path).await?;
        let content: BTreeMap<String, ContentEntry> = serde_json::from_slice(&data)?;
        let prefix = format!("{base_name}_");

        let mut jobs: Vec<(u64, ChunkJob)> = content
            .into_iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .filter_map(|(name, entry)| {
                let ordinal = parse_ordinal(&name)?;
                Some((
                    ordinal,
                    ChunkJob {
                        name,
                        checksum: entry.checksum,
                        peers: entry.peers,
                    },
                ))
            })
            .collect();
        jobs.sort_by_key(|(ordinal, _)| *ordinal);

        Ok(jobs.into_iter().map(|(_, job)| job).collect())
    }

    /// Pulls work items until the queue is drained.
    async fn worker_loop(&self, state: Arc<JobState>) {
        loop {
            let job = {
                let mut queue = state.queue.lock();
                queue.pop_front()
            };
            let Some(job) = job else { break };

            let success = self.try_peers(&job).await;
            if success {
                info!("Successfully downloaded {}", job.name);
            } else {
                warn!("Exhausted all peers for {}", job.name);
            }
            state.record(job.name, success);
        }
    }

    /// Tries candidate peers in listed order; first verified fetch wins.
    async fn try_peers(&self, job: &ChunkJob) -> bool {
        for peer in &job.peers {
            info!("Attempting to download {} from {peer}", job.name);
            let ip: IpAddr = match peer.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    warn!("Skipping unparsable peer address {peer}");
                    continue;
                }
            };

            match self.attempt(ip, job).await {
                Ok(()) => match self.store.commit_temp(&job.name).await {
                    Ok(()) => return true,
                    Err(e) => {
                        error!("Failed to commit verified chunk {}: {e}", job.name);
                        return false;
                    }
                },
                Err(e) => {
                    warn!("Failed to fetch {} from {peer}: {e}", job.name);
                    if e.poisons_connection() {
                        self.pool.remove(ip);
                    }
                    self.store.discard_temp(&job.name).await;
                }
            }
        }
        false
    }

    /// One fetch attempt against one peer over a pooled connection.
    ///
    /// The per-connection lock is held for exactly this exchange.
    async fn attempt(&self, peer: IpAddr, job: &ChunkJob) -> Result<(), FetchError> {
        let connection = self
            .pool
            .acquire(peer)
            .await
            .map_err(|e| FetchError::Transport {
                reason: e.to_string(),
            })?;

        let mut stream = connection.lock().await;
        fetch_chunk(
            &mut stream,
            &job.name,
            &job.checksum,
            &self.store.temp_path(&job.name),
            self.config.network.exchange_timeout,
        )
        .await
    }

    /// Concatenates verified chunks into the output file in ordinal order,
    /// deleting each chunk after it is copied.
    async fn stitch(&self, content_name: &str, base_name: &str) -> Result<PathBuf, DownloadError> {
        let output_path = self.config.storage.downloads_dir.join(content_name);
        info!("Starting file reassembly: {output_path:?}");

        let chunk_names = self.store.chunks_of(base_name).await?;
        let mut output = tokio::fs::File::create(&output_path).await?;

        for chunk_name in &chunk_names {
            let mut chunk = tokio::fs::File::open(self.store.chunk_path(chunk_name)).await?;
            tokio::io::copy(&mut chunk, &mut output).await?;
            self.store.remove(chunk_name).await?;
            debug!("Stitched {chunk_name}");
        }
        output.flush().await?;

        info!("File reassembly complete: {output_path:?}");
        Ok(output_path)
    }
}
