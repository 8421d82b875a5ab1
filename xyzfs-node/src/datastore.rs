//! Datastore: volumes, shard allocation and file placement
//!
//! A client write goes to the node picked by the [`NodeRouter`]. When that is
//! this node the file lands in a local data shard and is copied, targeted at
//! a freshly created shard with the same ID, to `replicas` other peers. When
//! it is a peer the whole file is forwarded there untargeted, and the peer
//! does the same.

use crate::file_locator::{FileLocator, LocateResult, ShardLocation};
use crate::metrics::{NodeMetrics, WriteOrigin};
use crate::router::{NodeRouter, RouteCriteria};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use xyzfs_core::{FileMeta, Result, XyzError};
use xyzfs_network::{CompletedTransfer, CreateShardRequest};
use xyzfs_storage::{IndexBroadcaster, Shard, StorageConfig, StorageStats, Volume};

/// Sends whole files to peers
#[async_trait]
pub trait PeerFileSender: Send + Sync {
    /// Transfer `data` to `node`. With a target, the peer first creates that
    /// shard and stores the file in it.
    async fn send_file(
        &self,
        node: &str,
        meta: &FileMeta,
        data: &[u8],
        target: Option<CreateShardRequest>,
    ) -> Result<()>;
}

/// Datastore settings
#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    /// Directory holding `v=<uuid>` volumes
    pub volume_path: PathBuf,
    pub storage: StorageConfig,
    pub max_file_size: u64,
    /// Copies made of every locally stored untargeted write
    pub replicas: usize,
}

impl DatastoreConfig {
    pub fn new(volume_path: impl Into<PathBuf>, storage: StorageConfig) -> Self {
        Self {
            volume_path: volume_path.into(),
            storage,
            max_file_size: storage.shard_size as u64,
            replicas: 1,
        }
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }
}

pub struct Datastore {
    config: DatastoreConfig,
    volumes: RwLock<Vec<Arc<Volume>>>,
    locator: FileLocator,
    router: NodeRouter,
    metrics: NodeMetrics,
    sender: OnceLock<Arc<dyn PeerFileSender>>,
    /// Serializes capacity scans and block allocation
    allocation: Mutex<()>,
}

impl Datastore {
    /// Recover every volume under the volume path, creating one if none exist.
    pub fn open(
        config: DatastoreConfig,
        broadcaster: Arc<dyn IndexBroadcaster>,
        router: NodeRouter,
        metrics: NodeMetrics,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.volume_path)?;
        let mut volumes = Volume::scan(&config.volume_path, config.storage, broadcaster.clone())?;
        if volumes.is_empty() {
            volumes.push(Volume::create(&config.volume_path, config.storage, broadcaster)?);
        }
        let shards: usize = volumes.iter().map(|v| v.shards().len()).sum();
        info!(
            path = ?config.volume_path,
            volumes = volumes.len(),
            shards,
            "Datastore opened"
        );

        Ok(Arc::new(Self {
            config,
            volumes: RwLock::new(volumes.into_iter().map(Arc::new).collect()),
            locator: FileLocator::new(),
            router,
            metrics,
            sender: OnceLock::new(),
            allocation: Mutex::new(()),
        }))
    }

    /// Install the peer transfer path; only the first call takes effect.
    pub fn set_sender(&self, sender: Arc<dyn PeerFileSender>) {
        if self.sender.set(sender).is_err() {
            warn!("Datastore sender already installed");
        }
    }

    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    pub fn volumes(&self) -> Vec<Arc<Volume>> {
        self.volumes.read().clone()
    }

    pub fn locator(&self) -> &FileLocator {
        &self.locator
    }

    pub fn router(&self) -> &NodeRouter {
        &self.router
    }

    /// Every local shard, data and parity
    pub fn local_shards(&self) -> Vec<Arc<Shard>> {
        self.volumes.read().iter().flat_map(|v| v.shards()).collect()
    }

    /// Find a local data shard with room for `size` bytes, allocating a new
    /// block when every shard is full.
    pub fn allocate_shard_capacity(&self, size: u32) -> Result<Arc<Shard>> {
        if size > self.config.storage.shard_size {
            return Err(XyzError::Capacity(format!(
                "{} bytes never fit a {} byte shard",
                size, self.config.storage.shard_size
            )));
        }

        let _guard = self.allocation.lock();
        for shard in self.local_shards() {
            if shard.allocate_capacity(size)? {
                return Ok(shard);
            }
        }

        let volume = self
            .volumes
            .read()
            .first()
            .cloned()
            .ok_or_else(|| XyzError::Internal("datastore has no volume".to_string()))?;
        let block = volume.new_block()?;
        info!(block = %block.id(), volume = %volume.id(), "Allocated new block");
        for shard in block.data_shards() {
            if shard.allocate_capacity(size)? {
                return Ok(shard);
            }
        }
        Err(XyzError::Capacity(format!(
            "new block {} has no room for {} bytes",
            block.id(),
            size
        )))
    }

    /// Store a client write on the node picked by the router.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn add_file(self: &Arc<Self>, full_name: &str, data: Vec<u8>) -> Result<FileMeta> {
        let size = data.len() as u64;
        if size > self.config.max_file_size {
            return Err(XyzError::FileTooLarge {
                size,
                max: self.config.max_file_size,
            });
        }

        let mut meta = FileMeta::new(full_name);
        meta.describe(&data)?;

        let node = self.router.pick_node(RouteCriteria::default())?;
        if self.router.is_local(&node) {
            let this = Arc::clone(self);
            let (shard, stored, data) = run_blocking(move || {
                let (shard, stored) = this.store_local(meta, &data, WriteOrigin::Client)?;
                Ok((shard, stored, data))
            })
            .await?;
            self.spawn_replication(&shard, stored.clone(), data);
            return Ok(stored);
        }

        debug!(node = %node, file = %full_name, "Forwarding write to peer");
        self.sender()?.send_file(&node, &meta, &data, None).await?;
        Ok(meta)
    }

    /// Store a reassembled transfer from a peer.
    ///
    /// Targeted transfers go to the named shard and are not copied further;
    /// untargeted ones are placed like a local client write and replicated.
    /// Shard work runs on the blocking pool.
    pub async fn receive_file(self: &Arc<Self>, transfer: CompletedTransfer) -> Result<FileMeta> {
        let this = Arc::clone(self);
        run_blocking(move || this.store_transfer(transfer)).await
    }

    fn store_transfer(self: &Arc<Self>, transfer: CompletedTransfer) -> Result<FileMeta> {
        let CompletedTransfer {
            node,
            meta,
            target_shard,
            data,
            ..
        } = transfer;
        let size = u32::try_from(data.len()).map_err(|_| XyzError::FileTooLarge {
            size: data.len() as u64,
            max: u32::MAX as u64,
        })?;

        let result = match target_shard {
            Some(shard_id) => {
                let started = Instant::now();
                let shard = self.local_shard(shard_id)?;
                if !shard.allocate_capacity(size)? {
                    return Err(XyzError::ShardFull {
                        shard: shard_id.to_string(),
                        requested: size as u64,
                        available: shard.available_capacity()? as u64,
                    });
                }
                let stored = shard.add_file(meta, &data)?;
                shard.persist()?;
                self.metrics
                    .record_write(WriteOrigin::Replica, data.len(), started.elapsed());
                stored
            }
            None => {
                let (shard, stored) = self.store_local(meta, &data, WriteOrigin::Forwarded)?;
                shard.persist()?;
                self.spawn_replication(&shard, stored.clone(), data);
                stored
            }
        };
        info!(
            from = %node,
            file = %result.full_name,
            size = result.size,
            targeted = target_shard.is_some(),
            "Stored file from peer"
        );
        Ok(result)
    }

    /// Register a shard with a caller-chosen ID so a peer can replicate into it.
    ///
    /// Idempotent: an existing local shard with the same ID is returned.
    pub fn create_shard(&self, request: CreateShardRequest) -> Result<Arc<Shard>> {
        let _guard = self.allocation.lock();
        if let Some(shard) = self.find_local_shard(request.shard_id) {
            return Ok(shard);
        }
        let volume = self
            .volumes
            .read()
            .first()
            .cloned()
            .ok_or_else(|| XyzError::Internal("datastore has no volume".to_string()))?;
        let block = volume.get_or_create_block(request.block_id);
        let shard = block.new_shard_with_id(request.shard_id, false)?;
        info!(block = %request.block_id, shard = %request.shard_id, "Created replica shard");
        Ok(shard)
    }

    /// Shards, local or remote, whose index reports `full_name`
    pub fn locate_file(&self, full_name: &str) -> Result<LocateResult> {
        self.locator.locate(&self.local_shards(), full_name)
    }

    /// Read `full_name` from the first local shard that holds it.
    pub fn read_local_file(&self, full_name: &str) -> Result<(Vec<u8>, bool)> {
        let located = self.locate_file(full_name)?;
        let mut last_err = XyzError::FileNotFound {
            name: full_name.to_string(),
            scanned: located.scanned,
        };
        for shard_id in located.shards {
            let Some(shard) = self.find_local_shard(shard_id) else {
                continue;
            };
            match shard.read_file(full_name) {
                Ok(found) => return Ok(found),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Local shard by its string ID
    pub fn local_shard_by_id_str(&self, id: &str) -> Result<Arc<Shard>> {
        self.local_shard(Uuid::parse_str(id)?)
    }

    /// Every known location of a shard, this node included
    pub fn shard_by_id_str(&self, id: &str) -> Result<Vec<ShardLocation>> {
        let shard_id = Uuid::parse_str(id)?;
        self.shard_locations()
            .remove(&shard_id)
            .ok_or_else(|| XyzError::ShardNotFound(id.to_string()))
    }

    pub fn shard_locations(&self) -> BTreeMap<Uuid, Vec<ShardLocation>> {
        self.locator.shard_locations(&self.local_shards())
    }

    /// Flush every dirty shard to disk.
    pub fn persist_all(&self) -> Result<()> {
        for volume in self.volumes() {
            volume.persist()?;
        }
        Ok(())
    }

    /// Persist dirty shards and refresh the storage gauges.
    pub fn flush(&self) -> Result<()> {
        self.persist_all()?;
        let stats = self.stats()?;
        debug!(files = stats.file_count, bytes = stats.bytes_used, "Datastore flushed");
        Ok(())
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let mut total = StorageStats::default();
        for volume in self.volumes() {
            total.merge(&volume.stats()?);
        }
        self.metrics.update_storage(&total);
        Ok(total)
    }

    fn sender(&self) -> Result<&Arc<dyn PeerFileSender>> {
        self.sender
            .get()
            .ok_or_else(|| XyzError::Configuration("no peer sender installed".to_string()))
    }

    fn find_local_shard(&self, id: Uuid) -> Option<Arc<Shard>> {
        self.volumes.read().iter().find_map(|v| v.shard(id))
    }

    fn local_shard(&self, id: Uuid) -> Result<Arc<Shard>> {
        self.find_local_shard(id)
            .ok_or_else(|| XyzError::ShardNotFound(id.to_string()))
    }

    fn store_local(
        &self,
        meta: FileMeta,
        data: &[u8],
        origin: WriteOrigin,
    ) -> Result<(Arc<Shard>, FileMeta)> {
        let started = Instant::now();
        let size = u32::try_from(data.len()).map_err(|_| XyzError::FileTooLarge {
            size: data.len() as u64,
            max: u32::MAX as u64,
        })?;
        let shard = self.allocate_shard_capacity(size)?;
        let stored = shard.add_file(meta, data)?;
        self.metrics.record_write(origin, data.len(), started.elapsed());
        debug!(shard = %shard.id(), file = %stored.full_name, offset = stored.start_offset, "Stored file");
        Ok((shard, stored))
    }

    fn spawn_replication(self: &Arc<Self>, shard: &Arc<Shard>, meta: FileMeta, data: Vec<u8>) {
        if self.config.replicas == 0 {
            return;
        }
        let target = CreateShardRequest {
            block_id: shard.block_id(),
            shard_id: shard.id(),
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.replicate(meta, data, target).await;
        });
    }

    /// Copy a stored file to up to `replicas` fresh peers; returns the peers
    /// that acknowledged.
    pub async fn replicate(
        &self,
        meta: FileMeta,
        data: Vec<u8>,
        target: CreateShardRequest,
    ) -> Vec<String> {
        let peers: Vec<String> = self
            .router
            .candidates(RouteCriteria::remote_only())
            .into_iter()
            .take(self.config.replicas)
            .collect();
        if peers.is_empty() {
            debug!(file = %meta.full_name, "No peer available for replication");
            return Vec::new();
        }
        let sender = match self.sender() {
            Ok(sender) => sender,
            Err(e) => {
                warn!(error = %e, "Replication skipped");
                return Vec::new();
            }
        };

        let mut successful = Vec::new();
        for peer in peers {
            match sender.send_file(&peer, &meta, &data, Some(target)).await {
                Ok(()) => {
                    self.metrics.record_replica(true);
                    successful.push(peer);
                }
                Err(e) => {
                    self.metrics.record_replica(false);
                    warn!(
                        file = %meta.full_name,
                        peer = %peer,
                        shard = %target.shard_id,
                        error = %e,
                        "Replica transfer failed"
                    );
                }
            }
        }
        successful
    }
}

/// Run shard and disk work off the async workers.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| XyzError::Internal(format!("storage task failed: {e}")))?
}
