// Public entry points of the transfer engine. The façade validates
// arguments, owns the cache registry and the device memory pool, wires the
// channel manager, transfer services and link manager together, and routes
// each operation to the fabric-direct or buffer-staged data plane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::unbounded;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::channel::{Channel, ChannelType};
use crate::channel::manager::{ChannelManager, ManagerConfig};
use crate::channel::message::TransferType;
use crate::common::options::{BufPoolConfig, BufTierConfig, EngineOptions};
use crate::common::thread_pool::ThreadPool;
use crate::common::types::{
    Cache, CacheDesc, CacheIndex, CachePlacement, ClusterInfo, KvCacheExtParam, MemAddr,
    RegisterCfg, Role,
};
use crate::fabric::{EndpointDesc, Fabric, MemHandle, MemRegion, MemType, Protocol};
use crate::link::manager::{LinkManager, LinkManagerConfig, LinkStatus, RemoteCacheInfo};
use crate::link::rank_table::RankTableInfo;
use crate::memory::allocator::{BackingStore, MemoryPool, ScalableAllocator, ScalableConfig, SpanHandle};
use crate::memory::buf_pool::StagingPool;
use crate::runtime::{DeviceRuntime, MallocPolicy, MemcpyKind};
use crate::transfer::buffer_service::BufferTransferService;
use crate::transfer::fabric_service::FabricTransferService;
use crate::transfer::task_gen::{TaskGenerator, TaskKind, CONT_MEM_BLOCK_SIZE};
use crate::transfer::{TransferOp, TransferOpDesc};
use crate::{Result, Status};

/// Ceiling for one coalesced block copy, matching the task generator.
const MAX_COALESCED_COPY: u64 = 4 * 1024 * 1024;
/// Host copies above this are split across the copy pool.
const HOST_COPY_CHUNK: u64 = 8 * 1024 * 1024;
const HOST_COPY_THREADS: usize = 8;
const MAX_STREAMS: usize = 16;
/// Staging pools carved when no `BufPoolCfg` option is given.
const DEFAULT_STAGING_TOTAL: u64 = 64 * 1024 * 1024 + 4096;
const DEFAULT_STAGING_BLK: u64 = 512 * 1024;
const DEFAULT_STAGING_BUF: u64 = 32 * 1024 * 1024;
const SIGNAL_REGION_LEN: u64 = 64;

struct CacheEntry {
    cache: Cache,
    owned_spans: Vec<SpanHandle>,
    mem_handles: Vec<MemHandle>,
    external: bool,
}

struct StagingRegion {
    addr: MemAddr,
    handle: MemHandle,
}

struct RuntimeBacking {
    runtime: Arc<dyn DeviceRuntime>,
}

impl BackingStore for RuntimeBacking {
    fn alloc(&self, size: u64) -> Result<MemAddr> {
        self.runtime.malloc(size, MallocPolicy::HugeFirst)
    }

    fn free(&self, addr: MemAddr, _size: u64) -> Result<()> {
        self.runtime.free(addr)
    }
}

struct EngineState {
    options: EngineOptions,
    endpoint: crate::fabric::EndpointHandle,
    channel_manager: Arc<ChannelManager>,
    fabric_service: Arc<FabricTransferService>,
    buffer_service: Arc<BufferTransferService>,
    link_manager: Arc<LinkManager>,
    device_pool: Mutex<MemoryPool>,
    caches: Arc<Mutex<HashMap<i64, CacheEntry>>>,
    remote_caches: Arc<Mutex<HashMap<(u64, i64), RemoteCacheInfo>>>,
    staging_regions: Vec<StagingRegion>,
    signal_region: StagingRegion,
    host_copy_pool: ThreadPool,
}

pub struct KvTransferEngine {
    cluster_id: u64,
    role: Mutex<Role>,
    runtime: Arc<dyn DeviceRuntime>,
    fabric: Arc<dyn Fabric>,
    next_cache_id: AtomicI64,
    state: Mutex<Option<Arc<EngineState>>>,
}

impl KvTransferEngine {
    pub fn new(
        cluster_id: u64,
        role: Role,
        runtime: Arc<dyn DeviceRuntime>,
        fabric: Arc<dyn Fabric>,
    ) -> Self {
        Self {
            cluster_id,
            role: Mutex::new(role),
            runtime,
            fabric,
            next_cache_id: AtomicI64::new(1),
            state: Mutex::new(None),
        }
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    /// Brings up the whole stack: device context, fabric endpoint, staging
    /// pools, worker threads and (for listening roles) the accept daemon.
    pub fn initialize(&self, options: &HashMap<String, String>) -> Result<()> {
        let mut state_slot = self.state.lock();
        if state_slot.is_some() {
            return Err(Status::Failed("engine is already initialized".into()));
        }
        let options = EngineOptions::from_map(options)?;
        self.runtime.set_device(options.device_id)?;
        let endpoint = self.fabric.endpoint_create(&EndpointDesc {
            protocol: Protocol::Hccs,
            device_id: options.device_id,
            super_device_id: 0,
            super_pod_id: 0,
        })?;

        let fabric_service = Arc::new(FabricTransferService::new(
            self.runtime.clone(),
            self.fabric.clone(),
            endpoint,
            MAX_STREAMS,
        ));

        let (req_tx, req_rx) = unbounded();
        let (resp_tx, resp_rx) = unbounded();
        let heartbeat_interval = Duration::from_millis(options.heartbeat_wait_time_ms);
        let channel_manager = Arc::new(ChannelManager::new(
            ManagerConfig {
                heartbeat_interval,
                high_water: options.channel_high_water,
                low_water: options.channel_low_water,
            },
            req_tx,
            resp_tx,
        )?);
        {
            let fabric_service = fabric_service.clone();
            channel_manager
                .set_on_destroy(move |channel_id| fabric_service.remove_channel(channel_id));
        }

        // Staging pools and the one-sided signal byte live in registered
        // memory so peers can address them.
        let buf_cfg = options.buf_pool_cfg.clone().unwrap_or_else(default_buf_cfg);
        let mut staging_regions = Vec::new();
        let mut pools = Vec::new();
        for (tier_idx, tier) in buf_cfg.buf_cfg.iter().enumerate() {
            let addr = self.runtime.malloc(tier.total_size, MallocPolicy::HugeFirst)?;
            let handle = fabric_service.register_mem(MemRegion {
                addr,
                len: tier.total_size,
                mem_type: MemType::Device,
            })?;
            staging_regions.push(StagingRegion { addr, handle });
            pools.push(Arc::new(StagingPool::new(
                format!("staging-{tier_idx}"),
                addr,
                tier.total_size,
                tier.max_buf_size,
                tier.blk_size,
            )?));
        }
        let signal_addr = self.runtime.malloc(SIGNAL_REGION_LEN, MallocPolicy::HugeFirst)?;
        let signal_handle = fabric_service.register_mem(MemRegion {
            addr: signal_addr,
            len: SIGNAL_REGION_LEN,
            mem_type: MemType::Device,
        })?;
        let one = 1u8;
        self.runtime.memcpy(
            signal_addr,
            &one as *const u8 as MemAddr,
            1,
            MemcpyKind::H2D,
        )?;

        let buffer_service = Arc::new(BufferTransferService::new(
            self.runtime.clone(),
            pools,
            signal_addr,
            req_rx,
            resp_rx,
        )?);

        let local_rank_table = match &options.local_comm_res {
            Some(raw) => RankTableInfo::parse(raw)?,
            None => RankTableInfo::local(&format!("server-{}", self.cluster_id), options.device_id),
        };
        let link_manager = LinkManager::new(
            LinkManagerConfig {
                cluster_id: self.cluster_id,
                device_id: options.device_id,
                heartbeat_timeout: heartbeat_interval * 2,
                local_rank_table,
            },
            self.fabric.clone(),
            endpoint,
            channel_manager.clone(),
            fabric_service.clone(),
        );

        let caches: Arc<Mutex<HashMap<i64, CacheEntry>>> = Arc::new(Mutex::new(HashMap::new()));
        let remote_caches: Arc<Mutex<HashMap<(u64, i64), RemoteCacheInfo>>> =
            Arc::new(Mutex::new(HashMap::new()));
        {
            let caches = caches.clone();
            link_manager.set_cache_table_provider(Box::new(move || {
                caches
                    .lock()
                    .values()
                    .map(|entry| RemoteCacheInfo {
                        cache_id: entry.cache.cache_id,
                        tensor_addrs: entry.cache.tensor_addrs.clone(),
                        desc: entry.cache.desc.clone(),
                    })
                    .collect()
            }));
        }
        {
            let remote_caches = remote_caches.clone();
            link_manager.set_cache_table_sink(Box::new(move |cluster_id, table| {
                let mut remote = remote_caches.lock();
                for info in table {
                    remote.insert((cluster_id, info.cache_id), info);
                }
            }));
        }

        if let Some(listen) = &options.listen {
            link_manager.start_daemon(listen.clone())?;
        }

        let device_pool = Mutex::new(MemoryPool::Scalable(ScalableAllocator::new_scalable(
            ScalableConfig::default(),
            Box::new(RuntimeBacking {
                runtime: self.runtime.clone(),
            }),
        )));

        *state_slot = Some(Arc::new(EngineState {
            options,
            endpoint,
            channel_manager,
            fabric_service,
            buffer_service,
            link_manager,
            device_pool,
            caches,
            remote_caches,
            staging_regions,
            signal_region: StagingRegion {
                addr: signal_addr,
                handle: signal_handle,
            },
            host_copy_pool: ThreadPool::new("kvlink_copy", HOST_COPY_THREADS),
        }));
        info!(cluster_id = self.cluster_id, "engine initialized");
        Ok(())
    }

    /// Tears the stack down in dependency order. Safe to call after any
    /// failure and idempotent.
    pub fn finalize(&self) {
        let state = self.state.lock().take();
        let Some(state) = state else { return };
        state.link_manager.finalize();
        let _ = state.channel_manager.finalize();
        state.buffer_service.finalize();
        state.fabric_service.finalize();

        let cache_ids: Vec<i64> = state.caches.lock().keys().copied().collect();
        for cache_id in cache_ids {
            let _ = Self::release_cache(&state, cache_id);
        }
        for region in &state.staging_regions {
            let _ = state.fabric_service.deregister_mem(region.handle);
            let _ = self.runtime.free(region.addr);
        }
        let _ = state.fabric_service.deregister_mem(state.signal_region.handle);
        let _ = self.runtime.free(state.signal_region.addr);
        let _ = self.fabric.endpoint_destroy(state.endpoint);
        info!(cluster_id = self.cluster_id, "engine finalized");
    }

    /// Switches roles. Gated by the switch-role option and forbidden while
    /// any link is alive.
    pub fn set_role(&self, role: Role, options: &HashMap<String, String>) -> Result<()> {
        let state = self.get_state()?;
        if !state.options.enable_switch_role {
            return Err(Status::FeatureNotEnabled);
        }
        if state.link_manager.link_count() > 0 {
            return Err(Status::ExistLink);
        }
        let parsed = EngineOptions::from_map(options)?;
        match parsed.listen {
            Some(listen) => {
                if state.link_manager.listen_endpoint().as_ref() != Some(&listen) {
                    state.link_manager.stop_daemon()?;
                    state.link_manager.start_daemon(listen)?;
                }
            }
            None => state.link_manager.stop_daemon()?,
        }
        *self.role.lock() = role;
        Ok(())
    }

    pub fn allocate_cache(&self, desc: &CacheDesc) -> Result<Cache> {
        let state = self.get_state()?;
        desc.validate()?;
        let tensor_size = desc.tensor_size();
        let mut spans = Vec::with_capacity(desc.num_tensors as usize);
        let mut handles = Vec::with_capacity(desc.num_tensors as usize);
        let result = (|| -> Result<Vec<MemAddr>> {
            let mut addrs = Vec::with_capacity(desc.num_tensors as usize);
            for _ in 0..desc.num_tensors {
                let span = state.device_pool.lock().alloc(tensor_size)?;
                spans.push(span);
                self.zero_region(span.addr, tensor_size)?;
                handles.push(state.fabric_service.register_mem(MemRegion {
                    addr: span.addr,
                    len: tensor_size,
                    mem_type: placement_mem_type(desc.placement),
                })?);
                addrs.push(span.addr);
            }
            Ok(addrs)
        })();
        let tensor_addrs = match result {
            Ok(addrs) => addrs,
            Err(e) => {
                for handle in handles {
                    let _ = state.fabric_service.deregister_mem(handle);
                }
                for span in spans {
                    let _ = state.device_pool.lock().free(span.id);
                }
                return Err(e);
            }
        };
        let cache_id = self.next_cache_id.fetch_add(1, Ordering::Relaxed);
        let cache = Cache {
            cache_id,
            tensor_addrs,
            desc: desc.clone(),
        };
        state.caches.lock().insert(
            cache_id,
            CacheEntry {
                cache: cache.clone(),
                owned_spans: spans,
                mem_handles: handles,
                external: false,
            },
        );
        debug!(cache_id, num_tensors = desc.num_tensors, "cache allocated");
        Ok(cache)
    }

    /// Destroys a cache. Unknown ids succeed: destruction is idempotent.
    pub fn deallocate_cache(&self, cache_id: i64) -> Result<()> {
        let state = self.get_state()?;
        Self::release_cache(&state, cache_id)
    }

    /// Adopts externally allocated tensor memory as a cache.
    pub fn register_kv_cache(
        &self,
        desc: &CacheDesc,
        addrs: &[MemAddr],
        _cfg: &RegisterCfg,
    ) -> Result<i64> {
        let state = self.get_state()?;
        desc.validate()?;
        if addrs.len() != desc.num_tensors as usize {
            return Err(Status::ParamInvalid(format!(
                "{} addresses for {} tensors",
                addrs.len(),
                desc.num_tensors
            )));
        }
        if addrs.iter().any(|&a| a == 0) {
            return Err(Status::ParamInvalid("null tensor address".into()));
        }
        let tensor_size = desc.tensor_size();
        let mut handles = Vec::with_capacity(addrs.len());
        for &addr in addrs {
            match state.fabric_service.register_mem(MemRegion {
                addr,
                len: tensor_size,
                mem_type: placement_mem_type(desc.placement),
            }) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        let _ = state.fabric_service.deregister_mem(handle);
                    }
                    return Err(e);
                }
            }
        }
        let cache_id = self.next_cache_id.fetch_add(1, Ordering::Relaxed);
        state.caches.lock().insert(
            cache_id,
            CacheEntry {
                cache: Cache {
                    cache_id,
                    tensor_addrs: addrs.to_vec(),
                    desc: desc.clone(),
                },
                owned_spans: Vec::new(),
                mem_handles: handles,
                external: true,
            },
        );
        debug!(cache_id, "external cache registered");
        Ok(cache_id)
    }

    pub fn unregister_kv_cache(&self, cache_id: i64) -> Result<()> {
        self.deallocate_cache(cache_id)
    }

    pub fn link_clusters(
        &self,
        clusters: &[ClusterInfo],
        timeout: Duration,
    ) -> Result<Vec<Result<()>>> {
        let state = self.get_state()?;
        state.link_manager.link_clusters(clusters, timeout)
    }

    pub fn unlink_clusters(
        &self,
        clusters: &[ClusterInfo],
        timeout: Duration,
        force: bool,
    ) -> Result<Vec<Result<()>>> {
        let state = self.get_state()?;
        state.link_manager.unlink_clusters(clusters, timeout, force)
    }

    pub fn query_register_mem_status(&self, cluster_id: u64) -> Result<LinkStatus> {
        let state = self.get_state()?;
        state.link_manager.query_register_mem_status(cluster_id)
    }

    /// Pulls one contiguous slot (or a prefix of it) from a remote cache.
    pub fn pull_kv_cache(
        &self,
        src_index: &CacheIndex,
        dst_cache: &Cache,
        batch_index: u32,
        size: i64,
        ext: &KvCacheExtParam,
    ) -> Result<()> {
        let state = self.get_state()?;
        let remote = self.lookup_remote(&state, src_index)?;
        let dst = self.lookup_local(&state, dst_cache.cache_id)?;
        check_batch_index(&remote.desc, src_index.batch_index)?;
        check_batch_index(&dst.desc, batch_index)?;
        let (src_tensors, dst_tensors) =
            resolve_layer_tensors(remote.desc.num_tensors, dst.desc.num_tensors, ext)?;
        let pull_size = resolve_size(size, remote.desc.block_size(), dst.desc.block_size())?;

        let src_base: Vec<MemAddr> = src_tensors
            .iter()
            .map(|&t| remote.tensor_addrs[t] + src_index.batch_index as u64 * remote.desc.block_size())
            .collect();
        let dst_base: Vec<MemAddr> = dst_tensors
            .iter()
            .map(|&t| dst.cache.tensor_addrs[t] + batch_index as u64 * dst.desc.block_size())
            .collect();

        if direct_fabric_path(remote.desc.placement, dst.desc.placement) {
            let descs: Vec<TransferOpDesc> = src_base
                .iter()
                .zip(dst_base.iter())
                .map(|(&remote_addr, &local_addr)| TransferOpDesc {
                    local_addr,
                    remote_addr,
                    len: pull_size,
                })
                .collect();
            self.run_direct(&state, src_index.cluster_id, TransferOp::Read, &descs)
        } else {
            let descs =
                plan_contiguous_descs(&src_base, &dst_base, pull_size, DEFAULT_STAGING_BUF);
            let transfer_type = staged_type_for_pull(remote.desc.placement, dst.desc.placement);
            self.run_staged(&state, src_index.cluster_id, transfer_type, &descs)
        }
    }

    /// Pulls a set of blocks from a remote cache into local blocks.
    pub fn pull_kv_blocks(
        &self,
        src_index: &CacheIndex,
        dst_cache: &Cache,
        src_blocks: &[u64],
        dst_blocks: &[u64],
        ext: &KvCacheExtParam,
    ) -> Result<()> {
        let state = self.get_state()?;
        let remote = self.lookup_remote(&state, src_index)?;
        let dst = self.lookup_local(&state, dst_cache.cache_id)?;
        check_blocks(src_blocks, dst_blocks, &remote.desc, &dst.desc)?;
        let (src_tensors, dst_tensors) =
            resolve_layer_tensors(remote.desc.num_tensors, dst.desc.num_tensors, ext)?;
        let block_size = remote.desc.block_size();

        let src_base: Vec<MemAddr> = src_tensors.iter().map(|&t| remote.tensor_addrs[t]).collect();
        let dst_base: Vec<MemAddr> =
            dst_tensors.iter().map(|&t| dst.cache.tensor_addrs[t]).collect();
        let descs = plan_block_descs(&src_base, &dst_base, src_blocks, dst_blocks, block_size);

        if direct_fabric_path(remote.desc.placement, dst.desc.placement) {
            self.run_direct(&state, src_index.cluster_id, TransferOp::Read, &descs)
        } else {
            let transfer_type = staged_type_for_pull(remote.desc.placement, dst.desc.placement);
            self.run_staged(&state, src_index.cluster_id, transfer_type, &descs)
        }
    }

    /// Pushes one contiguous slot to a remote cache.
    pub fn push_kv_cache(
        &self,
        src_cache: &Cache,
        dst_index: &CacheIndex,
        src_batch_index: u32,
        size: i64,
        ext: &KvCacheExtParam,
    ) -> Result<()> {
        let state = self.get_state()?;
        let src = self.lookup_local(&state, src_cache.cache_id)?;
        let remote = self.lookup_remote(&state, dst_index)?;
        check_batch_index(&src.desc, src_batch_index)?;
        check_batch_index(&remote.desc, dst_index.batch_index)?;
        let (src_tensors, dst_tensors) =
            resolve_layer_tensors(src.desc.num_tensors, remote.desc.num_tensors, ext)?;
        let push_size = resolve_size(size, src.desc.block_size(), remote.desc.block_size())?;

        let src_base: Vec<MemAddr> = src_tensors
            .iter()
            .map(|&t| src.cache.tensor_addrs[t] + src_batch_index as u64 * src.desc.block_size())
            .collect();
        let dst_base: Vec<MemAddr> = dst_tensors
            .iter()
            .map(|&t| remote.tensor_addrs[t] + dst_index.batch_index as u64 * remote.desc.block_size())
            .collect();

        if direct_fabric_path(src.desc.placement, remote.desc.placement) {
            let descs: Vec<TransferOpDesc> = src_base
                .iter()
                .zip(dst_base.iter())
                .map(|(&local_addr, &remote_addr)| TransferOpDesc {
                    local_addr,
                    remote_addr,
                    len: push_size,
                })
                .collect();
            self.run_direct(&state, dst_index.cluster_id, TransferOp::Write, &descs)
        } else {
            let descs =
                plan_contiguous_descs(&dst_base, &src_base, push_size, DEFAULT_STAGING_BUF);
            let transfer_type = staged_type_for_push(src.desc.placement, remote.desc.placement);
            self.run_staged(&state, dst_index.cluster_id, transfer_type, &descs)
        }
    }

    /// Pushes a set of local blocks into remote blocks.
    pub fn push_kv_blocks(
        &self,
        src_cache: &Cache,
        dst_index: &CacheIndex,
        src_blocks: &[u64],
        dst_blocks: &[u64],
        ext: &KvCacheExtParam,
    ) -> Result<()> {
        let state = self.get_state()?;
        let src = self.lookup_local(&state, src_cache.cache_id)?;
        let remote = self.lookup_remote(&state, dst_index)?;
        check_blocks(src_blocks, dst_blocks, &src.desc, &remote.desc)?;
        let (src_tensors, dst_tensors) =
            resolve_layer_tensors(src.desc.num_tensors, remote.desc.num_tensors, ext)?;
        let block_size = src.desc.block_size();

        let src_base: Vec<MemAddr> = src_tensors.iter().map(|&t| src.cache.tensor_addrs[t]).collect();
        let dst_base: Vec<MemAddr> =
            dst_tensors.iter().map(|&t| remote.tensor_addrs[t]).collect();
        let descs = plan_block_descs(&dst_base, &src_base, dst_blocks, src_blocks, block_size);

        if direct_fabric_path(src.desc.placement, remote.desc.placement) {
            self.run_direct(&state, dst_index.cluster_id, TransferOp::Write, &descs)
        } else {
            let transfer_type = staged_type_for_push(src.desc.placement, remote.desc.placement);
            self.run_staged(&state, dst_index.cluster_id, transfer_type, &descs)
        }
    }

    /// Local copy between two caches, one contiguous slot each.
    pub fn copy_kv_cache(
        &self,
        src_cache: &Cache,
        dst_cache: &Cache,
        src_batch_index: u32,
        dst_batch_index: u32,
        offset: u64,
        size: i64,
    ) -> Result<()> {
        let state = self.get_state()?;
        let src = self.lookup_local(&state, src_cache.cache_id)?;
        let dst = self.lookup_local(&state, dst_cache.cache_id)?;
        check_batch_index(&src.desc, src_batch_index)?;
        check_batch_index(&dst.desc, dst_batch_index)?;
        if src.desc.num_tensors != dst.desc.num_tensors {
            return Err(Status::ParamInvalid("tensor count mismatch".into()));
        }
        let limit = src
            .desc
            .block_size()
            .min(dst.desc.block_size())
            .saturating_sub(offset);
        if limit == 0 {
            return Err(Status::ParamInvalid(format!("offset {offset} exceeds slot")));
        }
        let copy_size = resolve_size(size, limit, limit)?;
        let kind = copy_kind(src.desc.placement, dst.desc.placement);
        for t in 0..src.desc.num_tensors as usize {
            let src_addr = src.cache.tensor_addrs[t]
                + src_batch_index as u64 * src.desc.block_size()
                + offset;
            let dst_addr =
                dst.cache.tensor_addrs[t] + dst_batch_index as u64 * dst.desc.block_size() + offset;
            self.chunked_memcpy(&state, dst_addr, src_addr, copy_size, kind)?;
        }
        Ok(())
    }

    /// Local block copy with fan-out: every list in `dst_blocks_list` gets
    /// its own replica of the source blocks.
    pub fn copy_kv_blocks(
        &self,
        src_cache: &Cache,
        dst_cache: &Cache,
        src_blocks: &[u64],
        dst_blocks_list: &[Vec<u64>],
    ) -> Result<()> {
        let state = self.get_state()?;
        let src = self.lookup_local(&state, src_cache.cache_id)?;
        let dst = self.lookup_local(&state, dst_cache.cache_id)?;
        if dst_blocks_list.is_empty() {
            return Err(Status::ParamInvalid("no destination block lists".into()));
        }
        if src.desc.num_tensors != dst.desc.num_tensors {
            return Err(Status::ParamInvalid("tensor count mismatch".into()));
        }
        let kind = copy_kind(src.desc.placement, dst.desc.placement);
        let block_size = src.desc.block_size();
        for dst_blocks in dst_blocks_list {
            check_blocks(src_blocks, dst_blocks, &src.desc, &dst.desc)?;
            for t in 0..src.desc.num_tensors as usize {
                for (&sb, &db) in src_blocks.iter().zip(dst_blocks.iter()) {
                    let src_addr = src.cache.tensor_addrs[t] + sb * block_size;
                    let dst_addr = dst.cache.tensor_addrs[t] + db * block_size;
                    self.chunked_memcpy(&state, dst_addr, src_addr, block_size, kind)?;
                }
            }
        }
        Ok(())
    }

    pub fn print_memory_details(&self) {
        if let Ok(state) = self.get_state() {
            state.device_pool.lock().print_details();
        }
    }

    fn get_state(&self) -> Result<Arc<EngineState>> {
        self.state
            .lock()
            .clone()
            .ok_or_else(|| Status::Failed("engine is not initialized".into()))
    }

    fn release_cache(state: &EngineState, cache_id: i64) -> Result<()> {
        let entry = state.caches.lock().remove(&cache_id);
        let Some(entry) = entry else {
            // Destroying an unknown id is not an error.
            return Ok(());
        };
        for handle in entry.mem_handles {
            let _ = state.fabric_service.deregister_mem(handle);
        }
        if !entry.external {
            for span in entry.owned_spans {
                if let Err(e) = state.device_pool.lock().free(span.id) {
                    warn!(cache_id, %e, "span release failed");
                }
            }
        }
        debug!(cache_id, "cache released");
        Ok(())
    }

    fn lookup_remote(&self, state: &EngineState, index: &CacheIndex) -> Result<RemoteCacheInfo> {
        state
            .remote_caches
            .lock()
            .get(&(index.cluster_id, index.cache_id))
            .cloned()
            .ok_or(Status::KvCacheNotExist(index.cache_id))
    }

    fn lookup_local(&self, state: &EngineState, cache_id: i64) -> Result<LocalCache> {
        state
            .caches
            .lock()
            .get(&cache_id)
            .map(|entry| LocalCache {
                cache: entry.cache.clone(),
                desc: entry.cache.desc.clone(),
            })
            .ok_or(Status::KvCacheNotExist(cache_id))
    }

    /// Finds the client channel for a cluster, retrying through one
    /// transparent re-link if the channel vanished while the link table
    /// still holds the peer.
    fn channel_for(&self, state: &EngineState, cluster_id: u64) -> Result<Arc<Channel>> {
        let timeout = Duration::from_millis(state.options.sync_kv_cache_wait_time_ms);
        let channel_id = state
            .link_manager
            .client_channel_id(cluster_id)
            .ok_or(Status::NotYetLink)?;
        if let Some(channel) = state
            .channel_manager
            .get_channel(ChannelType::Client, &channel_id)
        {
            return Ok(channel);
        }
        warn!(cluster_id, "channel lost, attempting one re-link");
        state.link_manager.relink(cluster_id, timeout)?;
        let channel_id = state
            .link_manager
            .client_channel_id(cluster_id)
            .ok_or(Status::NotConnected)?;
        state
            .channel_manager
            .get_channel(ChannelType::Client, &channel_id)
            .ok_or(Status::NotConnected)
    }

    fn run_direct(
        &self,
        state: &EngineState,
        cluster_id: u64,
        op: TransferOp,
        descs: &[TransferOpDesc],
    ) -> Result<()> {
        let channel = self.channel_for(state, cluster_id)?;
        let timeout = Duration::from_millis(state.options.sync_kv_cache_wait_time_ms);
        let _guard = channel.begin_transfer();
        state
            .fabric_service
            .transfer(channel.channel_id(), op, descs, timeout)
    }

    fn run_staged(
        &self,
        state: &EngineState,
        cluster_id: u64,
        transfer_type: TransferType,
        descs: &[TransferOpDesc],
    ) -> Result<()> {
        let channel = self.channel_for(state, cluster_id)?;
        let timeout = Duration::from_millis(state.options.sync_kv_cache_wait_time_ms);
        state
            .buffer_service
            .transfer(&channel, transfer_type, descs, timeout)
    }

    fn zero_region(&self, addr: MemAddr, len: u64) -> Result<()> {
        let chunk = len.min(HOST_COPY_CHUNK) as usize;
        let zeros = vec![0u8; chunk];
        let mut offset = 0u64;
        while offset < len {
            let n = (len - offset).min(chunk as u64);
            self.runtime
                .memcpy(addr + offset, zeros.as_ptr() as MemAddr, n, MemcpyKind::H2D)?;
            offset += n;
        }
        Ok(())
    }

    /// Copies through the host copy pool when large enough to split.
    fn chunked_memcpy(
        &self,
        state: &EngineState,
        dst: MemAddr,
        src: MemAddr,
        len: u64,
        kind: MemcpyKind,
    ) -> Result<()> {
        if len <= HOST_COPY_CHUNK {
            return self.runtime.memcpy(dst, src, len, kind);
        }
        let chunks = len.div_ceil(HOST_COPY_CHUNK).min(HOST_COPY_THREADS as u64);
        let chunk_len = len.div_ceil(chunks);
        let handles: Vec<_> = (0..chunks)
            .map(|i| {
                let runtime = self.runtime.clone();
                let offset = i * chunk_len;
                let n = chunk_len.min(len - offset);
                state
                    .host_copy_pool
                    .commit(move || runtime.memcpy(dst + offset, src + offset, n, kind))
            })
            .collect();
        for handle in handles {
            handle.join()??;
        }
        Ok(())
    }
}

impl Drop for KvTransferEngine {
    fn drop(&mut self) {
        self.finalize();
    }
}

struct LocalCache {
    cache: Cache,
    desc: CacheDesc,
}

fn default_buf_cfg() -> BufPoolConfig {
    BufPoolConfig {
        buf_cfg: vec![BufTierConfig {
            total_size: DEFAULT_STAGING_TOTAL,
            blk_size: DEFAULT_STAGING_BLK,
            max_buf_size: DEFAULT_STAGING_BUF,
        }],
    }
}

fn placement_mem_type(placement: CachePlacement) -> MemType {
    match placement {
        CachePlacement::Device => MemType::Device,
        CachePlacement::Host => MemType::Host,
    }
}

fn direct_fabric_path(src: CachePlacement, dst: CachePlacement) -> bool {
    src == CachePlacement::Device && dst == CachePlacement::Device
}

fn staged_type_for_pull(src: CachePlacement, dst: CachePlacement) -> TransferType {
    match (src, dst) {
        (CachePlacement::Device, CachePlacement::Host) => TransferType::ReadRd2H,
        (CachePlacement::Device, CachePlacement::Device) => TransferType::ReadRd2D,
        (CachePlacement::Host, CachePlacement::Host) => TransferType::ReadRh2H,
        (CachePlacement::Host, CachePlacement::Device) => TransferType::ReadRh2D,
    }
}

fn staged_type_for_push(src: CachePlacement, dst: CachePlacement) -> TransferType {
    match (src, dst) {
        (CachePlacement::Device, CachePlacement::Host) => TransferType::WriteD2Rh,
        (CachePlacement::Device, CachePlacement::Device) => TransferType::WriteD2Rd,
        (CachePlacement::Host, CachePlacement::Host) => TransferType::WriteH2Rh,
        (CachePlacement::Host, CachePlacement::Device) => TransferType::WriteH2Rd,
    }
}

fn copy_kind(src: CachePlacement, dst: CachePlacement) -> MemcpyKind {
    match (src, dst) {
        (CachePlacement::Host, CachePlacement::Host) => MemcpyKind::H2H,
        (CachePlacement::Host, CachePlacement::Device) => MemcpyKind::H2D,
        (CachePlacement::Device, CachePlacement::Host) => MemcpyKind::D2H,
        (CachePlacement::Device, CachePlacement::Device) => MemcpyKind::D2D,
    }
}

fn check_batch_index(desc: &CacheDesc, batch_index: u32) -> Result<()> {
    if (batch_index as u64) >= desc.num_blocks() {
        return Err(Status::ParamInvalid(format!(
            "batch index {batch_index} out of range ({} slots)",
            desc.num_blocks()
        )));
    }
    Ok(())
}

fn check_blocks(
    src_blocks: &[u64],
    dst_blocks: &[u64],
    src_desc: &CacheDesc,
    dst_desc: &CacheDesc,
) -> Result<()> {
    if src_blocks.is_empty() || src_blocks.len() != dst_blocks.len() {
        return Err(Status::ParamInvalid(
            "block lists must be non-empty and of equal length".into(),
        ));
    }
    if src_desc.block_size() != dst_desc.block_size() {
        return Err(Status::ParamInvalid(format!(
            "block size mismatch: src {} dst {}",
            src_desc.block_size(),
            dst_desc.block_size()
        )));
    }
    if src_blocks.iter().any(|&b| b >= src_desc.num_blocks()) {
        return Err(Status::ParamInvalid("source block index out of range".into()));
    }
    if dst_blocks.iter().any(|&b| b >= dst_desc.num_blocks()) {
        return Err(Status::ParamInvalid(
            "destination block index out of range".into(),
        ));
    }
    Ok(())
}

fn resolve_size(size: i64, src_limit: u64, dst_limit: u64) -> Result<u64> {
    let limit = src_limit.min(dst_limit);
    match size {
        -1 => Ok(limit),
        s if s <= 0 => Err(Status::ParamInvalid(format!("invalid size {s}"))),
        s if s as u64 > limit => Err(Status::ParamInvalid(format!(
            "size {s} exceeds slot capacity {limit}"
        ))),
        s => Ok(s as u64),
    }
}

/// Selects tensor index lists for the two sides from the layer ranges.
fn resolve_layer_tensors(
    src_num_tensors: u32,
    dst_num_tensors: u32,
    ext: &KvCacheExtParam,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let tpl = ext.tensor_num_per_layer.max(1) as u32;
    let expand = |range: (i32, i32), num: u32, side: &str| -> Result<Vec<usize>> {
        match range {
            (-1, -1) => Ok((0..num as usize).collect()),
            (first, last) => {
                if first < 0 || last < first {
                    return Err(Status::ParamInvalid(format!(
                        "invalid {side} layer range ({first}, {last})"
                    )));
                }
                let start = first as u32 * tpl;
                let end = (last as u32 + 1) * tpl;
                if end > num {
                    return Err(Status::ParamInvalid(format!(
                        "{side} layer range ({first}, {last}) exceeds {num} tensors"
                    )));
                }
                Ok((start as usize..end as usize).collect())
            }
        }
    };
    let src = expand(ext.src_layer_range, src_num_tensors, "src")?;
    let dst = expand(ext.dst_layer_range, dst_num_tensors, "dst")?;
    if src.len() != dst.len() {
        return Err(Status::ParamInvalid(format!(
            "layer ranges select {} source and {} destination tensors",
            src.len(),
            dst.len()
        )));
    }
    Ok((src, dst))
}

/// Per-block descriptors in task order, coalescing runs that are
/// consecutive on both sides up to the copy ceiling.
fn plan_block_descs(
    remote_base: &[MemAddr],
    local_base: &[MemAddr],
    remote_blocks: &[u64],
    local_blocks: &[u64],
    block_size: u64,
) -> Vec<TransferOpDesc> {
    let mut descs = Vec::new();
    for (&remote_tensor, &local_tensor) in remote_base.iter().zip(local_base.iter()) {
        let mut pos = 0usize;
        while pos < remote_blocks.len() {
            let mut run = 1usize;
            while pos + run < remote_blocks.len()
                && remote_blocks[pos + run] == remote_blocks[pos + run - 1] + 1
                && local_blocks[pos + run] == local_blocks[pos + run - 1] + 1
                && (run as u64 + 1) * block_size <= MAX_COALESCED_COPY
            {
                run += 1;
            }
            descs.push(TransferOpDesc {
                local_addr: local_tensor + local_blocks[pos] * block_size,
                remote_addr: remote_tensor + remote_blocks[pos] * block_size,
                len: run as u64 * block_size,
            });
            pos += run;
        }
    }
    descs
}

/// Decomposes a contiguous per-tensor region into staged descriptors using
/// the task-block generator, so copies land in buffer-sized, bounded
/// chunks. `remote_base`/`local_base` hold one slot address per tensor.
fn plan_contiguous_descs(
    remote_base: &[MemAddr],
    local_base: &[MemAddr],
    size: u64,
    buffer_size: u64,
) -> Vec<TransferOpDesc> {
    let mut generator = TaskGenerator::new(remote_base.len() as u32, 2, buffer_size);
    let block_size = CONT_MEM_BLOCK_SIZE.min(size.max(1));
    let tasks = generator.generate_contiguous(size as i64, block_size);
    tasks
        .iter()
        .filter(|t| t.kind == TaskKind::TransferBlock)
        .map(|t| {
            let tensor = t.span.tensor_index as usize;
            TransferOpDesc {
                local_addr: local_base[tensor] + t.span.tensor_offset,
                remote_addr: remote_base[tensor] + t.span.tensor_offset,
                len: t.span.size,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_plan_coalesces_bilateral_runs() {
        let descs = plan_block_descs(&[0x10000], &[0x80000], &[1, 2, 3, 7], &[1, 2, 3, 9], 64);
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].len, 3 * 64);
        assert_eq!(descs[0].remote_addr, 0x10000 + 64);
        assert_eq!(descs[0].local_addr, 0x80000 + 64);
        assert_eq!(descs[1].len, 64);
    }

    #[test]
    fn block_plan_respects_copy_ceiling() {
        let blocks: Vec<u64> = (0..16).collect();
        let descs = plan_block_descs(&[0x0], &[0x0], &blocks, &blocks, 512 * 1024);
        assert!(descs.iter().all(|d| d.len <= MAX_COALESCED_COPY));
        let total: u64 = descs.iter().map(|d| d.len).sum();
        assert_eq!(total, 16 * 512 * 1024);
    }

    #[test]
    fn contiguous_plan_covers_the_region() {
        let descs = plan_contiguous_descs(&[0x1000, 0x900000], &[0x2000, 0xA00000], 1 << 20, 1 << 25);
        let total: u64 = descs.iter().map(|d| d.len).sum();
        assert_eq!(total, 2 << 20);
        assert!(descs
            .iter()
            .all(|d| d.remote_addr - 0x1000 == d.local_addr - 0x2000
                || d.remote_addr - 0x900000 == d.local_addr - 0xA00000));
    }

    #[test]
    fn layer_ranges_expand_to_tensor_lists() {
        let ext = KvCacheExtParam {
            src_layer_range: (1, 2),
            dst_layer_range: (0, 1),
            tensor_num_per_layer: 2,
        };
        let (src, dst) = resolve_layer_tensors(8, 8, &ext).unwrap();
        assert_eq!(src, vec![2, 3, 4, 5]);
        assert_eq!(dst, vec![0, 1, 2, 3]);
    }

    #[test]
    fn mismatched_layer_ranges_are_rejected() {
        let ext = KvCacheExtParam {
            src_layer_range: (0, 2),
            dst_layer_range: (0, 1),
            tensor_num_per_layer: 2,
        };
        assert!(resolve_layer_tensors(8, 8, &ext).is_err());
    }

    #[test]
    fn size_resolution_honours_slot_capacity() {
        assert_eq!(resolve_size(-1, 512, 1024).unwrap(), 512);
        assert_eq!(resolve_size(100, 512, 1024).unwrap(), 100);
        assert!(resolve_size(0, 512, 1024).is_err());
        assert!(resolve_size(2048, 512, 1024).is_err());
    }
}
