// Zero-copy device-to-device transfers over imported remote handles. Once a
// peer's spans are imported, a remote virtual address resolves to a locally
// visible one and the batch runs as async device copies on pooled streams.
// Completion is either waited for inline (`transfer`) or tracked through
// recorded events keyed by request id (`transfer_async`).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::common::types::MemAddr;
use crate::fabric::{EndpointHandle, Fabric, MemHandle, MemRegion, ShareHandleInfo};
use crate::runtime::{DeviceRuntime, EventHandle, EventStatus, MemcpyKind, StreamHandle};
use crate::transfer::{TransferOp, TransferOpDesc};
use crate::{Result, Status};

const STREAMS_PER_BATCH: usize = 4;
const STREAM_ACQUIRE_RETRY: Duration = Duration::from_millis(1);

/// Pool of device streams capped at a maximum. Streams are created lazily
/// and handed out idle-first.
pub struct StreamPool {
    runtime: Arc<dyn DeviceRuntime>,
    max_stream_num: usize,
    pool: Mutex<HashMap<StreamHandle, bool>>,
}

impl StreamPool {
    pub fn new(runtime: Arc<dyn DeviceRuntime>, max_stream_num: usize) -> Self {
        Self {
            runtime,
            max_stream_num,
            pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_alloc_stream(&self) -> Result<StreamHandle> {
        let mut pool = self.pool.lock();
        if let Some((&stream, idle)) = pool.iter_mut().find(|(_, idle)| **idle) {
            *idle = false;
            return Ok(stream);
        }
        if pool.len() < self.max_stream_num {
            let stream = self.runtime.stream_create(0)?;
            pool.insert(stream, false);
            debug!(pool_size = pool.len(), "created new transfer stream");
            return Ok(stream);
        }
        warn!(pool_size = pool.len(), "stream pool capacity limit reached");
        Err(Status::ResourceExhausted("stream pool".into()))
    }

    pub fn free_stream(&self, stream: StreamHandle) {
        if let Some(idle) = self.pool.lock().get_mut(&stream) {
            *idle = true;
        }
    }

    /// Aborts an in-flight stream and drops it from the pool.
    pub fn destroy_stream(&self, stream: StreamHandle) {
        if self.pool.lock().remove(&stream).is_some() {
            if let Err(e) = self.runtime.stream_abort(stream) {
                error!(?stream, %e, "stream abort failed");
            }
            if let Err(e) = self.runtime.stream_destroy(stream) {
                error!(?stream, %e, "stream destroy failed");
            }
        }
    }

    pub fn finalize(&self) {
        let mut pool = self.pool.lock();
        for (stream, _) in pool.drain() {
            let _ = self.runtime.stream_destroy(stream);
        }
    }

    pub fn size(&self) -> usize {
        self.pool.lock().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReq {
    pub req_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Waiting,
    Completed,
    Failed,
    NotFound,
}

struct AsyncRecord {
    channel_id: String,
    resources: Vec<(StreamHandle, EventHandle)>,
}

#[derive(Debug, Clone, Copy)]
struct ImportedSpan {
    local_addr: MemAddr,
    len: u64,
}

pub struct FabricTransferService {
    runtime: Arc<dyn DeviceRuntime>,
    fabric: Arc<dyn Fabric>,
    endpoint: EndpointHandle,
    streams: StreamPool,
    share_handles: Mutex<HashMap<u64, ShareHandleInfo>>,
    /// origin (remote) VA -> locally visible span.
    imported: Mutex<HashMap<MemAddr, ImportedSpan>>,
    async_records: Mutex<HashMap<u64, AsyncRecord>>,
    channel_reqs: Mutex<HashMap<String, HashSet<u64>>>,
    next_req_id: AtomicU64,
}

impl FabricTransferService {
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        fabric: Arc<dyn Fabric>,
        endpoint: EndpointHandle,
        max_stream_num: usize,
    ) -> Self {
        Self {
            runtime: runtime.clone(),
            fabric,
            endpoint,
            streams: StreamPool::new(runtime, max_stream_num),
            share_handles: Mutex::new(HashMap::new()),
            imported: Mutex::new(HashMap::new()),
            async_records: Mutex::new(HashMap::new()),
            channel_reqs: Mutex::new(HashMap::new()),
            next_req_id: AtomicU64::new(1),
        }
    }

    pub fn finalize(&self) {
        let records: Vec<u64> = self.async_records.lock().keys().copied().collect();
        for req_id in records {
            self.teardown_record(req_id, true);
        }
        self.streams.finalize();
    }

    /// Registers a local span with the fabric and stores its share handle
    /// for the next descriptor exchange.
    pub fn register_mem(&self, region: MemRegion) -> Result<MemHandle> {
        let handle = self.fabric.mem_register(self.endpoint, region)?;
        let desc = self.fabric.mem_export(self.endpoint, handle)?;
        self.share_handles.lock().insert(
            handle.0,
            ShareHandleInfo {
                origin_addr: region.addr,
                len: region.len,
                mem_type: region.mem_type,
                desc,
            },
        );
        Ok(handle)
    }

    pub fn deregister_mem(&self, handle: MemHandle) -> Result<()> {
        self.share_handles.lock().remove(&handle.0);
        self.fabric.mem_unregister(self.endpoint, handle)
    }

    pub fn share_handles(&self) -> Vec<ShareHandleInfo> {
        self.share_handles.lock().values().cloned().collect()
    }

    pub fn share_handle_count(&self) -> usize {
        self.share_handles.lock().len()
    }

    /// Maps a peer's exported spans into the local address space.
    pub fn import_mem(&self, share_infos: &[ShareHandleInfo]) -> Result<()> {
        let mut imported = self.imported.lock();
        for info in share_infos {
            let region = self.fabric.mem_import(self.endpoint, &info.desc)?;
            imported.insert(
                info.origin_addr,
                ImportedSpan {
                    local_addr: region.addr,
                    len: region.len,
                },
            );
        }
        Ok(())
    }

    pub fn unimport_all(&self) {
        let mut imported = self.imported.lock();
        for (origin, span) in imported.drain() {
            let _ = self.fabric.mem_unimport(self.endpoint, span.local_addr);
            debug!(origin, "unimported remote span");
        }
    }

    /// Synchronous batched transfer. Every descriptor's remote range must
    /// fall inside a single imported span.
    pub fn transfer(
        &self,
        channel_id: &str,
        op: TransferOp,
        descs: &[TransferOpDesc],
        timeout: Duration,
    ) -> Result<()> {
        if descs.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let streams = self.acquire_streams(descs.len(), deadline)?;
        let posted = self.post_copies(&streams, op, descs);
        if let Err(e) = posted {
            self.release_streams(&streams);
            return Err(e);
        }
        let mut result = Ok(());
        for &stream in &streams {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                result = Err(Status::Timeout);
            } else if let Err(e) = self.runtime.stream_synchronize(stream, remaining) {
                result = Err(e);
            }
        }
        match &result {
            Ok(()) => self.release_streams(&streams),
            Err(_) => {
                // In-flight work is fenced off by aborting the streams.
                for &stream in &streams {
                    self.streams.destroy_stream(stream);
                }
            }
        }
        debug!(channel_id, descs = descs.len(), ok = result.is_ok(), "fabric transfer done");
        result
    }

    /// Posts the batch and records one completion event per stream. The
    /// request is bound to the channel so `remove_channel` can cancel it.
    pub fn transfer_async(
        &self,
        channel_id: &str,
        op: TransferOp,
        descs: &[TransferOpDesc],
    ) -> Result<TransferReq> {
        let deadline = Instant::now() + STREAM_ACQUIRE_RETRY;
        let streams = self.acquire_streams(descs.len(), deadline)?;
        if let Err(e) = self.post_copies(&streams, op, descs) {
            self.release_streams(&streams);
            return Err(e);
        }
        let mut resources = Vec::with_capacity(streams.len());
        for &stream in &streams {
            let event = match self.runtime.event_create() {
                Ok(event) => event,
                Err(e) => {
                    // Unwind without leaking events or streams.
                    for (_, event) in &resources {
                        let _ = self.runtime.event_destroy(*event);
                    }
                    self.release_streams(&streams);
                    error!(%e, "event create failed, async transfer torn down");
                    return Err(Status::Failed("event create failed".into()));
                }
            };
            if let Err(e) = self.runtime.event_record(event, stream) {
                let _ = self.runtime.event_destroy(event);
                for (_, event) in &resources {
                    let _ = self.runtime.event_destroy(*event);
                }
                self.release_streams(&streams);
                return Err(e);
            }
            resources.push((stream, event));
        }
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        self.async_records.lock().insert(
            req_id,
            AsyncRecord {
                channel_id: channel_id.to_string(),
                resources,
            },
        );
        self.channel_reqs
            .lock()
            .entry(channel_id.to_string())
            .or_default()
            .insert(req_id);
        Ok(TransferReq { req_id })
    }

    /// Queries a previously posted async request. Completed and failed
    /// records are reclaimed by this call.
    pub fn get_transfer_status(&self, req: &TransferReq) -> TransferState {
        let mut failed = false;
        let mut all_recorded = true;
        {
            let records = self.async_records.lock();
            let Some(record) = records.get(&req.req_id) else {
                return TransferState::NotFound;
            };
            for (_, event) in &record.resources {
                match self.runtime.event_query(*event) {
                    Ok(EventStatus::Recorded) => {}
                    Ok(EventStatus::NotReady) => all_recorded = false,
                    Err(_) => failed = true,
                }
            }
        }
        if failed {
            self.teardown_record(req.req_id, true);
            TransferState::Failed
        } else if all_recorded {
            self.teardown_record(req.req_id, false);
            TransferState::Completed
        } else {
            TransferState::Waiting
        }
    }

    /// Cancels every async request bound to a channel. Their streams are
    /// aborted, so outstanding copies never land after the channel is gone.
    pub fn remove_channel(&self, channel_id: &str) {
        let req_ids: Vec<u64> = self
            .channel_reqs
            .lock()
            .remove(channel_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for req_id in req_ids {
            self.teardown_record(req_id, true);
        }
    }

    fn teardown_record(&self, req_id: u64, abort: bool) {
        let record = self.async_records.lock().remove(&req_id);
        let Some(record) = record else { return };
        for (stream, event) in &record.resources {
            let _ = self.runtime.event_destroy(*event);
            if abort {
                self.streams.destroy_stream(*stream);
            } else {
                self.streams.free_stream(*stream);
            }
        }
        if let Some(set) = self.channel_reqs.lock().get_mut(&record.channel_id) {
            set.remove(&req_id);
        }
    }

    fn acquire_streams(&self, desc_count: usize, deadline: Instant) -> Result<Vec<StreamHandle>> {
        let wanted = desc_count.clamp(1, STREAMS_PER_BATCH);
        let mut streams = Vec::with_capacity(wanted);
        while streams.len() < wanted {
            match self.streams.try_alloc_stream() {
                Ok(stream) => streams.push(stream),
                Err(Status::ResourceExhausted(_)) if !streams.is_empty() => break,
                Err(Status::ResourceExhausted(e)) => {
                    if Instant::now() >= deadline {
                        return Err(Status::ResourceExhausted(e));
                    }
                    std::thread::sleep(STREAM_ACQUIRE_RETRY);
                }
                Err(e) => {
                    self.release_streams(&streams);
                    return Err(e);
                }
            }
        }
        Ok(streams)
    }

    fn release_streams(&self, streams: &[StreamHandle]) {
        for &stream in streams {
            self.streams.free_stream(stream);
        }
    }

    fn post_copies(
        &self,
        streams: &[StreamHandle],
        op: TransferOp,
        descs: &[TransferOpDesc],
    ) -> Result<()> {
        for (i, desc) in descs.iter().enumerate() {
            self.validate_local(desc.local_addr, desc.len)?;
            let mapped_remote = self.trans_op_addr(desc.remote_addr, desc.len)?;
            let stream = streams[i % streams.len()];
            let (dst, src) = match op {
                TransferOp::Read => (desc.local_addr, mapped_remote),
                TransferOp::Write => (mapped_remote, desc.local_addr),
            };
            self.runtime
                .memcpy_async(stream, dst, src, desc.len, MemcpyKind::D2D)?;
        }
        Ok(())
    }

    /// Remaps a remote virtual address into the locally visible one.
    fn trans_op_addr(&self, remote_addr: MemAddr, len: u64) -> Result<MemAddr> {
        let imported = self.imported.lock();
        for (&origin, span) in imported.iter() {
            if remote_addr >= origin && remote_addr + len <= origin + span.len {
                return Ok(span.local_addr + (remote_addr - origin));
            }
        }
        Err(Status::ParamInvalid(format!(
            "remote range {remote_addr:#x}+{len} is not inside an imported span"
        )))
    }

    fn validate_local(&self, local_addr: MemAddr, len: u64) -> Result<()> {
        let handles = self.share_handles.lock();
        let covered = handles
            .values()
            .any(|h| local_addr >= h.origin_addr && local_addr + len <= h.origin_addr + h.len);
        if covered {
            Ok(())
        } else {
            Err(Status::ParamInvalid(format!(
                "local range {local_addr:#x}+{len} is not inside a registered span"
            )))
        }
    }
}
