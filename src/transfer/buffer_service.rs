// Staged transfers across placements. When the fabric cannot address the
// destination directly (device source feeding a host destination, or the
// reverse), data moves through bounded staging buffers under a two-phase
// producer/consumer protocol: the responder fills a buffer and announces it,
// the requester consumes it with one-sided reads and toggles the buffer's
// flag so the responder may refill it. Push flows invert the roles with a
// second-step copy on the responder.
//
// Four worker threads drain four queues: fresh requests, responses,
// second-step requests and control messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::channel::channel::Channel;
use crate::channel::message::{BufferReq, BufferResp, ControlMsgType, ReqPhase, TransferType};
use crate::common::types::MemAddr;
use crate::memory::buf_pool::{StagingBuffer, StagingPool};
use crate::runtime::{DeviceRuntime, MemcpyKind};
use crate::transfer::sync_flag::SyncFlag;
use crate::transfer::{TransferOp, TransferOpDesc};
use crate::{Result, Status};

/// Shaved off every wire deadline so the local side can clean up before the
/// peer gives up.
const TIMEOUT_SAFETY_MARGIN: Duration = Duration::from_micros(500);
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);
const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(1);
/// How many staging buffers one pull request may hold at once.
const BUFFERS_PER_REQUEST: usize = 2;

/// One round: the slice of a request that fits into one staging buffer.
#[derive(Debug, Clone)]
struct Round {
    /// (cache address, length) pairs served this round, in request order.
    entries: Vec<(MemAddr, u64)>,
}

impl Round {
    fn lens(&self) -> Vec<u64> {
        self.entries.iter().map(|&(_, len)| len).collect()
    }

    fn bytes(&self) -> u64 {
        self.entries.iter().map(|&(_, len)| len).sum()
    }
}

/// Requester-side state for one in-flight staged transfer.
struct PendingTransfer {
    transfer_type: TransferType,
    /// Local final spans, consumed in order as rounds arrive.
    local_spans: Vec<(MemAddr, u64)>,
    /// (span index, byte offset inside that span).
    cursor: (usize, u64),
    consumed: u64,
    total: u64,
    channel: Arc<Channel>,
    deadline: Instant,
    done_tx: Sender<Result<()>>,
}

/// Responder-side state for a push request awaiting second-step copies.
struct ServerSession {
    rounds: Vec<Round>,
    next_round: usize,
    buffer: StagingBuffer,
    pool: Arc<StagingPool>,
    copy_kind: MemcpyKind,
    deadline: Instant,
}

pub struct BufferTransferService {
    runtime: Arc<dyn DeviceRuntime>,
    pools: Vec<Arc<StagingPool>>,
    signal_src: MemAddr,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Mutex<HashMap<u64, PendingTransfer>>>,
    sessions: Arc<Mutex<HashMap<u64, ServerSession>>>,
    next_req_id: AtomicU64,
    second_step_tx: Sender<(Arc<Channel>, BufferReq)>,
    ctrl_tx: Sender<(Arc<Channel>, BufferReq)>,
}

impl BufferTransferService {
    /// Wires the service to the channel manager's two sinks and starts the
    /// four workers. `signal_src` must be a fabric-registered byte holding
    /// the value 1; it is the source of every one-sided flag write.
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        pools: Vec<Arc<StagingPool>>,
        signal_src: MemAddr,
        req_rx: Receiver<(Arc<Channel>, BufferReq)>,
        resp_rx: Receiver<(Arc<Channel>, BufferResp)>,
    ) -> Result<Self> {
        if pools.is_empty() {
            return Err(Status::ParamInvalid("no staging pools configured".into()));
        }
        let (second_step_tx, second_step_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let service = Self {
            runtime,
            pools,
            signal_src,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_req_id: AtomicU64::new(1),
            second_step_tx,
            ctrl_tx,
        };
        service.spawn_workers(req_rx, resp_rx, second_step_rx, ctrl_rx)?;
        Ok(service)
    }

    /// Requester entry point: runs one staged transfer for a batch of
    /// descriptors and blocks until the peer served it or the deadline hit.
    /// For read types `remote_addr` is the peer cache source and
    /// `local_addr` the final destination; write types invert that.
    pub fn transfer(
        &self,
        channel: &Arc<Channel>,
        transfer_type: TransferType,
        op_descs: &[TransferOpDesc],
        timeout: Duration,
    ) -> Result<()> {
        if op_descs.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout.saturating_sub(TIMEOUT_SAFETY_MARGIN);
        let total: u64 = op_descs.iter().map(|d| d.len).sum();
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = bounded(1);

        let remote_spans: Vec<u64> = op_descs.iter().map(|d| d.remote_addr).collect();
        let lens: Vec<u64> = op_descs.iter().map(|d| d.len).collect();
        let local_spans: Vec<(MemAddr, u64)> =
            op_descs.iter().map(|d| (d.local_addr, d.len)).collect();

        self.pending.lock().insert(
            req_id,
            PendingTransfer {
                transfer_type,
                local_spans,
                cursor: (0, 0),
                consumed: 0,
                total,
                channel: channel.clone(),
                deadline,
                done_tx,
            },
        );

        let is_read = is_read_type(transfer_type);
        let req = BufferReq {
            transfer_type,
            phase: ReqPhase::First,
            req_id,
            timeout: timeout.as_micros() as u64,
            src_addrs: if is_read { remote_spans.clone() } else { Vec::new() },
            buffer_addr: 0,
            flag_addr: 0,
            dst_addrs: if is_read { Vec::new() } else { remote_spans },
            buffer_lens: lens,
            total_buffer_len: total,
            local_buffer_addr: 0,
        };
        let _guard = channel.begin_transfer();
        let sent = channel.send_control_msg(
            ControlMsgType::BufferReq,
            &req,
            Instant::now() + CONTROL_SEND_TIMEOUT.min(timeout),
        );
        if let Err(e) = sent {
            self.pending.lock().remove(&req_id);
            return Err(e);
        }

        match done_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(result) => result,
            Err(_) => {
                self.pending.lock().remove(&req_id);
                // Best effort: let the peer drop its session early.
                let cancel = ctrl_msg(transfer_type, req_id);
                let _ = channel.send_control_msg(
                    ControlMsgType::BufferReq,
                    &cancel,
                    Instant::now() + CONTROL_SEND_TIMEOUT,
                );
                warn!(req_id, "staged transfer timed out");
                Err(Status::Timeout)
            }
        }
    }

    pub fn finalize(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                error!("buffer service worker panicked");
            }
        }
        // Unblock whoever was still waiting.
        let pending: Vec<PendingTransfer> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for p in pending {
            let _ = p
                .done_tx
                .send(Err(Status::Failed("service finalized".into())));
        }
        let mut sessions = self.sessions.lock();
        for (_, session) in sessions.drain() {
            session.pool.release(&session.buffer);
        }
    }

    fn spawn_workers(
        &self,
        req_rx: Receiver<(Arc<Channel>, BufferReq)>,
        resp_rx: Receiver<(Arc<Channel>, BufferResp)>,
        second_step_rx: Receiver<(Arc<Channel>, BufferReq)>,
        ctrl_rx: Receiver<(Arc<Channel>, BufferReq)>,
    ) -> Result<()> {
        let mut workers = self.workers.lock();
        workers.push(self.spawn_worker("kvlink_buf_req", req_rx, {
            let ctx = self.worker_ctx();
            move |channel, req: BufferReq| match req.phase {
                ReqPhase::First => ctx.handle_first_step(&channel, req),
                ReqPhase::Second => {
                    let _ = ctx.second_step_tx.send((channel, req));
                }
                ReqPhase::Ctrl => {
                    let _ = ctx.ctrl_tx.send((channel, req));
                }
            }
        })?);
        workers.push(self.spawn_worker("kvlink_buf_resp", resp_rx, {
            let ctx = self.worker_ctx();
            move |channel, resp: BufferResp| ctx.handle_resp(&channel, resp)
        })?);
        workers.push(self.spawn_worker("kvlink_buf_step2", second_step_rx, {
            let ctx = self.worker_ctx();
            move |channel, req: BufferReq| ctx.handle_second_step(&channel, req)
        })?);
        workers.push(self.spawn_worker("kvlink_buf_ctrl", ctrl_rx, {
            let ctx = self.worker_ctx();
            move |_channel, req: BufferReq| ctx.handle_ctrl(req)
        })?);
        Ok(())
    }

    fn spawn_worker<T: Send + 'static>(
        &self,
        name: &str,
        rx: Receiver<(Arc<Channel>, T)>,
        handler: impl Fn(Arc<Channel>, T) + Send + 'static,
    ) -> Result<JoinHandle<()>> {
        let stop = self.stop.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    match rx.recv_timeout(WORKER_IDLE_WAIT) {
                        Ok((channel, item)) => handler(channel, item),
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .map_err(|e| Status::Failed(format!("spawn {name}: {e}")))
    }

    fn worker_ctx(&self) -> WorkerCtx {
        WorkerCtx {
            runtime: self.runtime.clone(),
            pools: self.pools.clone(),
            signal_src: self.signal_src,
            pending: self.pending.clone(),
            sessions: self.sessions.clone(),
            second_step_tx: self.second_step_tx.clone(),
            ctrl_tx: self.ctrl_tx.clone(),
        }
    }
}

impl Drop for BufferTransferService {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Everything a worker thread needs, cloneable into the thread closure.
#[derive(Clone)]
struct WorkerCtx {
    runtime: Arc<dyn DeviceRuntime>,
    pools: Vec<Arc<StagingPool>>,
    signal_src: MemAddr,
    pending: Arc<Mutex<HashMap<u64, PendingTransfer>>>,
    sessions: Arc<Mutex<HashMap<u64, ServerSession>>>,
    second_step_tx: Sender<(Arc<Channel>, BufferReq)>,
    ctrl_tx: Sender<(Arc<Channel>, BufferReq)>,
}

impl WorkerCtx {
    /// First tier whose block size covers the request's largest entry;
    /// oversized entries fall back to the top tier and fragment.
    fn pick_pool(&self, max_entry: u64) -> Arc<StagingPool> {
        self.pools
            .iter()
            .find(|p| p.block_size() >= max_entry)
            .unwrap_or_else(|| self.pools.last().expect("pools are non-empty"))
            .clone()
    }

    /// Splits `(addr, len)` entries into rounds of at most one buffer each.
    /// Entries larger than the buffer fragment into consecutive rounds.
    fn plan_rounds(entries: &[(MemAddr, u64)], buffer_size: u64) -> Vec<Round> {
        let mut rounds = Vec::new();
        let mut current = Round { entries: Vec::new() };
        let mut used = 0u64;
        for &(addr, len) in entries {
            let mut addr = addr;
            let mut remaining = len;
            while remaining > 0 {
                if used == buffer_size {
                    rounds.push(std::mem::replace(&mut current, Round { entries: Vec::new() }));
                    used = 0;
                }
                let chunk = remaining.min(buffer_size - used);
                current.entries.push((addr, chunk));
                used += chunk;
                addr += chunk;
                remaining -= chunk;
            }
        }
        if !current.entries.is_empty() {
            rounds.push(current);
        }
        rounds
    }

    fn handle_first_step(&self, channel: &Arc<Channel>, req: BufferReq) {
        debug!(req_id = req.req_id, transfer_type = ?req.transfer_type, "first-step request");
        let deadline = deadline_from_micros(req.timeout);
        let result = if is_read_type(req.transfer_type) {
            self.serve_pull(channel, &req, deadline)
        } else {
            self.start_push(channel, &req, deadline)
        };
        if let Err(e) = result {
            warn!(req_id = req.req_id, %e, "first-step handling failed");
            let _ = send_resp(channel, &failure_resp(&req, &e));
        }
    }

    /// Serving side of a pull: stage the local cache into buffers, announce
    /// each round, and wait for the consumer's flag before any refill.
    fn serve_pull(&self, channel: &Arc<Channel>, req: &BufferReq, deadline: Instant) -> Result<()> {
        if req.src_addrs.len() != req.buffer_lens.len() || req.src_addrs.is_empty() {
            return Err(Status::ParamInvalid(
                "pull request addresses and lengths mismatch".into(),
            ));
        }
        let entries: Vec<(MemAddr, u64)> = req
            .src_addrs
            .iter()
            .copied()
            .zip(req.buffer_lens.iter().copied())
            .collect();
        let copy_kind = match req.transfer_type {
            TransferType::ReadRd2H | TransferType::ReadRd2D => MemcpyKind::D2D,
            _ => MemcpyKind::H2D,
        };
        let max_entry = entries.iter().map(|&(_, len)| len).max().unwrap_or(0);
        let pool = self.pick_pool(max_entry);
        let rounds = Self::plan_rounds(&entries, pool.buffer_size());

        let mut buffers: Vec<StagingBuffer> = Vec::new();
        let wanted = rounds.len().min(BUFFERS_PER_REQUEST);
        let acquire = (|| -> Result<()> {
            for _ in 0..wanted {
                let remaining = deadline.saturating_duration_since(Instant::now());
                buffers.push(pool.try_get(remaining)?);
            }
            Ok(())
        })();
        if let Err(e) = acquire {
            for buffer in &buffers {
                pool.release(buffer);
            }
            return Err(e);
        }

        let result = (|| -> Result<()> {
            for (r, round) in rounds.iter().enumerate() {
                let buffer = &buffers[r % buffers.len()];
                if r >= buffers.len() {
                    // Two-phase gate: the consumer must have drained this
                    // buffer's previous round.
                    SyncFlag::new(buffer.flag_addr).wait(Some(deadline))?;
                }
                let mut offset = 0u64;
                for &(addr, len) in &round.entries {
                    self.runtime
                        .memcpy(buffer.addr + offset, addr, len, copy_kind)?;
                    offset += len;
                }
                send_resp(
                    channel,
                    &BufferResp {
                        transfer_type: req.transfer_type,
                        req_id: req.req_id,
                        timeout: req.timeout,
                        ret_code: 0,
                        src_addrs: Vec::new(),
                        buffer_addr: buffer.addr,
                        flag_addr: buffer.flag_addr,
                        buffer_lens: round.lens(),
                    },
                )?;
                debug!(req_id = req.req_id, round = r, bytes = round.bytes(), "pull round announced");
            }
            // Every used buffer has one outstanding round; wait until the
            // consumer drained them before the pool may hand them out again.
            for buffer in buffers.iter().take(rounds.len()) {
                SyncFlag::new(buffer.flag_addr).wait(Some(deadline))?;
            }
            Ok(())
        })();

        for buffer in &buffers {
            pool.release(buffer);
        }
        result
    }

    /// Serving side of a push: allocate staging, announce the first round
    /// and park a session; the copies happen in second-step handling.
    fn start_push(&self, channel: &Arc<Channel>, req: &BufferReq, deadline: Instant) -> Result<()> {
        if req.dst_addrs.len() != req.buffer_lens.len() || req.dst_addrs.is_empty() {
            return Err(Status::ParamInvalid(
                "push request addresses and lengths mismatch".into(),
            ));
        }
        let entries: Vec<(MemAddr, u64)> = req
            .dst_addrs
            .iter()
            .copied()
            .zip(req.buffer_lens.iter().copied())
            .collect();
        let copy_kind = match req.transfer_type {
            TransferType::WriteH2Rd | TransferType::WriteD2Rd => MemcpyKind::D2D,
            _ => MemcpyKind::D2H,
        };
        let max_entry = entries.iter().map(|&(_, len)| len).max().unwrap_or(0);
        let pool = self.pick_pool(max_entry);
        let rounds = Self::plan_rounds(&entries, pool.buffer_size());
        let remaining = deadline.saturating_duration_since(Instant::now());
        let buffer = pool.try_get(remaining)?;

        let first = &rounds[0];
        let announce = BufferResp {
            transfer_type: req.transfer_type,
            req_id: req.req_id,
            timeout: req.timeout,
            ret_code: 0,
            src_addrs: Vec::new(),
            buffer_addr: buffer.addr,
            flag_addr: buffer.flag_addr,
            buffer_lens: first.lens(),
        };
        self.sessions.lock().insert(
            req.req_id,
            ServerSession {
                rounds,
                next_round: 0,
                buffer,
                pool: pool.clone(),
                copy_kind,
                deadline,
            },
        );
        if let Err(e) = send_resp(channel, &announce) {
            self.drop_session(req.req_id);
            return Err(e);
        }
        Ok(())
    }

    /// Requester side: a round was announced. Pulls consume it with
    /// one-sided reads and toggle the flag; pushes fill the offered buffer
    /// and hand back a second-step request.
    fn handle_resp(&self, channel: &Arc<Channel>, resp: BufferResp) {
        if resp.ret_code != 0 {
            let status = Status::from_code(resp.ret_code)
                .unwrap_or_else(|| Status::Failed("peer reported failure".into()));
            self.fail_pending(resp.req_id, status);
            return;
        }
        // Completion marker for push flows.
        if resp.buffer_lens.is_empty() {
            self.complete_pending(resp.req_id);
            return;
        }

        let round_bytes: u64 = resp.buffer_lens.iter().sum();
        let (descs, deadline, is_read, done) = {
            let mut pending = self.pending.lock();
            let Some(p) = pending.get_mut(&resp.req_id) else {
                debug!(req_id = resp.req_id, "response for unknown request ignored");
                return;
            };
            if Instant::now() >= p.deadline {
                drop(pending);
                self.fail_pending(resp.req_id, Status::Timeout);
                return;
            }
            let mut descs = Vec::with_capacity(resp.buffer_lens.len());
            let mut buffer_offset = 0u64;
            for &len in &resp.buffer_lens {
                let (span_idx, span_off) = p.cursor;
                let (span_addr, span_len) = p.local_spans[span_idx];
                debug_assert!(span_off + len <= span_len);
                descs.push(TransferOpDesc {
                    local_addr: span_addr + span_off,
                    remote_addr: resp.buffer_addr + buffer_offset,
                    len,
                });
                buffer_offset += len;
                p.cursor = if span_off + len == span_len {
                    (span_idx + 1, 0)
                } else {
                    (span_idx, span_off + len)
                };
            }
            p.consumed += round_bytes;
            (descs, p.deadline, is_read_type(p.transfer_type), p.consumed >= p.total)
        };

        let io = if is_read {
            let remaining = deadline.saturating_duration_since(Instant::now());
            channel
                .transfer_sync(TransferOp::Read, &descs, remaining)
                .and_then(|_| channel.write_remote(resp.flag_addr, self.signal_src, 1))
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            channel
                .transfer_sync(TransferOp::Write, &descs, remaining)
                .and_then(|_| {
                    let mut follow_up = ctrl_msg(resp.transfer_type, resp.req_id);
                    follow_up.phase = ReqPhase::Second;
                    follow_up.buffer_addr = resp.buffer_addr;
                    follow_up.buffer_lens = resp.buffer_lens.clone();
                    channel.send_control_msg(
                        ControlMsgType::BufferReq,
                        &follow_up,
                        Instant::now() + CONTROL_SEND_TIMEOUT,
                    )
                })
        };
        if let Err(e) = io {
            self.fail_pending(resp.req_id, e);
            return;
        }
        // Pull requests complete once every byte has been consumed; push
        // requests wait for the responder's completion marker.
        if is_read && done {
            self.complete_pending(resp.req_id);
        }
    }

    /// Responder side of a push round: the requester filled the staging
    /// buffer, land it in the cache and announce the next round.
    fn handle_second_step(&self, channel: &Arc<Channel>, req: BufferReq) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(&req.req_id) else {
            warn!(req_id = req.req_id, "second step for unknown session ignored");
            return;
        };
        if Instant::now() >= session.deadline {
            let deadline_err = Status::Timeout;
            drop(sessions);
            self.drop_session(req.req_id);
            let _ = send_resp(channel, &failure_resp(&req, &deadline_err));
            return;
        }
        let round = session.rounds[session.next_round].clone();
        let buffer = session.buffer;
        let copy_kind = session.copy_kind;
        drop(sessions);

        let mut offset = 0u64;
        for &(addr, len) in &round.entries {
            if let Err(e) = self.runtime.memcpy(addr, buffer.addr + offset, len, copy_kind) {
                error!(req_id = req.req_id, %e, "second-step copy failed");
                self.drop_session(req.req_id);
                let _ = send_resp(channel, &failure_resp(&req, &e));
                return;
            }
            offset += len;
        }

        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(&req.req_id) else {
            return;
        };
        session.next_round += 1;
        let next = if session.next_round < session.rounds.len() {
            Some(session.rounds[session.next_round].lens())
        } else {
            None
        };
        let announce = BufferResp {
            transfer_type: req.transfer_type,
            req_id: req.req_id,
            timeout: req.timeout,
            ret_code: 0,
            src_addrs: Vec::new(),
            buffer_addr: buffer.addr,
            flag_addr: buffer.flag_addr,
            buffer_lens: next.clone().unwrap_or_default(),
        };
        drop(sessions);
        if next.is_none() {
            self.drop_session(req.req_id);
        }
        if let Err(e) = send_resp(channel, &announce) {
            warn!(req_id = req.req_id, %e, "push round announcement failed");
            self.drop_session(req.req_id);
        }
    }

    /// Book-keeping messages: currently cancellation/early completion from
    /// the requester, releasing the responder's session.
    fn handle_ctrl(&self, req: BufferReq) {
        debug!(req_id = req.req_id, "ctrl message, dropping session");
        self.drop_session(req.req_id);
    }

    fn drop_session(&self, req_id: u64) {
        if let Some(session) = self.sessions.lock().remove(&req_id) {
            session.pool.release(&session.buffer);
        }
    }

    fn fail_pending(&self, req_id: u64, status: Status) {
        if let Some(p) = self.pending.lock().remove(&req_id) {
            warn!(req_id, %status, channel = p.channel.channel_id(), "staged transfer failed");
            let _ = p.done_tx.send(Err(status));
        }
    }

    fn complete_pending(&self, req_id: u64) {
        if let Some(p) = self.pending.lock().remove(&req_id) {
            debug!(req_id, bytes = p.consumed, "staged transfer complete");
            let _ = p.done_tx.send(Ok(()));
        }
    }
}

fn is_read_type(transfer_type: TransferType) -> bool {
    matches!(
        transfer_type,
        TransferType::ReadRh2H
            | TransferType::ReadRh2D
            | TransferType::ReadRd2H
            | TransferType::ReadRd2D
    )
}

fn deadline_from_micros(timeout_micros: u64) -> Instant {
    Instant::now() + Duration::from_micros(timeout_micros).saturating_sub(TIMEOUT_SAFETY_MARGIN)
}

fn ctrl_msg(transfer_type: TransferType, req_id: u64) -> BufferReq {
    BufferReq {
        transfer_type,
        phase: ReqPhase::Ctrl,
        req_id,
        timeout: CONTROL_SEND_TIMEOUT.as_micros() as u64,
        src_addrs: Vec::new(),
        buffer_addr: 0,
        flag_addr: 0,
        dst_addrs: Vec::new(),
        buffer_lens: Vec::new(),
        total_buffer_len: 0,
        local_buffer_addr: 0,
    }
}

fn failure_resp(req: &BufferReq, status: &Status) -> BufferResp {
    BufferResp {
        transfer_type: req.transfer_type,
        req_id: req.req_id,
        timeout: req.timeout,
        ret_code: status.code(),
        src_addrs: Vec::new(),
        buffer_addr: 0,
        flag_addr: 0,
        buffer_lens: Vec::new(),
    }
}

fn send_resp(channel: &Arc<Channel>, resp: &BufferResp) -> Result<()> {
    channel.send_control_msg(
        ControlMsgType::BufferResp,
        resp,
        Instant::now() + CONTROL_SEND_TIMEOUT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_split_and_pack_entries() {
        let entries = vec![(0x1000u64, 300u64), (0x5000, 300), (0x9000, 1000)];
        let rounds = WorkerCtx::plan_rounds(&entries, 512);
        // 300 + 212 | 88 + 424 | 576 remaining of the 1000-byte entry...
        let total: u64 = rounds.iter().map(|r| r.bytes()).sum();
        assert_eq!(total, 1600);
        assert!(rounds.iter().all(|r| r.bytes() <= 512));
        // Order is preserved across splits.
        let mut flat: Vec<(u64, u64)> = Vec::new();
        for round in &rounds {
            flat.extend(round.entries.iter().copied());
        }
        assert_eq!(flat[0].0, 0x1000);
        assert!(flat.windows(2).all(|w| {
            let ((a, alen), (b, _)) = (w[0], w[1]);
            b == a + alen || b == 0x5000 || b == 0x9000
        }));
    }

    #[test]
    fn single_small_entry_is_one_round() {
        let rounds = WorkerCtx::plan_rounds(&[(0x100, 64)], 4096);
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].entries, vec![(0x100, 64)]);
    }

    #[test]
    fn read_type_classification_matches_direction() {
        assert!(is_read_type(TransferType::ReadRd2H));
        assert!(is_read_type(TransferType::ReadRh2D));
        assert!(!is_read_type(TransferType::WriteD2Rd));
        assert!(!is_read_type(TransferType::WriteH2Rh));
    }
}
