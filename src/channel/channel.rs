// One peer endpoint: the control socket's write half, the fabric channel
// for one-sided data, the transfer mutex serialising control-plane work,
// and the receive-side framing state driven by the manager's poll thread.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::channel::message::{self, ControlMsgType, Framer};
use crate::fabric::{Fabric, FabricChannelHandle};
use crate::transfer::{TransferOp, TransferOpDesc};
use crate::{Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelType {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub channel_type: ChannelType,
    pub channel_id: String,
    pub local_rank_id: u32,
    pub peer_rank_id: u32,
}

/// Decrements the in-flight counter when the transfer finishes.
pub struct TransferGuard<'a> {
    channel: &'a Channel,
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.channel.transfer_count.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Channel {
    info: ChannelInfo,
    writer: Mutex<Option<TcpStream>>,
    fabric: Arc<dyn Fabric>,
    fabric_channel: Mutex<Option<FabricChannelHandle>>,
    transfer_mutex: Mutex<()>,
    framer: Mutex<Framer>,
    last_heartbeat: Mutex<Instant>,
    heartbeat_timeout: Duration,
    transfer_count: AtomicU32,
    has_transferred: AtomicBool,
    disconnecting: AtomicBool,
    /// Poll-registry token once the read half is registered.
    pub(crate) token: AtomicUsize,
}

impl Channel {
    pub fn new(
        info: ChannelInfo,
        writer: TcpStream,
        fabric: Arc<dyn Fabric>,
        fabric_channel: FabricChannelHandle,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            info,
            writer: Mutex::new(Some(writer)),
            fabric,
            fabric_channel: Mutex::new(Some(fabric_channel)),
            transfer_mutex: Mutex::new(()),
            framer: Mutex::new(Framer::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            heartbeat_timeout,
            transfer_count: AtomicU32::new(0),
            has_transferred: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            token: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.info.channel_id
    }

    pub fn channel_type(&self) -> ChannelType {
        self.info.channel_type
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    /// Marks a transfer in flight for the guard's lifetime.
    pub fn begin_transfer(&self) -> TransferGuard<'_> {
        self.transfer_count.fetch_add(1, Ordering::AcqRel);
        self.has_transferred.store(true, Ordering::Release);
        TransferGuard { channel: self }
    }

    pub fn in_flight(&self) -> u32 {
        self.transfer_count.load(Ordering::Acquire)
    }

    pub fn has_transferred(&self) -> bool {
        self.has_transferred.load(Ordering::Acquire)
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    pub fn set_disconnecting(&self) {
        self.disconnecting.store(true, Ordering::Release);
    }

    /// Posts a batch of one-sided operations and waits for the fence.
    /// Control-plane work is already serialised by `send_control_msg`; the
    /// data-plane posting here is mutex-free.
    pub fn transfer_sync(
        &self,
        op: TransferOp,
        descs: &[TransferOpDesc],
        timeout: Duration,
    ) -> Result<()> {
        let fabric_channel = (*self.fabric_channel.lock()).ok_or(Status::NotConnected)?;
        let _guard = self.begin_transfer();
        let deadline = Instant::now() + timeout;
        for desc in descs {
            match op {
                TransferOp::Read => self.fabric.read_nbi(
                    fabric_channel,
                    desc.local_addr,
                    desc.remote_addr,
                    desc.len,
                )?,
                TransferOp::Write => self.fabric.write_nbi(
                    fabric_channel,
                    desc.remote_addr,
                    desc.local_addr,
                    desc.len,
                )?,
            }
            if Instant::now() >= deadline {
                return Err(Status::Timeout);
            }
        }
        self.fabric.fence(fabric_channel)
    }

    /// One one-sided write outside a batch (flag toggles).
    pub fn write_remote(&self, remote_dst: u64, local_src: u64, len: u64) -> Result<()> {
        let fabric_channel = (*self.fabric_channel.lock()).ok_or(Status::NotConnected)?;
        self.fabric
            .write_nbi(fabric_channel, remote_dst, local_src, len)?;
        self.fabric.fence(fabric_channel)
    }

    /// Serialises a control message onto the socket under the transfer
    /// mutex and a deadline.
    pub fn send_control_msg<T: Serialize>(
        &self,
        msg_type: ControlMsgType,
        msg: &T,
        deadline: Instant,
    ) -> Result<()> {
        let _serialised = self.transfer_mutex.lock();
        let mut writer = self.writer.lock();
        let stream = writer.as_mut().ok_or(Status::NotConnected)?;
        message::send_msg(stream, msg_type, msg, deadline)
    }

    pub fn send_heartbeat(&self, deadline: Instant) -> Result<()> {
        debug!(channel = self.channel_id(), "sending heartbeat");
        self.send_control_msg(
            ControlMsgType::HeartBeat,
            &message::HeartbeatMsg::default(),
            deadline,
        )
    }

    pub fn update_heartbeat_time(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn is_heartbeat_timeout(&self) -> bool {
        self.last_heartbeat.lock().elapsed() > self.heartbeat_timeout
    }

    pub(crate) fn framer(&self) -> &Mutex<Framer> {
        &self.framer
    }

    /// Aborts the fabric channel, closes the socket and leaves the channel
    /// unusable. Idempotent.
    pub fn finalize(&self) -> Result<()> {
        self.set_disconnecting();
        if let Some(fabric_channel) = self.fabric_channel.lock().take() {
            if let Err(e) = self.fabric.channel_destroy(fabric_channel) {
                warn!(channel = self.channel_id(), %e, "fabric channel destroy failed");
            }
        }
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("channel_id", &self.info.channel_id)
            .field("channel_type", &self.info.channel_type)
            .field("in_flight", &self.in_flight())
            .field("disconnecting", &self.is_disconnecting())
            .finish()
    }
}
