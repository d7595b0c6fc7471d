// Channel lifecycle and the two long-running threads behind it: a mio poll
// loop that drains control sockets through each channel's framer, and a
// heartbeat loop that keeps client channels alive and sweeps channels whose
// eviction was deferred by in-flight transfers.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::net::TcpStream as MioStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::channel::channel::{Channel, ChannelType};
use crate::channel::message::{decode_control, BufferReq, BufferResp, ControlMessage};
use crate::{Result, Status};

const WAKER_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const RECV_CHUNK: usize = 4096;
const MAX_EVENTS: usize = 1024;
/// Budget for one heartbeat frame.
const HEARTBEAT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub type ChannelKey = (ChannelType, String);
pub type BufferReqSink = Sender<(Arc<Channel>, BufferReq)>;
pub type BufferRespSink = Sender<(Arc<Channel>, BufferResp)>;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub heartbeat_interval: Duration,
    pub high_water: Option<usize>,
    pub low_water: Option<usize>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            high_water: None,
            low_water: None,
        }
    }
}

enum PollCmd {
    Add {
        token: Token,
        stream: MioStream,
        channel: Arc<Channel>,
    },
    Remove {
        token: Token,
    },
    Stop,
}

struct Shared {
    config: ManagerConfig,
    stop: AtomicBool,
    channels: Mutex<HashMap<ChannelKey, Arc<Channel>>>,
    cmd_tx: Sender<PollCmd>,
    waker: Waker,
    token_seq: AtomicUsize,
    hb_lock: Mutex<()>,
    hb_cv: Condvar,
    req_sink: BufferReqSink,
    resp_sink: BufferRespSink,
    on_destroy: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl Shared {
    fn channels_of_type(&self, channel_type: ChannelType) -> Vec<Arc<Channel>> {
        self.channels
            .lock()
            .iter()
            .filter(|((t, _), _)| *t == channel_type)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Removes and finalizes a channel. Deferred when transfers are still
    /// in flight: the channel is only marked disconnecting and a later
    /// sweep completes the destruction once its counter returns to zero.
    fn destroy_channel(&self, channel_type: ChannelType, channel_id: &str) -> Result<()> {
        let channel = {
            let mut channels = self.channels.lock();
            let key = (channel_type, channel_id.to_string());
            match channels.get(&key) {
                None => return Ok(()),
                Some(channel) if channel.in_flight() > 0 => {
                    channel.set_disconnecting();
                    info!(channel = channel_id, "destroy deferred, transfers in flight");
                    return Ok(());
                }
                Some(_) => channels.remove(&key).unwrap(),
            }
        };
        let token = channel.token.load(Ordering::Acquire);
        if token != usize::MAX {
            let _ = self.cmd_tx.send(PollCmd::Remove {
                token: Token(token),
            });
            let _ = self.waker.wake();
        }
        let result = channel.finalize();
        if let Some(cb) = self.on_destroy.lock().as_ref() {
            cb(channel_id);
        }
        info!(channel = channel_id, ?channel_type, "channel destroyed");
        result
    }

    /// Completes deferred destructions whose transfer counters drained.
    fn sweep_disconnecting(&self) {
        let pending: Vec<ChannelKey> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, c)| c.is_disconnecting() && c.in_flight() == 0)
            .map(|(k, _)| k.clone())
            .collect();
        for (channel_type, channel_id) in pending {
            let _ = self.destroy_channel(channel_type, &channel_id);
        }
    }

    fn check_heartbeat_timeouts(&self) {
        let timed_out: Vec<String> = self
            .channels_of_type(ChannelType::Server)
            .into_iter()
            .filter(|c| c.is_heartbeat_timeout())
            .map(|c| c.channel_id().to_string())
            .collect();
        for channel_id in timed_out {
            info!(channel = %channel_id, "destroying heartbeat-timeout channel");
            let _ = self.destroy_channel(ChannelType::Server, &channel_id);
        }
    }

    fn send_heartbeats(&self) {
        for channel in self.channels_of_type(ChannelType::Client) {
            let deadline = Instant::now() + HEARTBEAT_SEND_TIMEOUT;
            if let Err(e) = channel.send_heartbeat(deadline) {
                warn!(channel = channel.channel_id(), %e, "heartbeat send failed");
            }
        }
    }

    /// Evicts idle channels down to the low-water mark once the channel
    /// count crosses the high-water mark. Channels that never transferred
    /// go first; channels with in-flight transfers or already disconnecting
    /// are skipped.
    fn maybe_evict(&self) {
        let (Some(high), Some(low)) = (self.config.high_water, self.config.low_water) else {
            return;
        };
        self.sweep_disconnecting();
        let count = self.channels.lock().len();
        if count <= high {
            return;
        }
        let mut candidates: Vec<(ChannelKey, bool)> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, c)| c.in_flight() == 0 && !c.is_disconnecting())
            .map(|(k, c)| (k.clone(), c.has_transferred()))
            .collect();
        // Never-transferred channels first.
        candidates.sort_by_key(|(_, has_transferred)| *has_transferred);
        let need = count.saturating_sub(low);
        info!(count, high, low, need, "channel eviction triggered");
        for ((channel_type, channel_id), _) in candidates.into_iter().take(need) {
            let _ = self.destroy_channel(channel_type, &channel_id);
        }
    }

    fn dispatch(&self, channel: &Arc<Channel>, message: ControlMessage) {
        match message {
            ControlMessage::Heartbeat(_) => {
                debug!(channel = channel.channel_id(), "heartbeat received");
                channel.update_heartbeat_time();
            }
            ControlMessage::BufferReq(req) => {
                debug!(channel = channel.channel_id(), req_id = req.req_id, "buffer req received");
                if self.req_sink.send((channel.clone(), req)).is_err() {
                    warn!("buffer request queue is gone, message dropped");
                }
            }
            ControlMessage::BufferResp(resp) => {
                debug!(channel = channel.channel_id(), req_id = resp.req_id, "buffer resp received");
                if self.resp_sink.send((channel.clone(), resp)).is_err() {
                    warn!("buffer response queue is gone, message dropped");
                }
            }
            ControlMessage::Unknown(msg_type) => {
                warn!(msg_type, "unsupported control message type ignored");
            }
        }
    }
}

pub struct ChannelManager {
    shared: Arc<Shared>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
    heartbeat_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelManager {
    pub fn new(
        config: ManagerConfig,
        req_sink: BufferReqSink,
        resp_sink: BufferRespSink,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (cmd_tx, cmd_rx) = unbounded();
        let shared = Arc::new(Shared {
            config,
            stop: AtomicBool::new(false),
            channels: Mutex::new(HashMap::new()),
            cmd_tx,
            waker,
            token_seq: AtomicUsize::new(1),
            hb_lock: Mutex::new(()),
            hb_cv: Condvar::new(),
            req_sink,
            resp_sink,
            on_destroy: Mutex::new(None),
        });

        let poll_shared = shared.clone();
        let poll_thread = thread::Builder::new()
            .name("kvlink_chan_recv".into())
            .spawn(move || poll_loop(poll_shared, poll, cmd_rx))
            .map_err(|e| Status::Failed(format!("spawn receive thread: {e}")))?;

        let hb_shared = shared.clone();
        let heartbeat_thread = thread::Builder::new()
            .name("kvlink_heartbeat".into())
            .spawn(move || heartbeat_loop(hb_shared))
            .map_err(|e| Status::Failed(format!("spawn heartbeat thread: {e}")))?;

        Ok(Self {
            shared,
            poll_thread: Mutex::new(Some(poll_thread)),
            heartbeat_thread: Mutex::new(Some(heartbeat_thread)),
        })
    }

    /// Invoked with the channel id after a channel is torn down; the engine
    /// uses this to cancel async transfer requests bound to it.
    pub fn set_on_destroy(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.shared.on_destroy.lock() = Some(Box::new(callback));
    }

    /// Registers a fully constructed channel. `reader` must be another
    /// handle to the channel's control socket; it joins the poll loop.
    /// Exactly one channel may exist per (type, id).
    pub fn create_channel(
        &self,
        channel: Channel,
        reader: std::net::TcpStream,
    ) -> Result<Arc<Channel>> {
        reader.set_nonblocking(true)?;
        let key = (channel.channel_type(), channel.channel_id().to_string());
        let channel = Arc::new(channel);
        {
            let mut channels = self.shared.channels.lock();
            if channels.contains_key(&key) {
                return Err(Status::AlreadyConnected);
            }
            channels.insert(key.clone(), channel.clone());
        }
        let token = Token(self.shared.token_seq.fetch_add(1, Ordering::Relaxed));
        channel.token.store(token.0, Ordering::Release);
        let stream = MioStream::from_std(reader);
        self.shared
            .cmd_tx
            .send(PollCmd::Add {
                token,
                stream,
                channel: channel.clone(),
            })
            .map_err(|_| Status::Failed("receive loop is gone".into()))?;
        self.shared.waker.wake()?;
        info!(
            channel = channel.channel_id(),
            channel_type = ?channel.channel_type(),
            "channel created"
        );
        self.shared.maybe_evict();
        Ok(channel)
    }

    pub fn get_channel(&self, channel_type: ChannelType, channel_id: &str) -> Option<Arc<Channel>> {
        self.shared
            .channels
            .lock()
            .get(&(channel_type, channel_id.to_string()))
            .cloned()
    }

    pub fn destroy_channel(&self, channel_type: ChannelType, channel_id: &str) -> Result<()> {
        self.shared.destroy_channel(channel_type, channel_id)
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().len()
    }

    pub fn client_channels(&self) -> Vec<Arc<Channel>> {
        self.shared.channels_of_type(ChannelType::Client)
    }

    pub fn server_channels(&self) -> Vec<Arc<Channel>> {
        self.shared.channels_of_type(ChannelType::Server)
    }

    /// Stops both threads, joins them, then finalizes every channel.
    pub fn finalize(&self) -> Result<()> {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            // Pairs with the stop check the heartbeat loop makes under this
            // lock, so the notification cannot be lost between its check
            // and its wait.
            let _guard = self.shared.hb_lock.lock();
            self.shared.hb_cv.notify_all();
        }
        let _ = self.shared.cmd_tx.send(PollCmd::Stop);
        let _ = self.shared.waker.wake();
        if let Some(handle) = self.poll_thread.lock().take() {
            if handle.join().is_err() {
                error!("receive thread panicked");
            }
        }
        if let Some(handle) = self.heartbeat_thread.lock().take() {
            if handle.join().is_err() {
                error!("heartbeat thread panicked");
            }
        }
        let channels: Vec<Arc<Channel>> = self.shared.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            let _ = channel.finalize();
        }
        Ok(())
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

fn heartbeat_loop(shared: Arc<Shared>) {
    loop {
        {
            let mut guard = shared.hb_lock.lock();
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            shared
                .hb_cv
                .wait_for(&mut guard, shared.config.heartbeat_interval);
        }
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        shared.send_heartbeats();
        shared.sweep_disconnecting();
    }
}

fn poll_loop(shared: Arc<Shared>, mut poll: Poll, cmd_rx: Receiver<PollCmd>) {
    let mut events = Events::with_capacity(MAX_EVENTS);
    let mut conns: HashMap<Token, (MioStream, Arc<Channel>)> = HashMap::new();
    loop {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(%e, "poll failed, receive loop exiting");
            return;
        }

        // Registry changes arrive through the command queue.
        let mut stop = false;
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                PollCmd::Add {
                    token,
                    mut stream,
                    channel,
                } => {
                    if let Err(e) =
                        poll.registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        error!(%e, channel = channel.channel_id(), "register failed");
                        continue;
                    }
                    conns.insert(token, (stream, channel));
                }
                PollCmd::Remove { token } => {
                    if let Some((mut stream, _)) = conns.remove(&token) {
                        let _ = poll.registry().deregister(&mut stream);
                    }
                }
                PollCmd::Stop => stop = true,
            }
        }
        if stop || shared.stop.load(Ordering::Acquire) {
            for (_, (mut stream, _)) in conns.drain() {
                let _ = poll.registry().deregister(&mut stream);
            }
            return;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let closed = match conns.get_mut(&token) {
                Some((stream, channel)) => handle_readable(&shared, stream, channel),
                None => continue,
            };
            if closed {
                if let Some((mut stream, channel)) = conns.remove(&token) {
                    let _ = poll.registry().deregister(&mut stream);
                    let _ = shared
                        .destroy_channel(channel.channel_type(), channel.channel_id());
                }
            }
        }

        shared.check_heartbeat_timeouts();
    }
}

/// Reads everything currently available on the socket into the channel's
/// framer and dispatches decoded messages. Returns true when the channel
/// must be torn down.
fn handle_readable(shared: &Shared, stream: &mut MioStream, channel: &Arc<Channel>) -> bool {
    let mut chunk = [0u8; RECV_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => {
                info!(channel = channel.channel_id(), "connection closed by peer");
                return true;
            }
            Ok(n) => {
                let mut framer = channel.framer().lock();
                framer.extend(&chunk[..n]);
                loop {
                    match framer.next_frame() {
                        Ok(Some(frame)) => match decode_control(&frame) {
                            Ok(message) => shared.dispatch(channel, message),
                            Err(e) => {
                                warn!(channel = channel.channel_id(), %e, "undecodable control message dropped");
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            error!(channel = channel.channel_id(), %e, "framing error");
                            return true;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(channel = channel.channel_id(), %e, "recv error");
                return true;
            }
        }
    }
}
