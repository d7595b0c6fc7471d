// Link establishment between clusters. A link merges the two sides' rank
// tables, creates a fabric communicator, exchanges memory share handles and
// cache tables over a framed handshake, and registers the resulting control
// socket as a channel. Links tear down through the same daemon that accepts
// them.

use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::channel::channel::{Channel, ChannelInfo, ChannelType};
use crate::channel::manager::ChannelManager;
use crate::channel::message::{
    self, ControlMsgType, Frame,
};
use crate::common::thread_pool::ThreadPool;
use crate::common::types::{CacheDesc, ClusterInfo, IpInfo, MemAddr};
use crate::fabric::{EndpointHandle, Fabric, ShareHandleInfo};
use crate::link::rank_table::{merge_rank_tables, RankTableInfo};
use crate::transfer::fabric_service::FabricTransferService;
use crate::{Result, Status};

pub const MAX_LINK_CLUSTERS: usize = 64;
const LINK_WORKERS: usize = 16;
const ACCEPT_IDLE_WAIT: Duration = Duration::from_millis(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Preparing,
    Ok,
    Failed,
}

/// One published cache: enough for a peer to address it remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCacheInfo {
    pub cache_id: i64,
    pub tensor_addrs: Vec<MemAddr>,
    pub desc: CacheDesc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinkReqMsg {
    cluster_id: u64,
    channel_id: String,
    rank_table: String,
    share_handles: Vec<ShareHandleInfo>,
    cache_table: Vec<RemoteCacheInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinkRespMsg {
    ret_code: u32,
    cluster_id: u64,
    rank_table: String,
    share_handles: Vec<ShareHandleInfo>,
    cache_table: Vec<RemoteCacheInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnlinkReqMsg {
    cluster_id: u64,
    channel_id: String,
    force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnlinkRespMsg {
    ret_code: u32,
}

#[derive(Debug, Clone)]
struct LinkEntry {
    channel_id: String,
    status: LinkStatus,
    cluster: Option<ClusterInfo>,
}

type LinkKey = (ChannelType, u64);

/// Receives the peer's published caches when a link forms.
pub type CacheTableSink = Box<dyn Fn(u64, Vec<RemoteCacheInfo>) + Send + Sync>;
/// Produces the local caches to publish during a handshake.
pub type CacheTableProvider = Box<dyn Fn() -> Vec<RemoteCacheInfo> + Send + Sync>;

pub struct LinkManagerConfig {
    pub cluster_id: u64,
    pub device_id: i32,
    pub heartbeat_timeout: Duration,
    pub local_rank_table: RankTableInfo,
}

struct Daemon {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    listen: IpInfo,
}

pub struct LinkManager {
    config: LinkManagerConfig,
    fabric: Arc<dyn Fabric>,
    endpoint: EndpointHandle,
    channel_manager: Arc<ChannelManager>,
    fabric_service: Arc<FabricTransferService>,
    links: Mutex<HashMap<LinkKey, LinkEntry>>,
    daemon: Mutex<Option<Daemon>>,
    cache_table_provider: Mutex<Option<CacheTableProvider>>,
    cache_table_sink: Mutex<Option<CacheTableSink>>,
}

impl LinkManager {
    pub fn new(
        config: LinkManagerConfig,
        fabric: Arc<dyn Fabric>,
        endpoint: EndpointHandle,
        channel_manager: Arc<ChannelManager>,
        fabric_service: Arc<FabricTransferService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            fabric,
            endpoint,
            channel_manager,
            fabric_service,
            links: Mutex::new(HashMap::new()),
            daemon: Mutex::new(None),
            cache_table_provider: Mutex::new(None),
            cache_table_sink: Mutex::new(None),
        })
    }

    pub fn set_cache_table_provider(&self, provider: CacheTableProvider) {
        *self.cache_table_provider.lock() = Some(provider);
    }

    pub fn set_cache_table_sink(&self, sink: CacheTableSink) {
        *self.cache_table_sink.lock() = Some(sink);
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Channel id of the client link to `cluster_id`, if one is up.
    pub fn client_channel_id(&self, cluster_id: u64) -> Option<String> {
        self.links
            .lock()
            .get(&(ChannelType::Client, cluster_id))
            .filter(|e| e.status == LinkStatus::Ok)
            .map(|e| e.channel_id.clone())
    }

    /// One transparent re-link attempt for a peer the link table still
    /// holds; used when a transfer finds its channel gone.
    pub fn relink(self: &Arc<Self>, cluster_id: u64, timeout: Duration) -> Result<()> {
        let cluster = {
            let mut links = self.links.lock();
            let entry = links
                .get_mut(&(ChannelType::Client, cluster_id))
                .ok_or(Status::NotYetLink)?;
            entry.status = LinkStatus::Failed;
            entry.cluster.clone().ok_or(Status::NotYetLink)?
        };
        self.link_one(&cluster, timeout)
    }

    /// Public polling surface after an asynchronous link attempt.
    pub fn query_register_mem_status(&self, cluster_id: u64) -> Result<LinkStatus> {
        self.links
            .lock()
            .get(&(ChannelType::Client, cluster_id))
            .map(|e| e.status)
            .ok_or(Status::NotYetLink)
    }

    /// Links every cluster in parallel (up to 16 workers). Returns one
    /// result per cluster, in input order.
    pub fn link_clusters(
        self: &Arc<Self>,
        clusters: &[ClusterInfo],
        timeout: Duration,
    ) -> Result<Vec<Result<()>>> {
        if clusters.is_empty() {
            return Err(Status::ParamInvalid("clusters must not be empty".into()));
        }
        if clusters.len() > MAX_LINK_CLUSTERS {
            return Err(Status::ClusterNumExceedLimit(clusters.len()));
        }
        let pool = ThreadPool::new("kvlink_link", LINK_WORKERS.min(clusters.len()));
        let handles: Vec<_> = clusters
            .iter()
            .map(|cluster| {
                let manager = self.clone();
                let cluster = cluster.clone();
                pool.commit(move || manager.link_one(&cluster, timeout))
            })
            .collect();
        Ok(handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(Status::LinkFailed("worker lost".into()))))
            .collect())
    }

    pub fn unlink_clusters(
        self: &Arc<Self>,
        clusters: &[ClusterInfo],
        timeout: Duration,
        force: bool,
    ) -> Result<Vec<Result<()>>> {
        if clusters.is_empty() {
            return Err(Status::ParamInvalid("clusters must not be empty".into()));
        }
        let pool = ThreadPool::new("kvlink_unlink", LINK_WORKERS.min(clusters.len()));
        let handles: Vec<_> = clusters
            .iter()
            .map(|cluster| {
                let manager = self.clone();
                let cluster = cluster.clone();
                pool.commit(move || manager.unlink_one(&cluster, timeout, force))
            })
            .collect();
        Ok(handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(Status::UnlinkFailed("worker lost".into()))))
            .collect())
    }

    fn link_one(self: &Arc<Self>, cluster: &ClusterInfo, timeout: Duration) -> Result<()> {
        let remote = cluster
            .remote_ip_infos
            .first()
            .ok_or_else(|| Status::ParamInvalid("cluster has no remote endpoint".into()))?;
        let key = (ChannelType::Client, cluster.remote_cluster_id);
        {
            let mut links = self.links.lock();
            match links.get(&key).map(|e| e.status) {
                Some(LinkStatus::Preparing) => return Err(Status::ProcessingLink),
                Some(LinkStatus::Ok) => return Err(Status::AlreadyLink),
                Some(LinkStatus::Failed) | None => {
                    links.insert(
                        key,
                        LinkEntry {
                            channel_id: remote.endpoint(),
                            status: LinkStatus::Preparing,
                            cluster: Some(cluster.clone()),
                        },
                    );
                }
            }
        }
        let result = self.do_link(cluster, remote, timeout);
        let mut links = self.links.lock();
        match &result {
            Ok(()) => {
                if let Some(entry) = links.get_mut(&key) {
                    entry.status = LinkStatus::Ok;
                }
            }
            Err(e) => {
                warn!(cluster = cluster.remote_cluster_id, %e, "link failed");
                if let Some(entry) = links.get_mut(&key) {
                    entry.status = LinkStatus::Failed;
                }
            }
        }
        result
    }

    fn do_link(&self, cluster: &ClusterInfo, remote: &IpInfo, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let addr = resolve(remote)?;
        let mut stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| Status::LinkFailed(format!("connect {}: {e}", remote.endpoint())))?;
        stream.set_nodelay(true)?;

        let req = LinkReqMsg {
            cluster_id: self.config.cluster_id,
            channel_id: format!("cluster-{}", self.config.cluster_id),
            rank_table: self.config.local_rank_table.to_json()?,
            share_handles: self.fabric_service.share_handles(),
            cache_table: self.local_cache_table(),
        };
        message::send_msg(&mut stream, ControlMsgType::LinkReq, &req, deadline)?;
        let (frame, leftover) = message::read_frame_blocking(&mut stream, deadline)?;
        if frame.msg_type != ControlMsgType::LinkResp as i32 {
            return Err(Status::LinkFailed(format!(
                "unexpected handshake reply type {}",
                frame.msg_type
            )));
        }
        let resp: LinkRespMsg = message::decode_body(&frame.body)?;
        if let Some(status) = Status::from_code(resp.ret_code) {
            return Err(status);
        }

        let peer_table = RankTableInfo::parse(&resp.rank_table)?;
        let merged = merge_rank_tables(
            self.config.device_id,
            &self.config.local_rank_table,
            &peer_table,
        )?;
        self.fabric_service.import_mem(&resp.share_handles)?;
        if let Some(sink) = self.cache_table_sink.lock().as_ref() {
            sink(cluster.remote_cluster_id, resp.cache_table);
        }

        let channel_id = remote.endpoint();
        let fabric_channel = self.fabric.channel_create(self.endpoint, &channel_id)?;
        let reader = stream.try_clone()?;
        let channel = Channel::new(
            ChannelInfo {
                channel_type: ChannelType::Client,
                channel_id: channel_id.clone(),
                local_rank_id: merged.local_rank,
                peer_rank_id: merged.peer_rank,
            },
            stream,
            self.fabric.clone(),
            fabric_channel,
            self.config.heartbeat_timeout,
        );
        if !leftover.is_empty() {
            channel.framer().lock().extend(&leftover);
        }
        match self.channel_manager.create_channel(channel, reader) {
            Ok(_) => {
                info!(
                    cluster = cluster.remote_cluster_id,
                    channel = %channel_id,
                    local_rank = merged.local_rank,
                    peer_rank = merged.peer_rank,
                    "link established"
                );
                Ok(())
            }
            Err(Status::AlreadyConnected) => Err(Status::AlreadyLink),
            Err(e) => Err(e),
        }
    }

    /// Tears down the link with one cluster. `force` cancels in-flight
    /// async requests (streams are fence-aborted) instead of waiting for
    /// them; peer notification failures then stop being fatal.
    fn unlink_one(&self, cluster: &ClusterInfo, timeout: Duration, force: bool) -> Result<()> {
        let key = (ChannelType::Client, cluster.remote_cluster_id);
        let entry = self
            .links
            .lock()
            .get(&key)
            .cloned()
            .ok_or(Status::NotYetLink)?;
        let deadline = Instant::now() + timeout;

        if force {
            self.fabric_service.remove_channel(&entry.channel_id);
        }

        let notify = self.notify_peer_unlink(cluster, deadline, force);
        let _ = self
            .channel_manager
            .destroy_channel(ChannelType::Client, &entry.channel_id);
        self.fabric_service.remove_channel(&entry.channel_id);
        self.links.lock().remove(&key);
        match notify {
            Ok(()) => Ok(()),
            Err(e) if force => {
                debug!(cluster = cluster.remote_cluster_id, %e, "peer unlink notify failed, forced");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn notify_peer_unlink(
        &self,
        cluster: &ClusterInfo,
        deadline: Instant,
        force: bool,
    ) -> Result<()> {
        let remote = cluster
            .remote_ip_infos
            .first()
            .ok_or_else(|| Status::ParamInvalid("cluster has no remote endpoint".into()))?;
        let addr = resolve(remote)?;
        let timeout = deadline.saturating_duration_since(Instant::now());
        let mut stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| Status::NotifyPromptUnlinkFailed(e.to_string()))?;
        let req = UnlinkReqMsg {
            cluster_id: self.config.cluster_id,
            channel_id: format!("cluster-{}", self.config.cluster_id),
            force,
        };
        message::send_msg(&mut stream, ControlMsgType::UnlinkReq, &req, deadline)?;
        let (frame, _) = message::read_frame_blocking(&mut stream, deadline)?;
        if frame.msg_type != ControlMsgType::UnlinkResp as i32 {
            return Err(Status::NotifyPromptUnlinkFailed(format!(
                "unexpected reply type {}",
                frame.msg_type
            )));
        }
        let resp: UnlinkRespMsg = message::decode_body(&frame.body)?;
        match Status::from_code(resp.ret_code) {
            None => Ok(()),
            Some(status) => Err(status),
        }
    }

    /// Starts the listener daemon. Idempotent for the same endpoint.
    pub fn start_daemon(self: &Arc<Self>, listen: IpInfo) -> Result<()> {
        let mut daemon = self.daemon.lock();
        if let Some(existing) = daemon.as_ref() {
            if existing.listen == listen {
                return Ok(());
            }
            return Err(Status::Failed(format!(
                "daemon already listening on {}",
                existing.listen.endpoint()
            )));
        }
        let addr = resolve(&listen)?;
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&addr.into())
            .map_err(|e| Status::Failed(format!("bind {}: {e}", listen.endpoint())))?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;
        let listener: std::net::TcpListener = socket.into();

        let stop = Arc::new(AtomicBool::new(false));
        let manager = self.clone();
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("kvlink_listen".into())
            .spawn(move || manager.accept_loop(listener, stop_flag))
            .map_err(|e| Status::Failed(format!("spawn listener: {e}")))?;
        info!(listen = %listen.endpoint(), "listener daemon started");
        *daemon = Some(Daemon {
            stop,
            handle,
            listen,
        });
        Ok(())
    }

    /// Stops the listener daemon. Idempotent.
    pub fn stop_daemon(&self) -> Result<()> {
        let daemon = self.daemon.lock().take();
        if let Some(daemon) = daemon {
            daemon.stop.store(true, Ordering::Release);
            if daemon.handle.join().is_err() {
                error!("listener daemon panicked");
            }
            info!(listen = %daemon.listen.endpoint(), "listener daemon stopped");
        }
        Ok(())
    }

    pub fn listen_endpoint(&self) -> Option<IpInfo> {
        self.daemon.lock().as_ref().map(|d| d.listen.clone())
    }

    pub fn finalize(&self) {
        let _ = self.stop_daemon();
        self.links.lock().clear();
    }

    fn accept_loop(self: Arc<Self>, listener: std::net::TcpListener, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "incoming control connection");
                    if let Err(e) = self.handle_incoming(stream) {
                        warn!(%peer, %e, "incoming connection rejected");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_IDLE_WAIT);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(%e, "accept failed, listener exiting");
                    return;
                }
            }
        }
    }

    fn handle_incoming(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let (frame, leftover) = message::read_frame_blocking(&mut stream, deadline)?;
        match ControlMsgType::from_i32(frame.msg_type) {
            Some(ControlMsgType::LinkReq) => {
                self.process_link_request(stream, &frame, leftover, deadline)
            }
            Some(ControlMsgType::UnlinkReq) => {
                self.process_unlink_request(stream, &frame, deadline)
            }
            other => {
                warn!(?other, msg_type = frame.msg_type, "unexpected handshake message");
                Ok(())
            }
        }
    }

    fn process_link_request(
        &self,
        mut stream: TcpStream,
        frame: &Frame,
        leftover: bytes::Bytes,
        deadline: Instant,
    ) -> Result<()> {
        let req: LinkReqMsg = message::decode_body(&frame.body)?;
        info!(cluster = req.cluster_id, channel = %req.channel_id, "link request received");
        let outcome = (|| -> Result<(Channel, TcpStream)> {
            let peer_table = RankTableInfo::parse(&req.rank_table)?;
            let merged = merge_rank_tables(
                self.config.device_id,
                &self.config.local_rank_table,
                &peer_table,
            )?;
            self.fabric_service.import_mem(&req.share_handles)?;
            if let Some(sink) = self.cache_table_sink.lock().as_ref() {
                sink(req.cluster_id, req.cache_table.clone());
            }
            let fabric_channel = self.fabric.channel_create(self.endpoint, &req.channel_id)?;
            let reader = stream.try_clone()?;
            let channel = Channel::new(
                ChannelInfo {
                    channel_type: ChannelType::Server,
                    channel_id: req.channel_id.clone(),
                    local_rank_id: merged.local_rank,
                    peer_rank_id: merged.peer_rank,
                },
                stream.try_clone()?,
                self.fabric.clone(),
                fabric_channel,
                self.config.heartbeat_timeout,
            );
            if !leftover.is_empty() {
                channel.framer().lock().extend(&leftover);
            }
            Ok((channel, reader))
        })();

        match outcome {
            Ok((channel, reader)) => match self.channel_manager.create_channel(channel, reader) {
                Ok(channel) => {
                    self.links.lock().insert(
                        (ChannelType::Server, req.cluster_id),
                        LinkEntry {
                            channel_id: req.channel_id.clone(),
                            status: LinkStatus::Ok,
                            cluster: None,
                        },
                    );
                    let resp = LinkRespMsg {
                        ret_code: 0,
                        cluster_id: self.config.cluster_id,
                        rank_table: self.config.local_rank_table.to_json()?,
                        share_handles: self.fabric_service.share_handles(),
                        cache_table: self.local_cache_table(),
                    };
                    channel.send_control_msg(ControlMsgType::LinkResp, &resp, deadline)
                }
                Err(e) => {
                    let mapped = if e == Status::AlreadyConnected {
                        Status::AlreadyLink
                    } else {
                        e
                    };
                    self.reply_link_error(&mut stream, &mapped, deadline);
                    Err(mapped)
                }
            },
            Err(e) => {
                self.reply_link_error(&mut stream, &e, deadline);
                Err(e)
            }
        }
    }

    fn reply_link_error(&self, stream: &mut TcpStream, status: &Status, deadline: Instant) {
        let resp = LinkRespMsg {
            ret_code: status.code(),
            cluster_id: self.config.cluster_id,
            rank_table: String::new(),
            share_handles: Vec::new(),
            cache_table: Vec::new(),
        };
        if let Err(e) = message::send_msg(stream, ControlMsgType::LinkResp, &resp, deadline) {
            warn!(%e, "failed to send link error reply");
        }
    }

    fn process_unlink_request(
        &self,
        mut stream: TcpStream,
        frame: &Frame,
        deadline: Instant,
    ) -> Result<()> {
        let req: UnlinkReqMsg = message::decode_body(&frame.body)?;
        info!(cluster = req.cluster_id, channel = %req.channel_id, force = req.force, "unlink request received");
        let key = (ChannelType::Server, req.cluster_id);
        let known = self
            .channel_manager
            .get_channel(ChannelType::Server, &req.channel_id)
            .is_some();
        let ret_code = if known {
            if req.force {
                self.fabric_service.remove_channel(&req.channel_id);
            }
            let _ = self
                .channel_manager
                .destroy_channel(ChannelType::Server, &req.channel_id);
            self.fabric_service.remove_channel(&req.channel_id);
            self.links.lock().remove(&key);
            0
        } else {
            self.links.lock().remove(&key);
            Status::NotConnected.code()
        };
        let resp = UnlinkRespMsg { ret_code };
        message::send_msg(&mut stream, ControlMsgType::UnlinkResp, &resp, deadline)
    }

    fn local_cache_table(&self) -> Vec<RemoteCacheInfo> {
        self.cache_table_provider
            .lock()
            .as_ref()
            .map(|provider| provider())
            .unwrap_or_default()
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.finalize();
    }
}

fn resolve(ip_info: &IpInfo) -> Result<std::net::SocketAddr> {
    ip_info
        .endpoint()
        .to_socket_addrs()
        .map_err(|e| Status::ParamInvalid(format!("bad endpoint {}: {e}", ip_info.endpoint())))?
        .next()
        .ok_or_else(|| Status::ParamInvalid(format!("unresolvable endpoint {}", ip_info.endpoint())))
}
