// Channel manager behaviour under pressure: watermark eviction, in-flight
// protection, deferred destruction and shutdown. Channels are built over
// real localhost socket pairs with the loopback fabric.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::unbounded;
use kvlink::channel::channel::{Channel, ChannelInfo, ChannelType};
use kvlink::channel::manager::{ChannelManager, ManagerConfig};
use kvlink::fabric::{EndpointDesc, Fabric, Protocol};
use kvlink::{LoopbackFabric, Status};

struct Harness {
    manager: ChannelManager,
    fabric: Arc<LoopbackFabric>,
    endpoint: kvlink::fabric::EndpointHandle,
    listener: TcpListener,
    // Accepted peer sockets, kept open so channels stay alive.
    peers: Vec<TcpStream>,
    // Queue receivers must outlive the manager.
    _req_rx: crossbeam::channel::Receiver<(Arc<Channel>, kvlink::channel::message::BufferReq)>,
    _resp_rx: crossbeam::channel::Receiver<(Arc<Channel>, kvlink::channel::message::BufferResp)>,
}

fn harness(high: Option<usize>, low: Option<usize>) -> Harness {
    let (req_tx, req_rx) = unbounded();
    let (resp_tx, resp_rx) = unbounded();
    let manager = ChannelManager::new(
        ManagerConfig {
            heartbeat_interval: Duration::from_secs(10),
            high_water: high,
            low_water: low,
        },
        req_tx,
        resp_tx,
    )
    .unwrap();
    let fabric = Arc::new(LoopbackFabric::new());
    let endpoint = fabric
        .endpoint_create(&EndpointDesc {
            protocol: Protocol::Tcp,
            device_id: 0,
            super_device_id: 0,
            super_pod_id: 0,
        })
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    Harness {
        manager,
        fabric,
        endpoint,
        listener,
        peers: Vec::new(),
        _req_rx: req_rx,
        _resp_rx: resp_rx,
    }
}

impl Harness {
    fn add_channel(&mut self, channel_id: &str) -> Result<Arc<Channel>, Status> {
        let addr = self.listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let (peer, _) = self.listener.accept().unwrap();
        self.peers.push(peer);
        let fabric_channel = self.fabric.channel_create(self.endpoint, channel_id).unwrap();
        let reader = stream.try_clone().unwrap();
        let channel = Channel::new(
            ChannelInfo {
                channel_type: ChannelType::Client,
                channel_id: channel_id.to_string(),
                local_rank_id: 0,
                peer_rank_id: 1,
            },
            stream,
            self.fabric.clone(),
            fabric_channel,
            Duration::from_secs(20),
        );
        self.manager.create_channel(channel, reader)
    }
}

#[test]
fn duplicate_channel_key_is_already_connected() {
    let mut h = harness(None, None);
    h.add_channel("peer-a").unwrap();
    assert_eq!(h.add_channel("peer-a").unwrap_err(), Status::AlreadyConnected);
    assert_eq!(h.manager.channel_count(), 1);
    h.manager.finalize().unwrap();
}

#[test]
fn eviction_reduces_to_low_water_and_spares_busy_channels() {
    let mut h = harness(Some(8), Some(5));
    let mut channels = Vec::new();
    for i in 0..8 {
        channels.push(h.add_channel(&format!("peer-{i}")).unwrap());
    }
    assert_eq!(h.manager.channel_count(), 8);

    // Two channels gain in-flight transfers; they must survive eviction.
    let busy_a = channels[0].clone();
    let busy_b = channels[1].clone();
    let guard_a = busy_a.begin_transfer();
    let guard_b = busy_b.begin_transfer();

    // The ninth channel crosses the high-water mark.
    h.add_channel("peer-8").unwrap();
    assert_eq!(h.manager.channel_count(), 5);
    assert!(h
        .manager
        .get_channel(ChannelType::Client, "peer-0")
        .is_some());
    assert!(h
        .manager
        .get_channel(ChannelType::Client, "peer-1")
        .is_some());

    // Once the transfers complete the survivors become ordinary
    // candidates. Reduce the pool to just those two, then apply pressure
    // with channels that are all busy: the formerly-busy pair is evicted
    // on this round.
    drop(guard_a);
    drop(guard_b);
    for channel in h.manager.client_channels() {
        let id = channel.channel_id().to_string();
        if id != "peer-0" && id != "peer-1" {
            h.manager.destroy_channel(ChannelType::Client, &id).unwrap();
        }
    }
    assert_eq!(h.manager.channel_count(), 2);
    for i in 0..7 {
        let channel = h.add_channel(&format!("fresh-{i}")).unwrap();
        // Counter leak is fine here; finalize tears channels down
        // regardless of in-flight counts.
        std::mem::forget(channel.begin_transfer());
    }
    assert!(h
        .manager
        .get_channel(ChannelType::Client, "peer-0")
        .is_none());
    assert!(h
        .manager
        .get_channel(ChannelType::Client, "peer-1")
        .is_none());
    h.manager.finalize().unwrap();
}

#[test]
fn destroy_with_in_flight_transfers_is_deferred() {
    let mut h = harness(None, None);
    let channel = h.add_channel("peer-x").unwrap();
    let guard = channel.begin_transfer();
    h.manager
        .destroy_channel(ChannelType::Client, "peer-x")
        .unwrap();
    // Still present, marked disconnecting.
    let still = h.manager.get_channel(ChannelType::Client, "peer-x").unwrap();
    assert!(still.is_disconnecting());
    drop(guard);
    // The heartbeat sweep completes the destruction eventually; force it
    // with an explicit destroy here.
    h.manager
        .destroy_channel(ChannelType::Client, "peer-x")
        .unwrap();
    assert!(h.manager.get_channel(ChannelType::Client, "peer-x").is_none());
    h.manager.finalize().unwrap();
}

#[test]
fn destroy_unknown_channel_is_idempotent() {
    let h = harness(None, None);
    h.manager
        .destroy_channel(ChannelType::Client, "nobody")
        .unwrap();
    h.manager.finalize().unwrap();
}

#[test]
fn finalize_joins_threads_and_closes_channels() {
    let mut h = harness(None, None);
    for i in 0..3 {
        h.add_channel(&format!("peer-{i}")).unwrap();
    }
    h.manager.finalize().unwrap();
    assert_eq!(h.manager.channel_count(), 0);
    // Double finalize is a no-op.
    h.manager.finalize().unwrap();
}
