// End-to-end scenarios: two engines in one process, linked over real
// localhost TCP control sockets, with the loopback fabric as the data
// plane. The prompt engine owns filled caches; the decoder pulls or
// receives them and the tests verify the bytes that landed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kvlink::runtime::{MallocPolicy, MemcpyKind};
use kvlink::{
    Cache, CacheDesc, CacheIndex, CachePlacement, ClusterInfo, DataType, DeviceRuntime,
    HostRuntime, IpInfo, KvCacheExtParam, KvTransferEngine, LinkStatus, LoopbackFabric, MemAddr,
    RegisterCfg, Role, Status, OPTION_DEVICE_ID, OPTION_ENABLE_SWITCH_ROLE,
    OPTION_HEARTBEAT_WAIT_TIME, OPTION_LISTEN_IP_INFO,
};

const PROMPT_CLUSTER: u64 = 0;
const DECODER_CLUSTER: u64 = 1;
const LINK_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_PORT: AtomicU16 = AtomicU16::new(26000);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(2, Ordering::Relaxed)
}

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .try_init();
    });
}

struct TestBed {
    runtime: Arc<HostRuntime>,
    prompt: KvTransferEngine,
    decoder: KvTransferEngine,
    prompt_port: u16,
    decoder_port: u16,
}

fn options(device_id: i32, listen_port: Option<u16>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(OPTION_DEVICE_ID.to_string(), device_id.to_string());
    if let Some(port) = listen_port {
        map.insert(
            OPTION_LISTEN_IP_INFO.to_string(),
            format!("127.0.0.1:{port}"),
        );
    }
    map
}

fn setup() -> TestBed {
    setup_with(|_| {}, |_| {})
}

fn setup_with(
    prompt_extra: impl FnOnce(&mut HashMap<String, String>),
    decoder_extra: impl FnOnce(&mut HashMap<String, String>),
) -> TestBed {
    init_tracing();
    let runtime = Arc::new(HostRuntime::new());
    let fabric = Arc::new(LoopbackFabric::new());
    let prompt_port = next_port();
    let decoder_port = next_port();

    let prompt =
        KvTransferEngine::new(PROMPT_CLUSTER, Role::Prompt, runtime.clone(), fabric.clone());
    let mut prompt_opts = options(0, Some(prompt_port));
    prompt_extra(&mut prompt_opts);
    prompt.initialize(&prompt_opts).unwrap();

    let decoder =
        KvTransferEngine::new(DECODER_CLUSTER, Role::Decoder, runtime.clone(), fabric);
    let mut decoder_opts = options(1, Some(decoder_port));
    decoder_extra(&mut decoder_opts);
    decoder.initialize(&decoder_opts).unwrap();

    TestBed {
        runtime,
        prompt,
        decoder,
        prompt_port,
        decoder_port,
    }
}

fn cluster_to(remote_cluster_id: u64, remote_role: Role, port: u16) -> ClusterInfo {
    ClusterInfo {
        remote_cluster_id,
        remote_role,
        local_ip_infos: Vec::new(),
        remote_ip_infos: vec![IpInfo::new("127.0.0.1", port)],
    }
}

fn device_desc(num_tensors: u32, placement: CachePlacement) -> CacheDesc {
    CacheDesc {
        placement,
        num_tensors,
        data_type: DataType::Int32,
        shape: vec![8, 16],
    }
}

/// 8 x 16 int32 slots filled with iota(0, 128).
fn iota_tensor() -> Vec<i32> {
    (0..128).collect()
}

fn write_i32(runtime: &HostRuntime, addr: MemAddr, values: &[i32]) {
    runtime
        .memcpy(
            addr,
            values.as_ptr() as MemAddr,
            (values.len() * 4) as u64,
            MemcpyKind::H2D,
        )
        .unwrap();
}

fn read_i32(runtime: &HostRuntime, addr: MemAddr, count: usize) -> Vec<i32> {
    let mut out = vec![0i32; count];
    runtime
        .memcpy(
            out.as_mut_ptr() as MemAddr,
            addr,
            (count * 4) as u64,
            MemcpyKind::D2H,
        )
        .unwrap();
    out
}

/// Registers a prompt-side cache backed by runtime memory, pre-filled with
/// iota per tensor. Returns the cache id and the tensor addresses.
fn register_filled_cache(
    engine: &KvTransferEngine,
    runtime: &HostRuntime,
    desc: &CacheDesc,
) -> (i64, Vec<MemAddr>) {
    let tensor_size = desc.tensor_size();
    let addrs: Vec<MemAddr> = (0..desc.num_tensors)
        .map(|_| {
            let addr = runtime.malloc(tensor_size, MallocPolicy::HugeFirst).unwrap();
            write_i32(runtime, addr, &iota_tensor());
            addr
        })
        .collect();
    let cache_id = engine
        .register_kv_cache(desc, &addrs, &RegisterCfg::default())
        .unwrap();
    (cache_id, addrs)
}

fn link(from: &KvTransferEngine, to_cluster: u64, to_role: Role, port: u16) {
    let rets = from
        .link_clusters(&[cluster_to(to_cluster, to_role, port)], LINK_TIMEOUT)
        .unwrap();
    assert_eq!(rets.len(), 1);
    rets[0].as_ref().unwrap();
}

#[test]
fn happy_path_pull_device_to_device() {
    let bed = setup();
    let desc = device_desc(4, CachePlacement::Device);
    let (prompt_cache_id, _) = register_filled_cache(&bed.prompt, &bed.runtime, &desc);
    let dst_cache: Cache = bed.decoder.allocate_cache(&desc).unwrap();

    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);

    let src_index = CacheIndex {
        cluster_id: PROMPT_CLUSTER,
        cache_id: prompt_cache_id,
        batch_index: 0,
        ..Default::default()
    };
    bed.decoder
        .pull_kv_blocks(
            &src_index,
            &dst_cache,
            &[1, 2, 3],
            &[1, 2, 3],
            &KvCacheExtParam::default(),
        )
        .unwrap();

    for &addr in &dst_cache.tensor_addrs {
        let values = read_i32(&bed.runtime, addr, 128);
        for (i, &v) in values.iter().enumerate() {
            if (16..64).contains(&i) {
                assert_eq!(v, i as i32, "slot element {i}");
            } else {
                assert_eq!(v, 0, "untouched element {i}");
            }
        }
    }
}

#[test]
fn push_with_per_layer_ranges() {
    let bed = setup();
    let desc = device_desc(4, CachePlacement::Device);
    let (prompt_cache_id, _) = register_filled_cache(&bed.prompt, &bed.runtime, &desc);
    let prompt_cache = Cache {
        cache_id: prompt_cache_id,
        tensor_addrs: Vec::new(),
        desc: desc.clone(),
    };
    let decoder_cache = bed.decoder.allocate_cache(&desc).unwrap();

    // Both directions matter here: the prompt is the requester.
    link(&bed.prompt, DECODER_CLUSTER, Role::Decoder, bed.decoder_port);

    let dst_index = CacheIndex {
        cluster_id: DECODER_CLUSTER,
        cache_id: decoder_cache.cache_id,
        batch_index: 0,
        ..Default::default()
    };
    for layer in 0..4 {
        let ext = KvCacheExtParam {
            src_layer_range: (layer, layer),
            dst_layer_range: (layer, layer),
            tensor_num_per_layer: 1,
        };
        bed.prompt
            .push_kv_blocks(&prompt_cache, &dst_index, &[5, 6, 7], &[5, 6, 7], &ext)
            .unwrap();
    }

    for &addr in &decoder_cache.tensor_addrs {
        let values = read_i32(&bed.runtime, addr, 128);
        for (i, &v) in values.iter().enumerate() {
            if (80..128).contains(&i) {
                assert_eq!(v, i as i32, "pushed element {i}");
            } else {
                assert_eq!(v, 0, "untouched element {i}");
            }
        }
    }
}

#[test]
fn cross_placement_pull_through_staging() {
    let bed = setup();
    let src_desc = device_desc(4, CachePlacement::Device);
    let dst_desc = device_desc(4, CachePlacement::Host);
    let (prompt_cache_id, _) = register_filled_cache(&bed.prompt, &bed.runtime, &src_desc);
    let dst_cache = bed.decoder.allocate_cache(&dst_desc).unwrap();

    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);

    let src_index = CacheIndex {
        cluster_id: PROMPT_CLUSTER,
        cache_id: prompt_cache_id,
        batch_index: 0,
        ..Default::default()
    };
    bed.decoder
        .pull_kv_blocks(
            &src_index,
            &dst_cache,
            &[0, 2, 5, 6],
            &[0, 2, 5, 6],
            &KvCacheExtParam::default(),
        )
        .unwrap();

    let pulled: Vec<usize> = [0usize, 2, 5, 6]
        .iter()
        .flat_map(|&b| (b * 16..(b + 1) * 16))
        .collect();
    for &addr in &dst_cache.tensor_addrs {
        let values = read_i32(&bed.runtime, addr, 128);
        for (i, &v) in values.iter().enumerate() {
            if pulled.contains(&i) {
                assert_eq!(v, i as i32, "staged element {i}");
            } else {
                assert_eq!(v, 0, "untouched element {i}");
            }
        }
    }
}

#[test]
fn cross_placement_contiguous_pull() {
    let bed = setup();
    let src_desc = device_desc(2, CachePlacement::Device);
    let dst_desc = device_desc(2, CachePlacement::Host);
    let (prompt_cache_id, _) = register_filled_cache(&bed.prompt, &bed.runtime, &src_desc);
    let dst_cache = bed.decoder.allocate_cache(&dst_desc).unwrap();

    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);

    // Whole slot 2 of the remote cache into local slot 2, staged because
    // the destination lives on the host.
    let src_index = CacheIndex {
        cluster_id: PROMPT_CLUSTER,
        cache_id: prompt_cache_id,
        batch_index: 2,
        ..Default::default()
    };
    bed.decoder
        .pull_kv_cache(&src_index, &dst_cache, 2, -1, &KvCacheExtParam::default())
        .unwrap();

    for &addr in &dst_cache.tensor_addrs {
        let values = read_i32(&bed.runtime, addr, 128);
        for i in 0..16 {
            assert_eq!(values[32 + i], (32 + i) as i32);
        }
        assert!(values[..32].iter().all(|&v| v == 0));
        assert!(values[48..].iter().all(|&v| v == 0));
    }
}

#[test]
fn cross_placement_push_uses_second_step() {
    let bed = setup();
    let host_desc = device_desc(2, CachePlacement::Host);
    let device_desc_ = device_desc(2, CachePlacement::Device);
    // Decoder holds a filled host cache and pushes into the prompt's
    // device cache: WriteH2Rd, served by the responder's follow-up copy.
    let (decoder_cache_id, _) = register_filled_cache(&bed.decoder, &bed.runtime, &host_desc);
    let decoder_cache = Cache {
        cache_id: decoder_cache_id,
        tensor_addrs: Vec::new(),
        desc: host_desc,
    };
    let prompt_cache = bed.prompt.allocate_cache(&device_desc_).unwrap();

    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);

    let dst_index = CacheIndex {
        cluster_id: PROMPT_CLUSTER,
        cache_id: prompt_cache.cache_id,
        batch_index: 0,
        ..Default::default()
    };
    bed.decoder
        .push_kv_blocks(
            &decoder_cache,
            &dst_index,
            &[1, 2],
            &[4, 5],
            &KvCacheExtParam {
                tensor_num_per_layer: 1,
                ..Default::default()
            },
        )
        .unwrap();

    for &addr in &prompt_cache.tensor_addrs {
        let values = read_i32(&bed.runtime, addr, 128);
        // src blocks 1..3 (elements 16..48) landed in dst blocks 4..6
        // (elements 64..96).
        for (i, &v) in values.iter().enumerate() {
            if (64..96).contains(&i) {
                assert_eq!(v, (i - 48) as i32, "pushed element {i}");
            } else {
                assert_eq!(v, 0, "untouched element {i}");
            }
        }
    }
}

#[test]
fn pull_contiguous_slot() {
    let bed = setup();
    let desc = device_desc(2, CachePlacement::Device);
    let (prompt_cache_id, _) = register_filled_cache(&bed.prompt, &bed.runtime, &desc);
    let dst_cache = bed.decoder.allocate_cache(&desc).unwrap();

    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);

    // Pull source slot 3 into local slot 5, whole slot.
    let src_index = CacheIndex {
        cluster_id: PROMPT_CLUSTER,
        cache_id: prompt_cache_id,
        batch_index: 3,
        ..Default::default()
    };
    bed.decoder
        .pull_kv_cache(&src_index, &dst_cache, 5, -1, &KvCacheExtParam::default())
        .unwrap();

    for &addr in &dst_cache.tensor_addrs {
        let values = read_i32(&bed.runtime, addr, 128);
        for i in 0..16 {
            assert_eq!(values[80 + i], (48 + i) as i32);
        }
        for i in 0..80 {
            assert_eq!(values[i], 0);
        }
    }
}

#[test]
fn double_deallocate_succeeds() {
    let bed = setup();
    let cache = bed
        .decoder
        .allocate_cache(&device_desc(2, CachePlacement::Device))
        .unwrap();
    bed.decoder.deallocate_cache(cache.cache_id).unwrap();
    bed.decoder.deallocate_cache(cache.cache_id).unwrap();
    bed.decoder.deallocate_cache(987_654).unwrap();
}

#[test]
fn double_link_reports_already_link() {
    let bed = setup();
    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);
    let rets = bed
        .decoder
        .link_clusters(
            &[cluster_to(PROMPT_CLUSTER, Role::Prompt, bed.prompt_port)],
            LINK_TIMEOUT,
        )
        .unwrap();
    assert_eq!(rets[0], Err(Status::AlreadyLink));
    assert_eq!(
        bed.decoder.query_register_mem_status(PROMPT_CLUSTER),
        Ok(LinkStatus::Ok)
    );
    assert_eq!(
        bed.decoder.query_register_mem_status(77),
        Err(Status::NotYetLink)
    );
}

#[test]
fn unlink_then_relink() {
    let bed = setup();
    let cluster = cluster_to(PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);
    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);
    let rets = bed
        .decoder
        .unlink_clusters(&[cluster.clone()], LINK_TIMEOUT, false)
        .unwrap();
    rets[0].as_ref().unwrap();
    // A fresh link must succeed after the teardown.
    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);
}

#[test]
fn pull_without_link_is_rejected() {
    let bed = setup();
    let desc = device_desc(2, CachePlacement::Device);
    let dst_cache = bed.decoder.allocate_cache(&desc).unwrap();
    let src_index = CacheIndex {
        cluster_id: PROMPT_CLUSTER,
        cache_id: 1,
        batch_index: 0,
        ..Default::default()
    };
    let err = bed
        .decoder
        .pull_kv_blocks(&src_index, &dst_cache, &[0], &[0], &KvCacheExtParam::default())
        .unwrap_err();
    // Without a link the peer's caches were never published.
    assert!(matches!(
        err,
        Status::KvCacheNotExist(_) | Status::NotYetLink
    ));
}

#[test]
fn block_validation_rejects_out_of_range() {
    let bed = setup();
    let desc = device_desc(2, CachePlacement::Device);
    let (prompt_cache_id, _) = register_filled_cache(&bed.prompt, &bed.runtime, &desc);
    let dst_cache = bed.decoder.allocate_cache(&desc).unwrap();
    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);

    let src_index = CacheIndex {
        cluster_id: PROMPT_CLUSTER,
        cache_id: prompt_cache_id,
        batch_index: 0,
        ..Default::default()
    };
    let err = bed
        .decoder
        .pull_kv_blocks(&src_index, &dst_cache, &[8], &[0], &KvCacheExtParam::default())
        .unwrap_err();
    assert!(matches!(err, Status::ParamInvalid(_)));
    let err = bed
        .decoder
        .pull_kv_blocks(&src_index, &dst_cache, &[1, 2], &[1], &KvCacheExtParam::default())
        .unwrap_err();
    assert!(matches!(err, Status::ParamInvalid(_)));
}

#[test]
fn local_copy_with_fan_out() {
    let bed = setup();
    let desc = device_desc(2, CachePlacement::Device);
    let (src_id, _) = register_filled_cache(&bed.prompt, &bed.runtime, &desc);
    let src_cache = Cache {
        cache_id: src_id,
        tensor_addrs: Vec::new(),
        desc: desc.clone(),
    };
    let dst_cache = bed.prompt.allocate_cache(&desc).unwrap();

    bed.prompt
        .copy_kv_blocks(
            &src_cache,
            &dst_cache,
            &[1],
            &[vec![3], vec![6]],
        )
        .unwrap();

    for &addr in &dst_cache.tensor_addrs {
        let values = read_i32(&bed.runtime, addr, 128);
        for i in 0..16 {
            assert_eq!(values[48 + i], (16 + i) as i32, "first replica");
            assert_eq!(values[96 + i], (16 + i) as i32, "second replica");
        }
    }
}

#[test]
fn switch_role_requires_feature_and_no_links() {
    let bed = setup();
    // Feature disabled by default.
    assert_eq!(
        bed.decoder.set_role(Role::Mix, &HashMap::new()),
        Err(Status::FeatureNotEnabled)
    );

    let runtime = Arc::new(HostRuntime::new());
    let fabric = Arc::new(LoopbackFabric::new());
    let port = next_port();
    let engine = KvTransferEngine::new(9, Role::Decoder, runtime, fabric);
    let mut opts = options(0, None);
    opts.insert(OPTION_ENABLE_SWITCH_ROLE.to_string(), "1".to_string());
    engine.initialize(&opts).unwrap();
    let mut role_opts = HashMap::new();
    role_opts.insert(
        OPTION_LISTEN_IP_INFO.to_string(),
        format!("127.0.0.1:{port}"),
    );
    engine.set_role(Role::Prompt, &role_opts).unwrap();
    assert_eq!(engine.role(), Role::Prompt);
    // Idempotent: same endpoint again.
    engine.set_role(Role::Prompt, &role_opts).unwrap();

    // With a live link the switch is refused.
    let rets = engine
        .link_clusters(
            &[cluster_to(PROMPT_CLUSTER, Role::Prompt, bed.prompt_port)],
            LINK_TIMEOUT,
        )
        .unwrap();
    rets[0].as_ref().unwrap();
    assert_eq!(
        engine.set_role(Role::Decoder, &role_opts),
        Err(Status::ExistLink)
    );
}

#[test]
fn heartbeat_timeout_destroys_server_channel() {
    // Prompt expects heartbeats every 100 ms; the decoder is configured to
    // effectively never send one.
    let bed = setup_with(
        |opts| {
            opts.insert(OPTION_HEARTBEAT_WAIT_TIME.to_string(), "100".to_string());
        },
        |opts| {
            opts.insert(
                OPTION_HEARTBEAT_WAIT_TIME.to_string(),
                "3600000".to_string(),
            );
        },
    );
    let cluster = cluster_to(PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);
    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);

    // The poll loop checks timeouts at least once a second; give it time.
    std::thread::sleep(Duration::from_millis(2500));

    let rets = bed
        .decoder
        .unlink_clusters(&[cluster], LINK_TIMEOUT, false)
        .unwrap();
    assert_eq!(rets[0], Err(Status::NotConnected));
}

#[test]
fn finalize_is_idempotent_and_safe_after_use() {
    let bed = setup();
    let desc = device_desc(2, CachePlacement::Device);
    let (prompt_cache_id, _) = register_filled_cache(&bed.prompt, &bed.runtime, &desc);
    let dst_cache = bed.decoder.allocate_cache(&desc).unwrap();
    link(&bed.decoder, PROMPT_CLUSTER, Role::Prompt, bed.prompt_port);
    let src_index = CacheIndex {
        cluster_id: PROMPT_CLUSTER,
        cache_id: prompt_cache_id,
        batch_index: 0,
        ..Default::default()
    };
    bed.decoder
        .pull_kv_blocks(
            &src_index,
            &dst_cache,
            &[1],
            &[1],
            &KvCacheExtParam::default(),
        )
        .unwrap();

    bed.decoder.finalize();
    bed.decoder.finalize();
    bed.prompt.finalize();
}
