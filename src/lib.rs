// kvlink: a point-to-point memory-transfer engine for disaggregated LLM
// serving. A prompt stage computes and stores key/value tensors; decoder
// stages pull or receive those tensors over a device-to-device fabric with
// per-block granularity. The engine exposes a small surface (register
// memory, link/unlink peers, pull/push/copy cache blocks or regions) and
// hides peer discovery, connection management, memory-handle exchange,
// buffered staging, asynchronous completion and retry.
//
// Layering, bottom up:
// - `memory`: buddy allocator over pinned pages and the staging pools.
// - `runtime` / `fabric`: capability surfaces for the device runtime and
//   the transfer fabric, with in-process implementations.
// - `transfer`: sync flags, the task-block generator, the zero-copy fabric
//   service and the buffer-staged service.
// - `channel`: wire framing, per-peer channels and their manager.
// - `link`: rank tables, link handshakes and the listener daemon.
// - `engine`: the public façade.

pub mod channel;
pub mod common;
pub mod engine;
pub mod error;
pub mod fabric;
pub mod link;
pub mod memory;
pub mod runtime;
pub mod transfer;

pub use engine::KvTransferEngine;
pub use error::{Result, Status};

pub use common::options::{
    BufPoolConfig, BufTierConfig, EngineOptions, OPTION_BUF_POOL_CFG, OPTION_CHANNEL_HIGH_WATER,
    OPTION_CHANNEL_LOW_WATER, OPTION_DEVICE_ID, OPTION_ENABLE_SWITCH_ROLE,
    OPTION_HEARTBEAT_WAIT_TIME, OPTION_LISTEN_IP_INFO, OPTION_LOCAL_COMM_RES,
    OPTION_SYNC_CACHE_WAIT_TIME,
};
pub use common::types::{
    Cache, CacheDesc, CacheIndex, CachePlacement, ClusterInfo, DataType, IpInfo, KvCacheExtParam,
    MemAddr, RegisterCfg, Role,
};
pub use fabric::{Fabric, LoopbackFabric};
pub use link::manager::LinkStatus;
pub use runtime::{DeviceRuntime, HostRuntime};
