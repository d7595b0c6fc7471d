// Initialization options. Callers pass a flat string map (the embedding
// runtimes configure the engine through key/value options); this module
// owns the keys and the parsing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::types::IpInfo;
use crate::{Result, Status};

pub const OPTION_DEVICE_ID: &str = "kvlink.DeviceId";
pub const OPTION_LISTEN_IP_INFO: &str = "kvlink.ListenIpInfo";
pub const OPTION_SYNC_CACHE_WAIT_TIME: &str = "kvlink.SyncKvCacheWaitTime";
pub const OPTION_BUF_POOL_CFG: &str = "kvlink.BufPoolCfg";
pub const OPTION_ENABLE_SWITCH_ROLE: &str = "kvlink.EnableSwitchRole";
pub const OPTION_LOCAL_COMM_RES: &str = "kvlink.LocalCommRes";
pub const OPTION_HEARTBEAT_WAIT_TIME: &str = "kvlink.HeartbeatWaitTime";
pub const OPTION_CHANNEL_HIGH_WATER: &str = "kvlink.ChannelHighWater";
pub const OPTION_CHANNEL_LOW_WATER: &str = "kvlink.ChannelLowWater";

/// One staging-pool tier: `total_size` bytes carved into buffers of up to
/// `max_buf_size`, serving blocks of `blk_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufTierConfig {
    pub total_size: u64,
    pub blk_size: u64,
    pub max_buf_size: u64,
}

/// Parsed `kvlink.BufPoolCfg` value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufPoolConfig {
    pub buf_cfg: Vec<BufTierConfig>,
}

impl BufPoolConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        let cfg: BufPoolConfig = serde_json::from_str(raw)
            .map_err(|e| Status::ParamInvalid(format!("malformed buf_pool_cfg: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Tiers must be non-empty, strictly ascending in `blk_size`, and each
    /// tier's `max_buf_size` must hold at least one block.
    pub fn validate(&self) -> Result<()> {
        if self.buf_cfg.is_empty() {
            return Err(Status::ParamInvalid("buf_cfg is empty".into()));
        }
        let mut prev_blk = 0u64;
        for tier in &self.buf_cfg {
            if tier.blk_size == 0 || tier.total_size == 0 {
                return Err(Status::ParamInvalid("buf_cfg sizes must be non-zero".into()));
            }
            if tier.blk_size <= prev_blk {
                return Err(Status::ParamInvalid(
                    "buf_cfg blk_size must be strictly ascending".into(),
                ));
            }
            if tier.max_buf_size < tier.blk_size {
                return Err(Status::ParamInvalid(
                    "buf_cfg max_buf_size must be >= blk_size".into(),
                ));
            }
            prev_blk = tier.blk_size;
        }
        Ok(())
    }
}

/// Options recognised by `KvTransferEngine::initialize`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub device_id: i32,
    pub listen: Option<IpInfo>,
    pub sync_kv_cache_wait_time_ms: u64,
    pub heartbeat_wait_time_ms: u64,
    pub buf_pool_cfg: Option<BufPoolConfig>,
    pub enable_switch_role: bool,
    pub local_comm_res: Option<String>,
    pub channel_high_water: Option<usize>,
    pub channel_low_water: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            device_id: 0,
            listen: None,
            sync_kv_cache_wait_time_ms: 5_000,
            heartbeat_wait_time_ms: 10_000,
            buf_pool_cfg: None,
            enable_switch_role: false,
            local_comm_res: None,
            channel_high_water: None,
            channel_low_water: None,
        }
    }
}

impl EngineOptions {
    pub fn from_map(options: &HashMap<String, String>) -> Result<Self> {
        let mut parsed = EngineOptions::default();
        if let Some(raw) = options.get(OPTION_DEVICE_ID) {
            parsed.device_id = parse_number(OPTION_DEVICE_ID, raw)?;
        }
        if let Some(raw) = options.get(OPTION_LISTEN_IP_INFO) {
            parsed.listen = Some(parse_endpoint(raw)?);
        }
        if let Some(raw) = options.get(OPTION_SYNC_CACHE_WAIT_TIME) {
            parsed.sync_kv_cache_wait_time_ms = parse_number(OPTION_SYNC_CACHE_WAIT_TIME, raw)?;
        }
        if let Some(raw) = options.get(OPTION_HEARTBEAT_WAIT_TIME) {
            parsed.heartbeat_wait_time_ms = parse_number(OPTION_HEARTBEAT_WAIT_TIME, raw)?;
        }
        if let Some(raw) = options.get(OPTION_BUF_POOL_CFG) {
            parsed.buf_pool_cfg = Some(BufPoolConfig::parse(raw)?);
        }
        if let Some(raw) = options.get(OPTION_ENABLE_SWITCH_ROLE) {
            parsed.enable_switch_role = match raw.as_str() {
                "0" => false,
                "1" => true,
                other => {
                    return Err(Status::ParamInvalid(format!(
                        "{OPTION_ENABLE_SWITCH_ROLE} must be 0 or 1, got {other}"
                    )))
                }
            };
        }
        if let Some(raw) = options.get(OPTION_LOCAL_COMM_RES) {
            parsed.local_comm_res = Some(raw.clone());
        }
        if let Some(raw) = options.get(OPTION_CHANNEL_HIGH_WATER) {
            parsed.channel_high_water = Some(parse_number(OPTION_CHANNEL_HIGH_WATER, raw)?);
        }
        if let Some(raw) = options.get(OPTION_CHANNEL_LOW_WATER) {
            parsed.channel_low_water = Some(parse_number(OPTION_CHANNEL_LOW_WATER, raw)?);
        }
        if parsed.channel_high_water.is_some() != parsed.channel_low_water.is_some() {
            return Err(Status::ParamInvalid(
                "channel watermarks must be configured together".into(),
            ));
        }
        if let (Some(high), Some(low)) = (parsed.channel_high_water, parsed.channel_low_water) {
            if low >= high {
                return Err(Status::ParamInvalid(format!(
                    "channel low water {low} must be below high water {high}"
                )));
            }
        }
        Ok(parsed)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| Status::ParamInvalid(format!("option {key} is invalid: [{raw}]")))
}

fn parse_endpoint(raw: &str) -> Result<IpInfo> {
    let (ip, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| Status::ParamInvalid(format!("listen endpoint must be ip:port, got {raw}")))?;
    let port = parse_number(OPTION_LISTEN_IP_INFO, port)?;
    if ip.is_empty() {
        return Err(Status::ParamInvalid("listen ip is empty".into()));
    }
    Ok(IpInfo::new(ip, port))
}
