// Core data model shared by every layer of the engine: cache descriptors,
// cache handles, peer addressing and transfer parameters.

use serde::{Deserialize, Serialize};

/// Default number of tensors per transformer layer (one key, one value).
pub const DEFAULT_TENSOR_NUM_PER_LAYER: u8 = 2;

/// Process-wide address type. Device and host addresses share one space;
/// the runtime and fabric decide how to interpret a value.
pub type MemAddr = u64;

/// Role a process plays in the disaggregated serving topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Computes and stores KV tensors, serves pull requests.
    Prompt,
    /// Pulls or receives KV tensors produced by a prompt peer.
    Decoder,
    /// Acts as both at once.
    Mix,
}

/// Where a cache's tensors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePlacement {
    Host,
    Device,
}

/// Element types supported by cache descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float16,
    Bf16,
    Float32,
    Float64,
}

impl DataType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 | DataType::Float16 | DataType::Bf16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 8,
        }
    }
}

/// Shape and placement of one cache.
///
/// `shape[0]` is the number of slots (batch entries or blocks) in each
/// tensor; the remaining dimensions describe one slot. The per-slot stride
/// in bytes is therefore `product(shape[1..]) * dtype size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDesc {
    pub placement: CachePlacement,
    pub num_tensors: u32,
    pub data_type: DataType,
    pub shape: Vec<i64>,
}

impl CacheDesc {
    /// Number of addressable slots per tensor.
    pub fn num_blocks(&self) -> u64 {
        self.shape.first().copied().unwrap_or(0).max(0) as u64
    }

    /// Size in bytes of one slot (batch entry or block).
    pub fn block_size(&self) -> u64 {
        let elems: i64 = self.shape.iter().skip(1).product();
        elems.max(0) as u64 * self.data_type.size_bytes() as u64
    }

    /// Size in bytes of one whole tensor.
    pub fn tensor_size(&self) -> u64 {
        self.num_blocks() * self.block_size()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.num_tensors == 0 {
            return Err(crate::Status::ParamInvalid("num_tensors is 0".into()));
        }
        if self.shape.is_empty() || self.shape.iter().any(|&d| d <= 0) {
            return Err(crate::Status::ParamInvalid(format!(
                "invalid shape {:?}",
                self.shape
            )));
        }
        Ok(())
    }
}

/// A registered or allocated cache: one device-memory base address per
/// tensor, plus the descriptor they share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cache {
    pub cache_id: i64,
    pub tensor_addrs: Vec<MemAddr>,
    pub desc: CacheDesc,
}

/// Remote cache address used by a decoder to reach a region on a prompt
/// peer. `batch_index` selects a slot inside each contiguous tensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndex {
    pub cluster_id: u64,
    pub cache_id: i64,
    pub batch_index: u32,
    pub model_id: Option<u64>,
    pub request_id: Option<u64>,
    pub prefix_id: Option<u64>,
}

/// One listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpInfo {
    pub ip: String,
    pub port: u16,
}

impl IpInfo {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Identity and endpoints of a remote cluster to link with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub remote_cluster_id: u64,
    pub remote_role: Role,
    pub local_ip_infos: Vec<IpInfo>,
    pub remote_ip_infos: Vec<IpInfo>,
}

/// Extension parameters for pull/push operations.
///
/// Layer ranges are inclusive `(first, last)` pairs; `(-1, -1)` selects all
/// layers. Both ranges must span the same number of layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheExtParam {
    pub src_layer_range: (i32, i32),
    pub dst_layer_range: (i32, i32),
    pub tensor_num_per_layer: u8,
}

impl Default for KvCacheExtParam {
    fn default() -> Self {
        Self {
            src_layer_range: (-1, -1),
            dst_layer_range: (-1, -1),
            tensor_num_per_layer: DEFAULT_TENSOR_NUM_PER_LAYER,
        }
    }
}

/// Registration options for externally allocated memory. Currently empty,
/// kept as a named struct so the signature stays stable.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterCfg {}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> CacheDesc {
        CacheDesc {
            placement: CachePlacement::Device,
            num_tensors: 4,
            data_type: DataType::Int32,
            shape: vec![8, 16],
        }
    }

    #[test]
    fn strides_follow_shape() {
        let d = desc();
        assert_eq!(d.num_blocks(), 8);
        assert_eq!(d.block_size(), 64);
        assert_eq!(d.tensor_size(), 512);
    }

    #[test]
    fn zero_tensors_is_invalid() {
        let mut d = desc();
        d.num_tensors = 0;
        assert!(d.validate().is_err());
    }

    #[test]
    fn non_positive_shape_is_invalid() {
        let mut d = desc();
        d.shape = vec![8, 0];
        assert!(d.validate().is_err());
    }
}
