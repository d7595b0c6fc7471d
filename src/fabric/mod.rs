// Fabric capability surface: endpoints, registered/exported/imported memory
// and one-sided channels. The transfer services are written against this
// trait; hardware fabrics plug in underneath it.

pub mod loopback;

use serde::{Deserialize, Serialize};

use crate::common::types::MemAddr;
use crate::Result;

pub use loopback::LoopbackFabric;

/// Opaque handle to a fabric endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointHandle(pub u64);

/// Opaque handle to a registered memory span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u64);

/// Opaque handle to a one-sided channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FabricChannelHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemType {
    Device,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Hccs,
    Tcp,
    Roce,
}

/// Endpoint placement description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDesc {
    pub protocol: Protocol,
    pub device_id: i32,
    pub super_device_id: u32,
    pub super_pod_id: u32,
}

/// A span of local memory to register with the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub addr: MemAddr,
    pub len: u64,
    pub mem_type: MemType,
}

/// Peer-importable token for a registered span: the origin virtual address
/// plus the fabric's opaque export descriptor. Serialised to the peer during
/// link setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareHandleInfo {
    pub origin_addr: MemAddr,
    pub len: u64,
    pub mem_type: MemType,
    pub desc: Vec<u8>,
}

/// A remote span mapped into the local address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportedRegion {
    pub addr: MemAddr,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricChannelStatus {
    Ready,
    Broken,
}

pub trait Fabric: Send + Sync {
    fn endpoint_create(&self, desc: &EndpointDesc) -> Result<EndpointHandle>;
    fn endpoint_destroy(&self, endpoint: EndpointHandle) -> Result<()>;

    fn mem_register(&self, endpoint: EndpointHandle, region: MemRegion) -> Result<MemHandle>;
    fn mem_unregister(&self, endpoint: EndpointHandle, handle: MemHandle) -> Result<()>;
    /// Produces the opaque descriptor a peer passes to `mem_import`.
    fn mem_export(&self, endpoint: EndpointHandle, handle: MemHandle) -> Result<Vec<u8>>;
    fn mem_import(&self, endpoint: EndpointHandle, desc: &[u8]) -> Result<ImportedRegion>;
    fn mem_unimport(&self, endpoint: EndpointHandle, addr: MemAddr) -> Result<()>;

    fn channel_create(
        &self,
        endpoint: EndpointHandle,
        remote_key: &str,
    ) -> Result<FabricChannelHandle>;
    fn channel_destroy(&self, channel: FabricChannelHandle) -> Result<()>;
    fn channel_get_status(&self, channel: FabricChannelHandle) -> Result<FabricChannelStatus>;

    /// Non-blocking one-sided read: remote -> local. Visibility is only
    /// guaranteed after `fence`.
    fn read_nbi(
        &self,
        channel: FabricChannelHandle,
        local_dst: MemAddr,
        remote_src: MemAddr,
        len: u64,
    ) -> Result<()>;

    /// Non-blocking one-sided write: local -> remote.
    fn write_nbi(
        &self,
        channel: FabricChannelHandle,
        remote_dst: MemAddr,
        local_src: MemAddr,
        len: u64,
    ) -> Result<()>;

    /// Barrier: all prior one-sided operations on the channel are globally
    /// visible when this returns.
    fn fence(&self, channel: FabricChannelHandle) -> Result<()>;
}
