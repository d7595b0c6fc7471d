// Process-local fabric: one-sided reads and writes become plain memory
// copies between registered regions. Two engines in one process (or one
// engine talking to itself) get a fully functional data plane, and every
// address is still validated against the registration tables the way a real
// fabric validates against its memory translation entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::types::MemAddr;
use crate::fabric::{
    EndpointDesc, EndpointHandle, Fabric, FabricChannelHandle, FabricChannelStatus,
    ImportedRegion, MemHandle, MemRegion, MemType,
};
use crate::{Result, Status};

/// Export descriptor payload. A hardware fabric would emit driver-opaque
/// bytes; loopback is self-describing.
#[derive(Debug, Serialize, Deserialize)]
struct ExportPayload {
    addr: MemAddr,
    len: u64,
    mem_type: MemType,
}

#[derive(Default)]
struct EndpointState {
    registered: HashMap<u64, MemRegion>,
    imported: HashMap<MemAddr, u64>,
}

struct ChannelState {
    endpoint: EndpointHandle,
    broken: bool,
}

#[derive(Default)]
struct Registry {
    endpoints: HashMap<u64, EndpointState>,
    channels: HashMap<u64, ChannelState>,
}

pub struct LoopbackFabric {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// A one-sided target must land inside a single span registered by some
    /// endpoint in this process.
    fn check_registered(registry: &Registry, addr: MemAddr, len: u64) -> Result<()> {
        let covered = registry.endpoints.values().any(|ep| {
            ep.registered
                .values()
                .any(|r| addr >= r.addr && addr + len <= r.addr + r.len)
        });
        if covered {
            Ok(())
        } else {
            Err(Status::ParamInvalid(format!(
                "address {addr:#x}+{len} is not inside a registered span"
            )))
        }
    }

    fn copy(
        &self,
        channel: FabricChannelHandle,
        dst: MemAddr,
        src: MemAddr,
        len: u64,
    ) -> Result<()> {
        {
            let registry = self.registry.lock();
            let state = registry
                .channels
                .get(&channel.0)
                .ok_or(Status::NotConnected)?;
            if state.broken {
                return Err(Status::NotConnected);
            }
            Self::check_registered(&registry, dst, len)?;
            Self::check_registered(&registry, src, len)?;
        }
        if len > 0 {
            unsafe {
                std::ptr::copy(src as *const u8, dst as *mut u8, len as usize);
            }
        }
        Ok(())
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric for LoopbackFabric {
    fn endpoint_create(&self, desc: &EndpointDesc) -> Result<EndpointHandle> {
        let id = self.alloc_id();
        self.registry
            .lock()
            .endpoints
            .insert(id, EndpointState::default());
        debug!(id, device_id = desc.device_id, "loopback endpoint created");
        Ok(EndpointHandle(id))
    }

    fn endpoint_destroy(&self, endpoint: EndpointHandle) -> Result<()> {
        self.registry.lock().endpoints.remove(&endpoint.0);
        Ok(())
    }

    fn mem_register(&self, endpoint: EndpointHandle, region: MemRegion) -> Result<MemHandle> {
        if region.len == 0 {
            return Err(Status::ParamInvalid("cannot register empty span".into()));
        }
        let id = self.alloc_id();
        let mut registry = self.registry.lock();
        let state = registry
            .endpoints
            .get_mut(&endpoint.0)
            .ok_or_else(|| Status::ParamInvalid(format!("unknown endpoint {endpoint:?}")))?;
        state.registered.insert(id, region);
        Ok(MemHandle(id))
    }

    fn mem_unregister(&self, endpoint: EndpointHandle, handle: MemHandle) -> Result<()> {
        let mut registry = self.registry.lock();
        let state = registry
            .endpoints
            .get_mut(&endpoint.0)
            .ok_or_else(|| Status::ParamInvalid(format!("unknown endpoint {endpoint:?}")))?;
        state.registered.remove(&handle.0);
        Ok(())
    }

    fn mem_export(&self, endpoint: EndpointHandle, handle: MemHandle) -> Result<Vec<u8>> {
        let registry = self.registry.lock();
        let state = registry
            .endpoints
            .get(&endpoint.0)
            .ok_or_else(|| Status::ParamInvalid(format!("unknown endpoint {endpoint:?}")))?;
        let region = state
            .registered
            .get(&handle.0)
            .ok_or_else(|| Status::ParamInvalid(format!("unknown mem handle {handle:?}")))?;
        let payload = ExportPayload {
            addr: region.addr,
            len: region.len,
            mem_type: region.mem_type,
        };
        serde_json::to_vec(&payload).map_err(|e| Status::Failed(format!("export encode: {e}")))
    }

    fn mem_import(&self, endpoint: EndpointHandle, desc: &[u8]) -> Result<ImportedRegion> {
        let payload: ExportPayload = serde_json::from_slice(desc)
            .map_err(|e| Status::ParamInvalid(format!("malformed share descriptor: {e}")))?;
        let mut registry = self.registry.lock();
        let state = registry
            .endpoints
            .get_mut(&endpoint.0)
            .ok_or_else(|| Status::ParamInvalid(format!("unknown endpoint {endpoint:?}")))?;
        // Same process, same virtual addresses: the import maps 1:1.
        state.imported.insert(payload.addr, payload.len);
        Ok(ImportedRegion {
            addr: payload.addr,
            len: payload.len,
        })
    }

    fn mem_unimport(&self, endpoint: EndpointHandle, addr: MemAddr) -> Result<()> {
        let mut registry = self.registry.lock();
        if let Some(state) = registry.endpoints.get_mut(&endpoint.0) {
            state.imported.remove(&addr);
        }
        Ok(())
    }

    fn channel_create(
        &self,
        endpoint: EndpointHandle,
        remote_key: &str,
    ) -> Result<FabricChannelHandle> {
        let id = self.alloc_id();
        let mut registry = self.registry.lock();
        if !registry.endpoints.contains_key(&endpoint.0) {
            return Err(Status::ParamInvalid(format!("unknown endpoint {endpoint:?}")));
        }
        registry.channels.insert(
            id,
            ChannelState {
                endpoint,
                broken: false,
            },
        );
        debug!(id, remote_key, "loopback channel created");
        Ok(FabricChannelHandle(id))
    }

    fn channel_destroy(&self, channel: FabricChannelHandle) -> Result<()> {
        self.registry.lock().channels.remove(&channel.0);
        Ok(())
    }

    fn channel_get_status(&self, channel: FabricChannelHandle) -> Result<FabricChannelStatus> {
        let registry = self.registry.lock();
        match registry.channels.get(&channel.0) {
            Some(state) if !state.broken && registry.endpoints.contains_key(&state.endpoint.0) => {
                Ok(FabricChannelStatus::Ready)
            }
            Some(_) => Ok(FabricChannelStatus::Broken),
            None => Err(Status::NotConnected),
        }
    }

    fn read_nbi(
        &self,
        channel: FabricChannelHandle,
        local_dst: MemAddr,
        remote_src: MemAddr,
        len: u64,
    ) -> Result<()> {
        self.copy(channel, local_dst, remote_src, len)
    }

    fn write_nbi(
        &self,
        channel: FabricChannelHandle,
        remote_dst: MemAddr,
        local_src: MemAddr,
        len: u64,
    ) -> Result<()> {
        self.copy(channel, remote_dst, local_src, len)
    }

    fn fence(&self, channel: FabricChannelHandle) -> Result<()> {
        // Copies complete synchronously; the fence only has to validate the
        // channel still exists.
        let registry = self.registry.lock();
        registry
            .channels
            .get(&channel.0)
            .map(|_| ())
            .ok_or(Status::NotConnected)
    }
}
