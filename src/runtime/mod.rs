// Device runtime capability surface consumed by the core. The engine never
// talks to a device driver directly; everything flows through this trait so
// the transfer services stay testable and hardware stays pluggable.

pub mod host;

use std::time::Duration;

use crate::common::types::MemAddr;
use crate::Result;

pub use host::HostRuntime;

/// Opaque handle to a hardware stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

/// Opaque handle to a completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MallocPolicy {
    /// Fail unless huge pages back the allocation.
    HugeOnly,
    /// Prefer huge pages, fall back to normal pages.
    HugeFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcpyKind {
    H2H,
    H2D,
    D2H,
    D2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Recorded,
    NotReady,
}

pub trait DeviceRuntime: Send + Sync {
    fn set_device(&self, device_id: i32) -> Result<()>;
    fn reset_device(&self, device_id: i32) -> Result<()>;

    fn malloc(&self, size: u64, policy: MallocPolicy) -> Result<MemAddr>;
    fn free(&self, addr: MemAddr) -> Result<()>;

    fn memcpy(&self, dst: MemAddr, src: MemAddr, len: u64, kind: MemcpyKind) -> Result<()>;
    fn memcpy_async(
        &self,
        stream: StreamHandle,
        dst: MemAddr,
        src: MemAddr,
        len: u64,
        kind: MemcpyKind,
    ) -> Result<()>;

    fn stream_create(&self, priority: i32) -> Result<StreamHandle>;
    fn stream_abort(&self, stream: StreamHandle) -> Result<()>;
    fn stream_destroy(&self, stream: StreamHandle) -> Result<()>;
    fn stream_synchronize(&self, stream: StreamHandle, timeout: Duration) -> Result<()>;

    fn event_create(&self) -> Result<EventHandle>;
    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> Result<()>;
    fn event_query(&self, event: EventHandle) -> Result<EventStatus>;
    fn event_destroy(&self, event: EventHandle) -> Result<()>;

    /// Returns `(free, total)` bytes of device memory.
    fn get_mem_info(&self) -> Result<(u64, u64)>;
}
