// Process-memory implementation of the device runtime. Allocations are real
// heap memory, copies are plain memcpys, and streams execute eagerly so an
// event is observable as recorded once `event_record` ran. This backs the
// test suites and lets embedders bring the engine up without accelerators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::common::types::MemAddr;
use crate::runtime::{
    DeviceRuntime, EventHandle, EventStatus, MallocPolicy, MemcpyKind, StreamHandle,
};
use crate::{Result, Status};

const DEFAULT_TOTAL_MEM: u64 = 32 * 1024 * 1024 * 1024;

struct Allocation {
    // Owned storage; kept alive while the address is handed out.
    _backing: Box<[u8]>,
    len: u64,
}

#[derive(Default)]
struct StreamState {
    aborted: bool,
}

pub struct HostRuntime {
    total_mem: u64,
    allocated: AtomicU64,
    allocations: Mutex<HashMap<MemAddr, Allocation>>,
    streams: Mutex<HashMap<StreamHandle, StreamState>>,
    events: Mutex<HashMap<EventHandle, bool>>,
    next_stream: AtomicU64,
    next_event: AtomicU64,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOTAL_MEM)
    }

    pub fn with_capacity(total_mem: u64) -> Self {
        Self {
            total_mem,
            allocated: AtomicU64::new(0),
            allocations: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
        }
    }

    fn check_stream(&self, stream: StreamHandle) -> Result<()> {
        let streams = self.streams.lock();
        match streams.get(&stream) {
            None => Err(Status::ParamInvalid(format!("unknown stream {stream:?}"))),
            Some(state) if state.aborted => {
                Err(Status::Failed(format!("stream {stream:?} was aborted")))
            }
            Some(_) => Ok(()),
        }
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRuntime for HostRuntime {
    fn set_device(&self, _device_id: i32) -> Result<()> {
        Ok(())
    }

    fn reset_device(&self, _device_id: i32) -> Result<()> {
        Ok(())
    }

    fn malloc(&self, size: u64, _policy: MallocPolicy) -> Result<MemAddr> {
        if size == 0 {
            return Err(Status::ParamInvalid("malloc size is 0".into()));
        }
        if self.allocated.load(Ordering::Relaxed) + size > self.total_mem {
            return Err(Status::DeviceOutOfMemory);
        }
        let backing = vec![0u8; size as usize].into_boxed_slice();
        let addr = backing.as_ptr() as MemAddr;
        self.allocations.lock().insert(
            addr,
            Allocation {
                _backing: backing,
                len: size,
            },
        );
        self.allocated.fetch_add(size, Ordering::Relaxed);
        debug!(addr, size, "host runtime malloc");
        Ok(addr)
    }

    fn free(&self, addr: MemAddr) -> Result<()> {
        match self.allocations.lock().remove(&addr) {
            Some(alloc) => {
                self.allocated.fetch_sub(alloc.len, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Status::ParamInvalid(format!(
                "free of unknown address {addr:#x}"
            ))),
        }
    }

    fn memcpy(&self, dst: MemAddr, src: MemAddr, len: u64, _kind: MemcpyKind) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if dst == 0 || src == 0 {
            return Err(Status::ParamInvalid("memcpy with null address".into()));
        }
        // Addresses are real process pointers handed out by this runtime or
        // adopted from the caller; the caller vouches for the ranges.
        unsafe {
            std::ptr::copy(src as *const u8, dst as *mut u8, len as usize);
        }
        Ok(())
    }

    fn memcpy_async(
        &self,
        stream: StreamHandle,
        dst: MemAddr,
        src: MemAddr,
        len: u64,
        kind: MemcpyKind,
    ) -> Result<()> {
        self.check_stream(stream)?;
        self.memcpy(dst, src, len, kind)
    }

    fn stream_create(&self, _priority: i32) -> Result<StreamHandle> {
        let handle = StreamHandle(self.next_stream.fetch_add(1, Ordering::Relaxed));
        self.streams.lock().insert(handle, StreamState::default());
        Ok(handle)
    }

    fn stream_abort(&self, stream: StreamHandle) -> Result<()> {
        let mut streams = self.streams.lock();
        match streams.get_mut(&stream) {
            Some(state) => {
                state.aborted = true;
                Ok(())
            }
            None => Err(Status::ParamInvalid(format!("unknown stream {stream:?}"))),
        }
    }

    fn stream_destroy(&self, stream: StreamHandle) -> Result<()> {
        self.streams.lock().remove(&stream);
        Ok(())
    }

    fn stream_synchronize(&self, stream: StreamHandle, _timeout: Duration) -> Result<()> {
        self.check_stream(stream)
    }

    fn event_create(&self) -> Result<EventHandle> {
        let handle = EventHandle(self.next_event.fetch_add(1, Ordering::Relaxed));
        self.events.lock().insert(handle, false);
        Ok(handle)
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> Result<()> {
        self.check_stream(stream)?;
        match self.events.lock().get_mut(&event) {
            Some(recorded) => {
                *recorded = true;
                Ok(())
            }
            None => Err(Status::ParamInvalid(format!("unknown event {event:?}"))),
        }
    }

    fn event_query(&self, event: EventHandle) -> Result<EventStatus> {
        match self.events.lock().get(&event) {
            Some(true) => Ok(EventStatus::Recorded),
            Some(false) => Ok(EventStatus::NotReady),
            None => Err(Status::ParamInvalid(format!("unknown event {event:?}"))),
        }
    }

    fn event_destroy(&self, event: EventHandle) -> Result<()> {
        self.events.lock().remove(&event);
        Ok(())
    }

    fn get_mem_info(&self) -> Result<(u64, u64)> {
        let used = self.allocated.load(Ordering::Relaxed);
        Ok((self.total_mem.saturating_sub(used), self.total_mem))
    }
}
