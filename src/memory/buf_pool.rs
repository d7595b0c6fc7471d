// Bounded staging-buffer pools for cross-placement transfers. Each pool
// carves one registered region into equally sized buffers plus a companion
// flag byte per buffer; the flag lives in the same registered region so the
// peer can toggle it with a one-sided write.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::common::types::MemAddr;
use crate::{Result, Status};

const FLAG_AREA_ALIGN: u64 = 256;

/// One staging buffer handed out by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingBuffer {
    pub index: usize,
    pub addr: MemAddr,
    pub len: u64,
    /// Companion ready/complete flag byte, peer-addressable.
    pub flag_addr: MemAddr,
}

struct PoolState {
    idle: Vec<usize>,
}

pub struct StagingPool {
    name: String,
    blk_size: u64,
    buf_size: u64,
    buffers: Vec<StagingBuffer>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl StagingPool {
    /// Carves `region_len` bytes at `region_addr` into buffers of
    /// `buf_size`. The front of the region holds one flag byte per buffer.
    pub fn new(
        name: impl Into<String>,
        region_addr: MemAddr,
        region_len: u64,
        buf_size: u64,
        blk_size: u64,
    ) -> Result<Self> {
        if buf_size == 0 || blk_size == 0 || blk_size > buf_size {
            return Err(Status::ParamInvalid(format!(
                "staging pool sizes invalid: buf_size={buf_size} blk_size={blk_size}"
            )));
        }
        let mut num_bufs = region_len / buf_size;
        while num_bufs > 0 {
            let flag_area = (num_bufs as u64).div_ceil(FLAG_AREA_ALIGN) * FLAG_AREA_ALIGN;
            if flag_area + num_bufs as u64 * buf_size <= region_len {
                break;
            }
            num_bufs -= 1;
        }
        if num_bufs == 0 {
            return Err(Status::ParamInvalid(format!(
                "region of {region_len} bytes holds no {buf_size}-byte staging buffer"
            )));
        }
        let flag_area = num_bufs.div_ceil(FLAG_AREA_ALIGN) * FLAG_AREA_ALIGN;
        let buffers: Vec<StagingBuffer> = (0..num_bufs as usize)
            .map(|i| StagingBuffer {
                index: i,
                addr: region_addr + flag_area + i as u64 * buf_size,
                len: buf_size,
                flag_addr: region_addr + i as u64,
            })
            .collect();
        let name = name.into();
        debug!(
            pool = %name,
            buffers = buffers.len(),
            buf_size,
            blk_size,
            "staging pool created"
        );
        Ok(Self {
            name,
            blk_size,
            buf_size,
            state: Mutex::new(PoolState {
                idle: (0..buffers.len()).rev().collect(),
            }),
            buffers,
            available: Condvar::new(),
        })
    }

    /// Blocks until a buffer is free or the deadline passes.
    pub fn try_get(&self, timeout: Duration) -> Result<StagingBuffer> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(index) = state.idle.pop() {
                return Ok(self.buffers[index]);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                debug!(pool = %self.name, "staging pool wait timed out");
                return Err(Status::WaitProcTimeout);
            }
        }
    }

    pub fn release(&self, buffer: &StagingBuffer) {
        let mut state = self.state.lock();
        debug_assert!(!state.idle.contains(&buffer.index));
        state.idle.push(buffer.index);
        drop(state);
        self.available.notify_one();
    }

    pub fn buffer_size(&self) -> u64 {
        self.buf_size
    }

    pub fn block_size(&self) -> u64 {
        self.blk_size
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// All buffers, for fabric registration and descriptor exchange.
    pub fn buffers(&self) -> &[StagingBuffer] {
        &self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pool(bufs: u64, buf_size: u64) -> StagingPool {
        let region_len = FLAG_AREA_ALIGN + bufs * buf_size;
        StagingPool::new("test", 0x10_0000, region_len, buf_size, 512).unwrap()
    }

    #[test]
    fn buffers_do_not_overlap_flags() {
        let p = pool(4, 4096);
        assert_eq!(p.num_buffers(), 4);
        for buffer in p.buffers() {
            assert!(buffer.addr >= 0x10_0000 + FLAG_AREA_ALIGN);
            assert!(buffer.flag_addr < 0x10_0000 + FLAG_AREA_ALIGN);
        }
    }

    #[test]
    fn exhausted_pool_times_out() {
        let p = pool(1, 4096);
        let held = p.try_get(Duration::from_millis(10)).unwrap();
        assert_eq!(
            p.try_get(Duration::from_millis(20)),
            Err(Status::WaitProcTimeout)
        );
        p.release(&held);
        assert!(p.try_get(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn release_wakes_a_waiter() {
        let p = Arc::new(pool(1, 4096));
        let held = p.try_get(Duration::from_millis(10)).unwrap();
        let waiter = {
            let p = p.clone();
            thread::spawn(move || p.try_get(Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(50));
        p.release(&held);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn rejects_block_larger_than_buffer() {
        assert!(StagingPool::new("bad", 0x1000, 1 << 20, 4096, 8192).is_err());
    }
}
