// One-byte cross-endpoint semaphore. The remote side sets the byte with a
// one-sided write; the local side polls it. The byte must live in memory
// that is both fabric-mapped and CPU-visible.

use std::time::{Duration, Instant};

use crate::common::types::MemAddr;
use crate::{Result, Status};

const CHECK_DEADLINE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct SyncFlag {
    addr: MemAddr,
}

impl SyncFlag {
    pub fn new(addr: MemAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> MemAddr {
        self.addr
    }

    fn load(&self) -> u8 {
        unsafe { std::ptr::read_volatile(self.addr as *const u8) }
    }

    fn store(&self, value: u8) {
        unsafe { std::ptr::write_volatile(self.addr as *mut u8, value) }
    }

    /// Sets the byte locally. The producer side of the protocol uses a
    /// one-sided write instead; this is for the same-process paths.
    pub fn set(&self, value: u8) {
        self.store(value);
    }

    /// Polls until the byte is non-zero, then resets it to zero and returns
    /// the observed value. The byte is reset even when the deadline passes,
    /// so a late producer cannot satisfy a wait that already timed out.
    pub fn wait(&self, deadline: Option<Instant>) -> Result<u8> {
        loop {
            let value = self.load();
            if value != 0 {
                self.store(0);
                return Ok(value);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.store(0);
                    return Err(Status::WaitProcTimeout);
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Short poll used for event-loop pacing: returns whether the flag was
    /// observed set (and reset) within one millisecond.
    pub fn check(&self) -> bool {
        let deadline = Instant::now() + CHECK_DEADLINE;
        loop {
            if self.load() == 1 {
                self.store(0);
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_observes_value_and_resets() {
        let byte = Box::new(0u8);
        let addr = &*byte as *const u8 as MemAddr;
        let flag = SyncFlag::new(addr);
        flag.set(3);
        assert_eq!(flag.wait(None), Ok(3));
        assert_eq!(flag.check(), false);
    }

    #[test]
    fn wait_times_out_when_never_set() {
        let byte = Box::new(0u8);
        let flag = SyncFlag::new(&*byte as *const u8 as MemAddr);
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(flag.wait(Some(deadline)), Err(Status::WaitProcTimeout));
    }

    #[test]
    fn wait_sees_concurrent_producer() {
        let byte = Box::new(0u8);
        let addr = &*byte as *const u8 as MemAddr;
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            SyncFlag::new(addr).set(1);
        });
        let flag = SyncFlag::new(addr);
        let deadline = Instant::now() + Duration::from_secs(2);
        assert_eq!(flag.wait(Some(deadline)), Ok(1));
        producer.join().unwrap();
    }
}
