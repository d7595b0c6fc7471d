pub mod buffer_service;
pub mod fabric_service;
pub mod sync_flag;
pub mod task_gen;

use crate::common::types::MemAddr;

/// Direction of a one-sided batch relative to the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOp {
    /// remote -> local
    Read,
    /// local -> remote
    Write,
}

/// One span of a transfer batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOpDesc {
    pub local_addr: MemAddr,
    pub remote_addr: MemAddr,
    pub len: u64,
}
