// Decomposes an (N tensors x M blocks) transfer plan into a sequence of
// staging-buffer-sized tasks. Buffers fill in round-robin order; every
// buffer's lifetime is bracketed by explicit start and end boundary tasks,
// and consecutive block indices coalesce into one transfer task while the
// running span stays under the per-copy ceiling.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Wait for the buffer to become free before writing into it.
    StartBuffer,
    /// Copy one (possibly coalesced) block span into the buffer.
    TransferBlock,
    /// The buffer is full; signal the peer to consume it.
    EndBuffer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferBlockSpan {
    /// Destination block slot inside the staging buffer.
    pub buffer_block_start: u64,
    /// Byte offset inside the source tensor.
    pub tensor_offset: u64,
    pub tensor_index: u32,
    /// Bytes to move; sums of coalesced consecutive blocks.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferBlocksTask {
    pub kind: TaskKind,
    pub buffer_index: u32,
    pub span: TransferBlockSpan,
}

/// Block size used when both ends are contiguous regions.
pub const CONT_MEM_BLOCK_SIZE: u64 = 512 * 1024;
/// Default staging-buffer size.
pub const DEFAULT_BUFFER_SIZE: u64 = 32 * 1024 * 1024;
/// A buffer is flushed after this many transfer tasks even if block slots
/// remain.
const MAX_TASKS_PER_BUFFER: u32 = 64;
/// Ceiling for one coalesced copy.
const MAX_COALESCED_SIZE: u64 = 4 * 1024 * 1024;

pub struct TaskGenerator {
    num_tensors: u32,
    num_buffers: u32,
    buffer_size: u64,
    max_block_size: u64,
    /// Blocks placed into each successive buffer by the last `do_generate`
    /// run; the client-side generator paces its own buffer boundaries with
    /// the peer's counts so both sides rotate buffers in step.
    buffer_block_nums: Vec<u32>,
}

impl TaskGenerator {
    pub fn new(num_tensors: u32, num_buffers: u32, buffer_size: u64) -> Self {
        Self {
            num_tensors,
            num_buffers,
            buffer_size,
            max_block_size: MAX_COALESCED_SIZE,
            buffer_block_nums: Vec::new(),
        }
    }

    /// Plan for a contiguous source region of `tensor_size` bytes split into
    /// `block_size` chunks.
    pub fn generate_contiguous(
        &mut self,
        tensor_size: i64,
        block_size: u64,
    ) -> Vec<TransferBlocksTask> {
        let tensor_size = tensor_size.max(0) as u64;
        let mut block_num = tensor_size / block_size;
        let mut tail_block_size = tensor_size - block_size * block_num;
        if tail_block_size > 0 {
            block_num += 1;
        } else {
            tail_block_size = block_size;
        }
        let block_indices: Vec<u64> = (0..block_num).collect();
        if block_size > self.buffer_size {
            self.generate_large_block(block_size, &block_indices)
        } else {
            self.do_generate(block_size, tail_block_size, &block_indices)
        }
    }

    /// Plan for an explicit block-index vector. When `remote_block_indices`
    /// is given, the plan addresses local indices but rotates buffers at the
    /// peer's boundaries.
    pub fn generate_blocks(
        &mut self,
        block_size: u64,
        block_indices: &[u64],
        remote_block_indices: Option<&[u64]>,
    ) -> Vec<TransferBlocksTask> {
        if block_size > self.buffer_size {
            return self.generate_large_block(block_size, block_indices);
        }
        match remote_block_indices {
            None => self.do_generate(block_size, block_size, block_indices),
            Some(remote) => {
                self.generate_client_blocks(block_size, block_size, block_indices, remote)
            }
        }
    }

    fn do_generate(
        &mut self,
        block_size: u64,
        tail_block_size: u64,
        block_indices: &[u64],
    ) -> Vec<TransferBlocksTask> {
        self.buffer_block_nums.clear();
        let buffer_block_num = (self.buffer_size / block_size) as u32;
        let mut tasks = Vec::new();
        let mut buffer_index = 0u32;
        let mut prev_buffer_index = u32::MAX;
        let mut buffer_block_index = 0u32;
        let mut num_transfer_tasks = 0u32;
        for tensor_index in 0..self.num_tensors {
            let mut prev_task: Option<usize> = None;
            let mut prev_block_index = u64::MAX;
            for (k, &block_index) in block_indices.iter().enumerate() {
                let is_last_block = k == block_indices.len() - 1;
                let cur_block_size = if is_last_block {
                    tail_block_size
                } else {
                    block_size
                };
                if buffer_index != prev_buffer_index {
                    tasks.push(start_task(buffer_index));
                    num_transfer_tasks = 0;
                }
                prev_buffer_index = buffer_index;
                let coalesced = prev_task
                    .filter(|_| prev_block_index != u64::MAX && block_index == prev_block_index + 1)
                    .filter(|&idx| tasks[idx].span.size + cur_block_size <= self.max_block_size);
                match coalesced {
                    Some(idx) => tasks[idx].span.size += cur_block_size,
                    None => {
                        tasks.push(TransferBlocksTask {
                            kind: TaskKind::TransferBlock,
                            buffer_index,
                            span: TransferBlockSpan {
                                buffer_block_start: buffer_block_index as u64,
                                tensor_offset: block_index * block_size,
                                tensor_index,
                                size: cur_block_size,
                            },
                        });
                        num_transfer_tasks += 1;
                    }
                }
                buffer_block_index += 1;
                if buffer_block_index >= buffer_block_num
                    || num_transfer_tasks >= MAX_TASKS_PER_BUFFER
                {
                    self.buffer_block_nums.push(buffer_block_index);
                    tasks.push(end_task(buffer_index));
                    buffer_index = (buffer_index + 1) % self.num_buffers;
                    buffer_block_index = 0;
                    prev_task = None;
                } else {
                    prev_task = Some(tasks.len() - 1);
                }
                prev_block_index = block_index;
            }
        }
        if buffer_block_index > 0 {
            self.buffer_block_nums.push(buffer_block_index);
        }
        if tasks
            .last()
            .is_some_and(|t| t.kind != TaskKind::EndBuffer)
        {
            tasks.push(end_task(buffer_index));
        }
        tasks
    }

    fn generate_client_blocks(
        &mut self,
        block_size: u64,
        tail_block_size: u64,
        block_indices: &[u64],
        remote_block_indices: &[u64],
    ) -> Vec<TransferBlocksTask> {
        // First pass against the remote indices records how many blocks the
        // peer packs into each buffer.
        let _ = self.do_generate(block_size, tail_block_size, remote_block_indices);
        let buffer_block_num = (self.buffer_size / block_size) as u32;
        let mut tasks = Vec::new();
        let mut buffer_index = 0u32;
        let mut prev_buffer_index = u32::MAX;
        let mut buffer_block_index = 0u32;
        let mut buffer_task_index = 0usize;
        let mut remote_buffer_block_num = self
            .buffer_block_nums
            .first()
            .copied()
            .unwrap_or(buffer_block_num);
        for tensor_index in 0..self.num_tensors {
            let mut prev_task: Option<usize> = None;
            let mut prev_block_index = u64::MAX;
            for (k, &block_index) in block_indices.iter().enumerate() {
                let is_last_block = k == block_indices.len() - 1;
                let cur_block_size = if is_last_block {
                    tail_block_size
                } else {
                    block_size
                };
                if buffer_index != prev_buffer_index {
                    tasks.push(start_task(buffer_index));
                }
                prev_buffer_index = buffer_index;
                let coalesced = prev_task
                    .filter(|_| prev_block_index != u64::MAX && block_index == prev_block_index + 1)
                    .filter(|&idx| tasks[idx].span.size + cur_block_size <= self.max_block_size);
                match coalesced {
                    Some(idx) => tasks[idx].span.size += cur_block_size,
                    None => tasks.push(TransferBlocksTask {
                        kind: TaskKind::TransferBlock,
                        buffer_index,
                        span: TransferBlockSpan {
                            buffer_block_start: buffer_block_index as u64,
                            tensor_offset: block_index * block_size,
                            tensor_index,
                            size: cur_block_size,
                        },
                    }),
                }
                buffer_block_index += 1;
                if buffer_block_index >= buffer_block_num
                    || buffer_block_index >= remote_buffer_block_num
                {
                    tasks.push(end_task(buffer_index));
                    buffer_task_index += 1;
                    if let Some(&n) = self.buffer_block_nums.get(buffer_task_index) {
                        remote_buffer_block_num = n;
                    }
                    buffer_index = (buffer_index + 1) % self.num_buffers;
                    buffer_block_index = 0;
                    prev_task = None;
                } else {
                    prev_task = Some(tasks.len() - 1);
                }
                prev_block_index = block_index;
            }
        }
        if tasks
            .last()
            .is_some_and(|t| t.kind != TaskKind::EndBuffer)
        {
            tasks.push(end_task(buffer_index));
        }
        tasks
    }

    /// A block larger than the staging buffer becomes a run of
    /// (start, transfer, end) triples, each moving at most one buffer's
    /// worth and all sharing the same buffer slot sequence.
    fn generate_large_block(
        &self,
        block_size: u64,
        block_indices: &[u64],
    ) -> Vec<TransferBlocksTask> {
        let mut tasks = Vec::new();
        let buffer_index = 0u32;
        for tensor_index in 0..self.num_tensors {
            for &block_index in block_indices {
                let mut tensor_offset = block_index * block_size;
                let mut remaining = block_size;
                while remaining > 0 {
                    let cur = remaining.min(self.buffer_size);
                    tasks.push(start_task(buffer_index));
                    tasks.push(TransferBlocksTask {
                        kind: TaskKind::TransferBlock,
                        buffer_index,
                        span: TransferBlockSpan {
                            buffer_block_start: 0,
                            tensor_offset,
                            tensor_index,
                            size: cur,
                        },
                    });
                    tasks.push(end_task(buffer_index));
                    remaining -= cur;
                    tensor_offset += cur;
                }
            }
        }
        tasks
    }

    pub fn buffer_block_nums(&self) -> &[u32] {
        &self.buffer_block_nums
    }
}

fn start_task(buffer_index: u32) -> TransferBlocksTask {
    TransferBlocksTask {
        kind: TaskKind::StartBuffer,
        buffer_index,
        span: TransferBlockSpan::default(),
    }
}

fn end_task(buffer_index: u32) -> TransferBlocksTask {
    TransferBlocksTask {
        kind: TaskKind::EndBuffer,
        buffer_index,
        span: TransferBlockSpan::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn count_kind(tasks: &[TransferBlocksTask], kind: TaskKind) -> usize {
        tasks.iter().filter(|t| t.kind == kind).count()
    }

    #[test]
    fn boundaries_bracket_every_buffer() {
        let mut generator = TaskGenerator::new(2, 2, 8 * MIB);
        let tasks = generator.generate_blocks(512 * 1024, &[0, 1, 2, 3], None);
        assert_eq!(tasks.first().unwrap().kind, TaskKind::StartBuffer);
        assert_eq!(tasks.last().unwrap().kind, TaskKind::EndBuffer);
        assert_eq!(
            count_kind(&tasks, TaskKind::StartBuffer),
            count_kind(&tasks, TaskKind::EndBuffer)
        );
    }

    #[test]
    fn consecutive_blocks_coalesce_up_to_the_ceiling() {
        let mut generator = TaskGenerator::new(1, 2, 32 * MIB);
        // 16 consecutive 512 KiB blocks: 8 fit under 4 MiB per copy.
        let indices: Vec<u64> = (0..16).collect();
        let tasks = generator.generate_blocks(512 * 1024, &indices, None);
        let transfers: Vec<_> = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::TransferBlock)
            .collect();
        assert_eq!(transfers.len(), 2);
        assert!(transfers.iter().all(|t| t.span.size == 4 * MIB));
    }

    #[test]
    fn non_consecutive_blocks_stay_separate() {
        let mut generator = TaskGenerator::new(1, 2, 32 * MIB);
        let tasks = generator.generate_blocks(512 * 1024, &[1, 3, 5], None);
        assert_eq!(count_kind(&tasks, TaskKind::TransferBlock), 3);
    }

    #[test]
    fn plan_for_80_tensors_128_blocks_uses_160_buffer_rounds() {
        let mut generator = TaskGenerator::new(80, 2, 32 * MIB);
        let tasks = generator.generate_contiguous(128 * 512 * 1024, 512 * 1024);
        assert_eq!(count_kind(&tasks, TaskKind::StartBuffer), 160);
        assert_eq!(count_kind(&tasks, TaskKind::EndBuffer), 160);
        assert!(tasks
            .iter()
            .filter(|t| t.kind == TaskKind::TransferBlock)
            .all(|t| t.span.size <= 4 * MIB));
        // Buffers rotate round-robin between the two slots.
        let starts: Vec<u32> = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::StartBuffer)
            .map(|t| t.buffer_index)
            .collect();
        assert!(starts.chunks(2).all(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn large_block_splits_into_buffer_sized_triples() {
        let mut generator = TaskGenerator::new(1, 2, 8 * MIB);
        let tasks = generator.generate_blocks(20 * MIB, &[0], None);
        // ceil(20/8) = 3 sub-tasks, each its own start/transfer/end triple.
        assert_eq!(count_kind(&tasks, TaskKind::StartBuffer), 3);
        assert_eq!(count_kind(&tasks, TaskKind::TransferBlock), 3);
        assert_eq!(count_kind(&tasks, TaskKind::EndBuffer), 3);
        let sizes: Vec<u64> = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::TransferBlock)
            .map(|t| t.span.size)
            .collect();
        assert_eq!(sizes, vec![8 * MIB, 8 * MIB, 4 * MIB]);
    }

    #[test]
    fn tail_block_carries_the_remainder() {
        let mut generator = TaskGenerator::new(1, 2, 32 * MIB);
        // 1.25 MiB tensor with 512 KiB blocks: 2 full + 256 KiB tail.
        let tasks = generator.generate_contiguous((1280 * 1024) as i64, 512 * 1024);
        let total: u64 = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::TransferBlock)
            .map(|t| t.span.size)
            .sum();
        assert_eq!(total, 1280 * 1024);
    }

    #[test]
    fn client_plan_rotates_with_peer_buffer_counts() {
        let mut generator = TaskGenerator::new(1, 2, 32 * MIB);
        // Remote side packs its (consecutive) blocks 64 to a buffer; the
        // local indices are scattered but must flush at the same boundaries.
        let local: Vec<u64> = (0..100).map(|i| i * 2).collect();
        let remote: Vec<u64> = (0..100).collect();
        let tasks = generator.generate_blocks(512 * 1024, &local, Some(&remote));
        let starts = count_kind(&tasks, TaskKind::StartBuffer);
        let ends = count_kind(&tasks, TaskKind::EndBuffer);
        assert_eq!(starts, ends);
        assert_eq!(starts, 2); // 100 blocks at 64 per buffer
    }

    #[test]
    fn tensor_order_repeats_with_same_rotation() {
        let mut generator = TaskGenerator::new(2, 2, 32 * MIB);
        let tasks = generator.generate_blocks(512 * 1024, &[4, 5, 6], None);
        let per_tensor: Vec<Vec<_>> = (0..2)
            .map(|tensor| {
                tasks
                    .iter()
                    .filter(|t| {
                        t.kind == TaskKind::TransferBlock && t.span.tensor_index == tensor
                    })
                    .map(|t| (t.buffer_index, t.span.tensor_offset, t.span.size))
                    .collect()
            })
            .collect();
        assert_eq!(per_tensor[0], per_tensor[1]);
    }
}
