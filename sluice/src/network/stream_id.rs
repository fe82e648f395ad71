//! Allocation of the stream ids that multiplex requests over one connection.

use thiserror::Error;

use crate::frame::protocol_version::MAX_STREAM_IDS;

/// Returned when releasing a stream id that is not currently allocated.
///
/// This is never caused by the server or the user: it means the bookkeeping of the
/// connection itself is broken.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Stream id {0} released while not allocated")]
pub struct UnallocatedStreamId(pub i16);

/// Hands out stream ids from `0..capacity`, never giving the same id to two holders.
///
/// Ids are tracked in a bitmap, one bit per id. Bits past the capacity in the last
/// block are kept set, so they are never handed out. Allocation starts its scan at
/// the first block which may have a free id, which keeps it O(1) amortised.
#[derive(Debug)]
pub struct StreamIdGenerator {
    used_bitmap: Box<[u64]>,
    capacity: usize,
    in_use: usize,
    first_free_hint: usize,
}

impl StreamIdGenerator {
    /// Creates a generator for at most `max_requests` concurrent ids.
    ///
    /// The bound is clamped to `1..=32768`, the range the protocol can express.
    pub fn new(max_requests: usize) -> Self {
        let capacity = max_requests.clamp(1, MAX_STREAM_IDS);
        let blocks = capacity.div_ceil(64);
        let mut used_bitmap = vec![0u64; blocks].into_boxed_slice();

        let tail = capacity % 64;
        if tail != 0 {
            used_bitmap[blocks - 1] = !0u64 << tail;
        }

        Self {
            used_bitmap,
            capacity,
            in_use: 0,
            first_free_hint: 0,
        }
    }

    /// Takes the lowest free id, or returns `None` when all of them are in use.
    pub fn allocate(&mut self) -> Option<i16> {
        for block_id in self.first_free_hint..self.used_bitmap.len() {
            let block = &mut self.used_bitmap[block_id];
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                self.first_free_hint = block_id;
                self.in_use += 1;
                return Some((block_id * 64 + off as usize) as i16);
            }
        }
        self.first_free_hint = self.used_bitmap.len();
        None
    }

    /// Gives `stream_id` back. Releasing an id which is not allocated is an error.
    pub fn release(&mut self, stream_id: i16) -> Result<(), UnallocatedStreamId> {
        if !self.is_allocated(stream_id) {
            return Err(UnallocatedStreamId(stream_id));
        }
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1u64 << off);
        self.first_free_hint = self.first_free_hint.min(block_id);
        self.in_use -= 1;
        Ok(())
    }

    /// Whether `stream_id` is currently held by someone.
    pub fn is_allocated(&self, stream_id: i16) -> bool {
        if stream_id < 0 || stream_id as usize >= self.capacity {
            return false;
        }
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] & (1u64 << off) != 0
    }

    /// Number of ids currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of ids that can be allocated at the same time.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
