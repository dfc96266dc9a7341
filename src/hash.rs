// hash.rs -- Open-addressed spatial hash over brick coordinates.
//
// Layout: `num_buckets` buckets of `bucket_size` contiguous head slots,
// followed by a shared overflow tail. A bucket's chain is rooted at its
// last head slot; `offset` holds the absolute slot index of the next
// node, 0 terminating the chain. Overflow slots are handed out by a
// monotone counter and recycled only by `reset()`.
//
// Mutation protocol: a mutator takes the bucket's mutex word with an
// exchange, performs its whole transaction, and releases. A mutator that
// finds the word taken abandons the attempt and counts it; the same
// voxel is re-requested on a later frame. Lookups never lock: a
// concurrent mutator publishes chain links only while owning the bucket,
// so a reader observes either the pre- or post-transaction chain.
//
// This module is the sequential reference for the WGSL kernels in
// src/shaders/hash_common.wgsl; the mutex words are modeled here so the
// control flow matches the device code path.
//
// Soft failures (heap empty, overflow tail spent, contention loss) are
// counted in `HashStats` and never abort the frame.

use glam::IVec3;

use crate::heap::BrickHeap;
use crate::params::HashParams;
use crate::voxel::{bucket_of, HashEntry, RESERVED_ENTRY};
use crate::error::ConsistencyError;

/// Diagnostic counters accumulated since the last `reset()`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HashStats {
    /// Insertions that claimed a slot but found the brick heap empty.
    pub heap_exhausted: u32,
    /// Insertions that found no head slot and no overflow capacity
    /// (tail spent or chain at its configured limit).
    pub overflow_exhausted: u32,
    /// Mutations abandoned because another thread owned the bucket.
    pub contention_lost: u32,
}

/// Result of a device-style insertion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The position is already present; carries its current `ptr`
    /// (which is `RESERVED_ENTRY` if a previous attempt ran out of
    /// bricks this frame).
    Existing(i32),
    /// New entry created, brick allocated.
    Inserted(u32),
    /// Entry claimed but the heap is empty; slot left reserved.
    HeapExhausted,
    /// No free head slot and no overflow slot available.
    OverflowExhausted,
    /// Bucket owned by another mutator this pass.
    Contended,
}

pub struct HashTable {
    entries: Vec<HashEntry>,
    bucket_mutex: Vec<u32>,
    /// Overflow tail slots handed out so far.
    overflow_used: u32,
    num_buckets: u32,
    bucket_size: u32,
    num_overflow_slots: u32,
    max_chain_length: u32,
    stats: HashStats,
}

impl HashTable {
    pub fn new(params: &HashParams) -> Self {
        HashTable {
            entries: vec![HashEntry::FREE; params.total_slots()],
            bucket_mutex: vec![0; params.num_buckets as usize],
            overflow_used: 0,
            num_buckets: params.num_buckets,
            bucket_size: params.bucket_size,
            num_overflow_slots: params.num_overflow_slots,
            max_chain_length: params.max_chain_length,
            stats: HashStats::default(),
        }
    }

    /// Clear every slot, the overflow counter, the mutexes, and the
    /// diagnostic counters.
    pub fn reset(&mut self) {
        self.entries.fill(HashEntry::FREE);
        self.bucket_mutex.fill(0);
        self.overflow_used = 0;
        self.stats = HashStats::default();
    }

    #[inline]
    pub fn head_slots(&self) -> usize {
        self.num_buckets as usize * self.bucket_size as usize
    }

    #[inline]
    pub fn total_slots(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[HashEntry] {
        &self.entries
    }

    #[inline]
    pub fn entry(&self, slot: usize) -> &HashEntry {
        &self.entries[slot]
    }

    pub fn stats(&self) -> HashStats {
        self.stats
    }

    pub fn overflow_used(&self) -> u32 {
        self.overflow_used.min(self.num_overflow_slots)
    }

    /// Count of entries currently holding a brick.
    pub fn num_allocated(&self) -> usize {
        self.entries.iter().filter(|e| e.is_allocated()).count()
    }

    /// Zero all bucket mutex words. The host does this before every
    /// mutating pass.
    pub fn reset_bucket_mutexes(&mut self) {
        self.bucket_mutex.fill(0);
    }

    #[inline]
    fn root_slot(&self, bucket: u32) -> usize {
        (bucket * self.bucket_size + self.bucket_size - 1) as usize
    }

    #[inline]
    fn bucket_head(&self, bucket: u32) -> usize {
        (bucket * self.bucket_size) as usize
    }

    fn try_lock(&mut self, bucket: u32) -> bool {
        let word = &mut self.bucket_mutex[bucket as usize];
        if *word != 0 {
            return false;
        }
        *word = 1;
        true
    }

    fn unlock(&mut self, bucket: u32) {
        self.bucket_mutex[bucket as usize] = 0;
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Slot index of the entry for `pos`, if present (any occupied
    /// state, including reserved).
    pub fn find_slot(&self, pos: IVec3) -> Option<usize> {
        let bucket = bucket_of(pos, self.num_buckets);
        let head = self.bucket_head(bucket);
        for slot in head..head + self.bucket_size as usize {
            let e = &self.entries[slot];
            if e.is_occupied() && e.pos() == pos {
                return Some(slot);
            }
        }
        // Overflow chain, rooted at the last head slot.
        let mut cur = self.entries[self.root_slot(bucket)].offset;
        let mut guard = 0usize;
        while cur != 0 && guard <= self.total_slots() {
            let e = &self.entries[cur as usize];
            if e.is_occupied() && e.pos() == pos {
                return Some(cur as usize);
            }
            cur = e.offset;
            guard += 1;
        }
        None
    }

    /// Brick index stored for `pos`, or `None` when absent or reserved.
    pub fn lookup(&self, pos: IVec3) -> Option<u32> {
        self.find_slot(pos).and_then(|slot| {
            let ptr = self.entries[slot].ptr;
            (ptr >= 0).then_some(ptr as u32)
        })
    }

    // -----------------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------------

    /// Ensure `pos` has an entry, allocating its brick from `heap`.
    ///
    /// Mirrors the device kernel: existing entries win without locking;
    /// any mutation takes the bucket mutex for the whole transaction.
    pub fn insert(&mut self, pos: IVec3, heap: &mut BrickHeap) -> InsertOutcome {
        if let Some(slot) = self.find_slot(pos) {
            return InsertOutcome::Existing(self.entries[slot].ptr);
        }

        let bucket = bucket_of(pos, self.num_buckets);
        if !self.try_lock(bucket) {
            self.stats.contention_lost += 1;
            return InsertOutcome::Contended;
        }

        let slot = match self.claim_slot(bucket) {
            Some(slot) => slot,
            None => {
                self.stats.overflow_exhausted += 1;
                self.unlock(bucket);
                return InsertOutcome::OverflowExhausted;
            }
        };

        self.entries[slot].set_pos(pos);
        let outcome = match heap.alloc() {
            Some(brick) => {
                self.entries[slot].ptr = brick as i32;
                InsertOutcome::Inserted(brick)
            }
            None => {
                // Leave the slot reserved; the end-of-frame normalize
                // pass returns it to FREE_ENTRY.
                self.entries[slot].ptr = RESERVED_ENTRY;
                self.stats.heap_exhausted += 1;
                InsertOutcome::HeapExhausted
            }
        };
        self.unlock(bucket);
        outcome
    }

    /// Pick a free head slot, or append a fresh overflow node to the
    /// bucket chain. Caller holds the bucket mutex.
    fn claim_slot(&mut self, bucket: u32) -> Option<usize> {
        let head = self.bucket_head(bucket);
        for slot in head..head + self.bucket_size as usize {
            if self.entries[slot].is_free() {
                return Some(slot);
            }
        }

        // Head region full: walk to the chain tail, bounding the length.
        let root = self.root_slot(bucket);
        let mut tail = root;
        let mut chain_len = 0u32;
        while self.entries[tail].offset != 0 {
            tail = self.entries[tail].offset as usize;
            chain_len += 1;
        }
        if chain_len >= self.max_chain_length {
            return None;
        }
        if self.overflow_used >= self.num_overflow_slots {
            return None;
        }
        let slot = self.head_slots() + self.overflow_used as usize;
        self.overflow_used += 1;
        self.entries[slot] = HashEntry::FREE;
        self.entries[tail].offset = slot as i32;
        Some(slot)
    }

    // -----------------------------------------------------------------------
    // Remove
    // -----------------------------------------------------------------------

    /// Remove the entry for `pos`, returning its brick to `heap`.
    ///
    /// Returns false when the position is absent or the bucket is
    /// contended (the collector retries next frame).
    pub fn remove(&mut self, pos: IVec3, heap: &mut BrickHeap) -> bool {
        let bucket = bucket_of(pos, self.num_buckets);
        let Some((slot, prev)) = self.locate(pos, bucket) else {
            return false;
        };
        if !self.try_lock(bucket) {
            self.stats.contention_lost += 1;
            return false;
        }
        let ptr = self.entries[slot].ptr;
        if ptr >= 0 {
            heap.free(ptr as u32);
        }
        self.unlink(bucket, slot, prev);
        self.unlock(bucket);
        true
    }

    /// Find `pos` together with its chain predecessor (None for head
    /// slots).
    fn locate(&self, pos: IVec3, bucket: u32) -> Option<(usize, Option<usize>)> {
        let head = self.bucket_head(bucket);
        for slot in head..head + self.bucket_size as usize {
            let e = &self.entries[slot];
            if e.is_occupied() && e.pos() == pos {
                return Some((slot, None));
            }
        }
        let mut prev = self.root_slot(bucket);
        let mut cur = self.entries[prev].offset;
        while cur != 0 {
            let e = &self.entries[cur as usize];
            if e.is_occupied() && e.pos() == pos {
                return Some((cur as usize, Some(prev)));
            }
            prev = cur as usize;
            cur = e.offset;
        }
        None
    }

    /// Detach `slot` from its bucket, preserving the rest of the chain.
    /// Caller holds the bucket mutex.
    ///
    /// Three cases:
    /// - chain root with a successor: promote the first overflow node
    ///   into the root slot and free the node;
    /// - plain head slot (or root without successor): clear in place;
    /// - overflow node: relink the predecessor past it.
    fn unlink(&mut self, bucket: u32, slot: usize, prev: Option<usize>) {
        match prev {
            None => {
                let root = self.root_slot(bucket);
                let next = self.entries[slot].offset;
                if slot == root && next != 0 {
                    let promoted = self.entries[next as usize];
                    self.entries[root] = promoted;
                    self.entries[next as usize] = HashEntry::FREE;
                } else {
                    self.entries[slot] = HashEntry::FREE;
                }
            }
            Some(prev) => {
                self.entries[prev].offset = self.entries[slot].offset;
                self.entries[slot] = HashEntry::FREE;
            }
        }
    }

    // -----------------------------------------------------------------------
    // End-of-frame normalization
    // -----------------------------------------------------------------------

    /// Return every reserved slot (`ptr == RESERVED_ENTRY`) to
    /// `FREE_ENTRY`, unlinking chain nodes like `remove` does. Runs
    /// after the collector, before the frame counter advances.
    pub fn normalize_reserved(&mut self) {
        for bucket in 0..self.num_buckets {
            'bucket: loop {
                let head = self.bucket_head(bucket);
                for slot in head..head + self.bucket_size as usize {
                    if self.entries[slot].is_reserved() {
                        self.unlink(bucket, slot, None);
                        continue 'bucket;
                    }
                }
                let mut prev = self.root_slot(bucket);
                let mut cur = self.entries[prev].offset;
                while cur != 0 {
                    if self.entries[cur as usize].is_reserved() {
                        self.unlink(bucket, cur as usize, Some(prev));
                        continue 'bucket;
                    }
                    prev = cur as usize;
                    cur = self.entries[prev].offset;
                }
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Consistency checker
    // -----------------------------------------------------------------------

    /// Full disjointness and reachability check against the heap.
    pub fn check_consistency(&self, heap: &BrickHeap) -> Result<HeapReport, ConsistencyError> {
        check_snapshot(
            &self.entries,
            heap.free_indices(),
            heap.capacity(),
            self.num_buckets,
            self.bucket_size,
        )
    }
}

/// Summary produced by a passing consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapReport {
    /// Entries holding a brick.
    pub allocated: u32,
    /// Entries still reserved (mid-frame state only).
    pub reserved: u32,
    /// Bricks on the free stack.
    pub free: u32,
}

/// Checker over raw table/heap snapshots, shared by the CPU table and
/// the GPU readback path.
///
/// Verifies, in order: no duplicate or out-of-range free pointers; every
/// allocated entry's brick is not simultaneously free and not shared
/// with another entry; every brick is accounted for; every occupied
/// entry is reachable by walking its bucket's chain.
pub fn check_snapshot(
    entries: &[HashEntry],
    free_indices: &[u32],
    num_bricks: u32,
    num_buckets: u32,
    bucket_size: u32,
) -> Result<HeapReport, ConsistencyError> {
    const UNSEEN: i64 = -1;
    const FREE: i64 = -2;
    let mut owner = vec![UNSEEN; num_bricks as usize];

    for &brick in free_indices {
        if brick >= num_bricks {
            return Err(ConsistencyError::FreePointerOutOfRange { brick });
        }
        if owner[brick as usize] == FREE {
            return Err(ConsistencyError::DuplicateFreePointer { brick });
        }
        owner[brick as usize] = FREE;
    }

    let mut allocated = 0u32;
    let mut reserved = 0u32;
    for (slot, e) in entries.iter().enumerate() {
        if e.is_reserved() {
            reserved += 1;
        }
        if !e.is_allocated() {
            continue;
        }
        allocated += 1;
        let brick = e.ptr as u32;
        if brick >= num_bricks {
            return Err(ConsistencyError::PointerOutOfRange { slot, ptr: e.ptr });
        }
        match owner[brick as usize] {
            FREE => return Err(ConsistencyError::FreeAndAllocated { brick, slot }),
            UNSEEN => owner[brick as usize] = slot as i64,
            prior => {
                return Err(ConsistencyError::DoubleAllocated {
                    brick,
                    slot_a: prior as usize,
                    slot_b: slot,
                })
            }
        }
    }

    for (brick, &state) in owner.iter().enumerate() {
        if state == UNSEEN {
            return Err(ConsistencyError::Leaked { brick: brick as u32 });
        }
    }

    // Reachability: walk every bucket chain and mark what it covers.
    let head_slots = (num_buckets * bucket_size) as usize;
    let mut visited = vec![false; entries.len()];
    for bucket in 0..num_buckets {
        let head = (bucket * bucket_size) as usize;
        for slot in head..head + bucket_size as usize {
            visited[slot] = true;
            let e = &entries[slot];
            if e.is_occupied() && bucket_of(e.pos(), num_buckets) != bucket {
                return Err(ConsistencyError::Unreachable { slot });
            }
        }
        let root = head + bucket_size as usize - 1;
        let mut cur = entries[root].offset;
        let mut guard = 0usize;
        while cur != 0 {
            let slot = cur as usize;
            if slot < head_slots || slot >= entries.len() || guard > entries.len() {
                return Err(ConsistencyError::Unreachable { slot: root });
            }
            if visited[slot] {
                // Two chains sharing a node.
                return Err(ConsistencyError::Unreachable { slot });
            }
            visited[slot] = true;
            let e = &entries[slot];
            if !e.is_occupied() || bucket_of(e.pos(), num_buckets) != bucket {
                return Err(ConsistencyError::Unreachable { slot });
            }
            cur = e.offset;
            guard += 1;
        }
    }
    for (slot, e) in entries.iter().enumerate().skip(head_slots) {
        if e.is_occupied() && !visited[slot] {
            return Err(ConsistencyError::Unreachable { slot });
        }
    }

    Ok(HeapReport {
        allocated,
        reserved,
        free: free_indices.len() as u32,
    })
}
