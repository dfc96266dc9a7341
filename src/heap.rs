// heap.rs -- Free-list allocator for fixed-size voxel bricks.
//
// A stack of free brick indices. `counter` is the index of the topmost
// free entry: alloc reads at `counter` then decrements, free increments
// then writes. The device mirror keeps `counter` in a storage buffer and
// drives it with atomics; the pipeline guarantees alloc and free never
// run in the same kernel launch, which is what makes the two-step
// read/decrement safe there.
//
// The free count is `counter + 1` (index 0 is still a valid free entry).

/// Pool allocator handing out brick indices in `[0, capacity)`.
pub struct BrickHeap {
    free: Vec<u32>,
    /// Index of the topmost free entry; -1 when exhausted.
    counter: i32,
}

impl BrickHeap {
    /// Create a heap with every brick free.
    ///
    /// Initial layout: `free[i] = capacity - 1 - i`, so the first alloc
    /// returns brick 0.
    pub fn new(capacity: u32) -> Self {
        let mut heap = BrickHeap {
            free: vec![0; capacity as usize],
            counter: 0,
        };
        heap.reset();
        heap
    }

    /// Return every brick to the free stack.
    pub fn reset(&mut self) {
        let n = self.free.len() as u32;
        for (i, slot) in self.free.iter_mut().enumerate() {
            *slot = n - 1 - i as u32;
        }
        self.counter = n as i32 - 1;
    }

    /// Pop a free brick index, or `None` when the pool is exhausted.
    pub fn alloc(&mut self) -> Option<u32> {
        if self.counter < 0 {
            return None;
        }
        let idx = self.free[self.counter as usize];
        self.counter -= 1;
        Some(idx)
    }

    /// Push a brick index back on the free stack.
    ///
    /// The caller owns the index exclusively; the pipeline separates the
    /// allocating and freeing passes with a barrier.
    pub fn free(&mut self, idx: u32) {
        debug_assert!((idx as usize) < self.free.len(), "freeing out-of-range brick");
        self.counter += 1;
        debug_assert!((self.counter as usize) < self.free.len(), "double free overflows stack");
        self.free[self.counter as usize] = idx;
    }

    /// Number of bricks currently free.
    pub fn free_count(&self) -> u32 {
        (self.counter + 1) as u32
    }

    pub fn capacity(&self) -> u32 {
        self.free.len() as u32
    }

    /// The live free region of the stack, for the consistency checker.
    pub fn free_indices(&self) -> &[u32] {
        &self.free[..self.free_count() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_all_free() {
        let heap = BrickHeap::new(8);
        assert_eq!(heap.free_count(), 8);
        assert_eq!(heap.capacity(), 8);
    }

    #[test]
    fn test_alloc_order() {
        // free[i] = N-1-i puts brick 0 on top of the stack.
        let mut heap = BrickHeap::new(4);
        assert_eq!(heap.alloc(), Some(0));
        assert_eq!(heap.alloc(), Some(1));
        assert_eq!(heap.alloc(), Some(2));
        assert_eq!(heap.alloc(), Some(3));
        assert_eq!(heap.alloc(), None);
        assert_eq!(heap.free_count(), 0);
    }

    #[test]
    fn test_free_restores() {
        let mut heap = BrickHeap::new(4);
        let a = heap.alloc().unwrap();
        let b = heap.alloc().unwrap();
        assert_eq!(heap.free_count(), 2);

        heap.free(b);
        heap.free(a);
        assert_eq!(heap.free_count(), 4);

        // LIFO: last freed comes back first.
        assert_eq!(heap.alloc(), Some(a));
        assert_eq!(heap.alloc(), Some(b));
    }

    #[test]
    fn test_exhaustion_then_recovery() {
        let mut heap = BrickHeap::new(2);
        let a = heap.alloc().unwrap();
        let _b = heap.alloc().unwrap();
        assert_eq!(heap.alloc(), None);
        assert_eq!(heap.alloc(), None, "repeated alloc after exhaustion stays empty");

        heap.free(a);
        assert_eq!(heap.alloc(), Some(a));
    }

    #[test]
    fn test_reset_idempotent() {
        let mut heap = BrickHeap::new(4);
        heap.alloc();
        heap.alloc();
        heap.reset();
        assert_eq!(heap.free_count(), 4);
        heap.reset();
        assert_eq!(heap.free_count(), 4);
        // Every index present exactly once after reset.
        let mut seen = vec![false; 4];
        while let Some(i) = heap.alloc() {
            assert!(!seen[i as usize]);
            seen[i as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
