use crate::block::BlockPtr;
use crate::error::AllocError;
use crate::free_list::FreeLists;
use crate::header::{bytes_to_units, Header, Unit, MAX_STORED_SIZE, UNIT_BYTES};
use crate::host::HostHeap;
use crate::size_class::{class_of, NUM_CLASSES, NUM_SMALL_CLASSES};
use log::{debug, trace};
use std::process;
use std::ptr;

/// Segregated-fit allocator over an sbrk-style host region.
///
/// Blocks carry a one-unit header; free blocks thread a doubly linked
/// list per size class through their first two payload units. Allocation
/// serves small classes head-first, scans medium and large classes
/// first-fit, borrows from a higher class when the requested one is
/// empty, and carves from the arena frontier as a last resort. Resizing
/// prefers in-place surgery, coalescing the block with free neighbours,
/// over relocation.
///
/// The `FOOTERED` parameter selects the heap linkage. Without footers
/// every block costs one metadata unit and the heap can only be walked
/// forward. With footers each block ends in a copy of its header, which
/// makes the left neighbour reachable and lets a resize coalesce in both
/// directions at the price of one extra unit per block.
pub struct Allocator<const FOOTERED: bool> {
    host: HostHeap,
    lists: FreeLists<FOOTERED>,
    /// Arena frontier, one past the last assigned unit.
    next: *mut Unit,
}

/// Header-only variant. Resizes that cannot extend to the right relocate.
pub type SingleFit = Allocator<false>;

/// Header-and-footer variant. Resizes may also coalesce to the left.
pub type DoubleFit = Allocator<true>;

impl<const FOOTERED: bool> Allocator<FOOTERED> {
    const MIN_UNITS: usize = BlockPtr::<FOOTERED>::MIN_BLOCK_UNITS;

    /// Creates an empty arena over `host`. No memory is assigned until
    /// the first allocation.
    pub fn new(host: HostHeap) -> Self {
        let next = host.heap_lo() as *mut Unit;
        Allocator {
            host,
            lists: FreeLists::new(),
            next,
        }
    }

    /// Bytes currently assigned to the arena.
    pub fn heap_size(&self) -> usize {
        self.host.heap_size()
    }

    fn heap_lo(&self) -> *mut Unit {
        self.host.heap_lo() as *mut Unit
    }

    /// Allocates at least `bytes` bytes with unit alignment.
    ///
    /// Zero bytes yields a null pointer as a success value.
    ///
    /// # Safety
    /// The returned pointer is valid until it is passed to [`Self::free`]
    /// or resized away by [`Self::realloc`], and no longer than the arena
    /// lives.
    pub unsafe fn alloc(&mut self, bytes: usize) -> Result<*mut u8, AllocError> {
        if bytes == 0 {
            return Ok(ptr::null_mut());
        }
        let size = bytes_to_units(bytes);
        if size > MAX_STORED_SIZE {
            return Err(AllocError::RequestTooLarge);
        }
        self.alloc_units(size)
    }

    /// Returns a block to its size-class list.
    ///
    /// A null pointer is ignored. Passing a pointer that is not the
    /// payload of a currently allocated block aborts the process.
    ///
    /// # Safety
    /// `ptr` must be null or a payload pointer obtained from this arena
    /// and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let block = self.checked_block(ptr);
        self.retire(block);
    }

    /// Resizes the block at `ptr` to at least `bytes` bytes.
    ///
    /// A null `ptr` behaves as [`Self::alloc`]; zero `bytes` frees the
    /// block and returns a null pointer as a success value.
    /// The returned pointer may differ from `ptr`; the first
    /// `min(old, new)` payload bytes are preserved. On error the original
    /// block is left untouched.
    ///
    /// # Safety
    /// As for [`Self::free`].
    pub unsafe fn realloc(&mut self, ptr: *mut u8, bytes: usize) -> Result<*mut u8, AllocError> {
        if ptr.is_null() {
            return self.alloc(bytes);
        }
        if bytes == 0 {
            self.free(ptr);
            return Ok(ptr::null_mut());
        }

        let size = bytes_to_units(bytes);
        if size > MAX_STORED_SIZE {
            return Err(AllocError::RequestTooLarge);
        }

        let block = self.checked_block(ptr);
        let prev_size = block.size();

        if size == prev_size {
            return Ok(ptr);
        }
        if size < prev_size {
            return Ok(self.shrink(block, size));
        }
        self.grow(block, size)
    }

    unsafe fn alloc_units(&mut self, size: usize) -> Result<*mut u8, AllocError> {
        let class = class_of(size);

        if let Some(head) = self.lists.head(class) {
            // small classes hold a single stored size, the head fits
            if class < NUM_SMALL_CLASSES {
                return Ok(self.claim(head));
            }
            return self.alloc_scan(class, size);
        }
        self.alloc_from_higher(class, size)
    }

    /// First-fit over a medium or large class list.
    unsafe fn alloc_scan(&mut self, class: usize, size: usize) -> Result<*mut u8, AllocError> {
        debug_assert_eq!(class, class_of(size));

        match self.lists.first_fit(class, size) {
            Some(block) => Ok(self.split(block, size)),
            None => self.alloc_from_higher(class, size),
        }
    }

    /// Serves from the head of the lowest non-empty class above `class`,
    /// which fits by the class bounds alone, or carves from the frontier
    /// when every higher class is empty.
    unsafe fn alloc_from_higher(&mut self, class: usize, size: usize) -> Result<*mut u8, AllocError> {
        debug_assert_eq!(class, class_of(size));

        match self.lists.first_head_above(class) {
            Some(head) => Ok(self.split(head, size)),
            None => self.carve_frontier(size),
        }
    }

    /// Removes a free block from its list and marks it allocated.
    unsafe fn claim(&mut self, block: BlockPtr<FOOTERED>) -> *mut u8 {
        debug_assert!(!block.is_alloc());
        debug_assert_eq!(block.class(), class_of(block.size()));

        block.set_alloc(true);
        self.lists.unlink(block);
        block.sync_footer();
        block.payload()
    }

    /// Marks an allocated block free and appends it to its class list.
    unsafe fn retire(&mut self, block: BlockPtr<FOOTERED>) {
        debug_assert!(block.is_alloc());

        block.set_alloc(false);
        block.set_class(class_of(block.size()));
        self.lists.push_back(block);
        block.sync_footer();
    }

    /// Claims `block` for a request of stored size `size`, cleaving the
    /// tail off as a new free block when it is large enough to stand on
    /// its own.
    unsafe fn split(&mut self, block: BlockPtr<FOOTERED>, size: usize) -> *mut u8 {
        debug_assert!(size <= block.size());

        let prev_size = block.size();
        let payload = self.claim(block);

        // the tail must be able to host a whole block, metadata included
        let remaining = prev_size - size;
        if remaining < Self::MIN_UNITS {
            return payload;
        }

        block.set_size(size);
        block.sync_footer();

        let tail = block.next_in_heap();
        tail.set_header(Header::new(remaining - Self::MIN_UNITS, true, 0));
        self.retire(tail);

        payload
    }

    /// Carves a fresh block at the arena frontier, growing the heap.
    unsafe fn carve_frontier(&mut self, size: usize) -> Result<*mut u8, AllocError> {
        let block = BlockPtr::<FOOTERED>::from_header_ptr(self.next);

        self.grow_heap(Self::MIN_UNITS + size)?;

        block.set_header(Header::new(size, true, 0));
        block.sync_footer();
        Ok(block.payload())
    }

    /// Extends the arena by `units`, splitting oversized requests into
    /// per-call chunks the host accepts. On any failure the arena is
    /// restored to the size it had at entry.
    fn grow_heap(&mut self, units: usize) -> Result<(), AllocError> {
        debug_assert!(units > 0);

        let prev_size = self.host.heap_size();
        let chunk = self.host.sbrk_max();
        let mut bytes = units as u64 * UNIT_BYTES as u64;

        while bytes >= chunk as u64 {
            if self.host.sbrk(chunk).is_err() {
                return self.restore_heap(prev_size);
            }
            bytes -= chunk as u64;
        }
        if bytes > 0 && self.host.sbrk(bytes as usize).is_err() {
            return self.restore_heap(prev_size);
        }

        debug!("arena grew by {units} units to {} bytes", self.host.heap_size());
        self.next = unsafe { self.next.add(units) };
        Ok(())
    }

    fn restore_heap(&mut self, prev_size: usize) -> Result<(), AllocError> {
        self.host.reset_brk();

        let chunk = self.host.sbrk_max();
        let mut bytes = prev_size;
        while bytes > 0 {
            let step = bytes.min(chunk);
            if self.host.sbrk(step).is_err() {
                break;
            }
            bytes -= step;
        }

        debug_assert_eq!(self.host.heap_size(), prev_size);
        Err(AllocError::HeapExhausted)
    }

    /// Shrinks in place, releasing the tail when it can form a block.
    unsafe fn shrink(&mut self, block: BlockPtr<FOOTERED>, size: usize) -> *mut u8 {
        let remaining = block.size() - size;
        if remaining < Self::MIN_UNITS {
            return block.payload();
        }

        block.set_size(size);
        block.sync_footer();

        let tail = block.next_in_heap();
        tail.set_header(Header::new(remaining - Self::MIN_UNITS, true, 0));
        self.retire(tail);

        block.payload()
    }

    /// Grows the block to stored size `size`: right-coalesce, then
    /// left-coalesce where footers permit, then arena extension at the
    /// frontier, then relocation.
    unsafe fn grow(&mut self, block: BlockPtr<FOOTERED>, size: usize) -> Result<*mut u8, AllocError> {
        let prev_size = block.size();
        let needed = size - prev_size;
        let right = block.next_in_heap();

        // gather free blocks to the right until the request is covered
        let mut total = 0;
        let mut iter = right;
        while total < needed && iter.as_units() < self.next && !iter.is_alloc() {
            total += iter.total_units();
            iter = iter.next_in_heap();
        }
        let rightmost = iter;

        if total >= needed {
            return Ok(self.absorb_right(block, size, total - needed, right, rightmost));
        }

        if FOOTERED {
            // gather free blocks leftward through the footers
            let left = block.prev_in_heap(self.heap_lo());
            let mut leftmost = left;
            while total < needed {
                match leftmost {
                    Some(prev) if !prev.is_alloc() => {
                        total += prev.total_units();
                        leftmost = prev.prev_in_heap(self.heap_lo());
                    }
                    _ => break,
                }
            }

            if total >= needed {
                return Ok(self.absorb_both(block, size, total - needed, right, rightmost, left, leftmost));
            }

            if rightmost.as_units() == self.next {
                return self.extend_at_frontier(block, size, needed - total, right, rightmost, left, leftmost);
            }
        } else if rightmost.as_units() == self.next {
            return self.extend_at_frontier(block, size, needed - total, right, rightmost, None, None);
        }

        self.relocate(block, size)
    }

    /// Absorbs the free run `[right, rightmost)`, splitting the last
    /// block of the run when a legal remainder survives.
    unsafe fn absorb_right(
        &mut self,
        block: BlockPtr<FOOTERED>,
        size: usize,
        extra: usize,
        right: BlockPtr<FOOTERED>,
        rightmost: BlockPtr<FOOTERED>,
    ) -> *mut u8 {
        let mut last = right;
        loop {
            let next = last.next_in_heap();
            if next.as_units() >= rightmost.as_units() {
                break;
            }
            self.claim(last);
            last = next;
        }

        if extra < Self::MIN_UNITS {
            trace!("resize: absorbing the whole right run");
            self.claim(last);
            block.set_size(size + extra);
        } else if extra > last.size() {
            // the remainder would eat into the last block's header; keep
            // one payload unit allocated there instead, unless even that
            // is impossible and the whole block has to go
            let last_size = last.size();
            if last_size < Self::MIN_UNITS {
                trace!("resize: right tail too small to split, absorbing");
                self.claim(last);
                block.set_size(size + extra);
            } else {
                trace!("resize: splitting the right tail at one payload unit");
                self.split(last, 0);
                block.set_size(size + extra - last_size);
            }
        } else {
            trace!("resize: splitting the right tail");
            self.split(last, last.size() - extra);
            block.set_size(size);
        }

        block.sync_footer();
        block.payload()
    }

    /// Absorbs free runs on both sides, rebuilding the block at the
    /// leftmost absorbed position and moving the payload there.
    unsafe fn absorb_both(
        &mut self,
        block: BlockPtr<FOOTERED>,
        size: usize,
        extra: usize,
        right: BlockPtr<FOOTERED>,
        rightmost: BlockPtr<FOOTERED>,
        left: Option<BlockPtr<FOOTERED>>,
        leftmost: Option<BlockPtr<FOOTERED>>,
    ) -> *mut u8 {
        let prev_size = block.size();

        self.claim_run(right, rightmost);
        let lowest = self
            .claim_left_run(left, leftmost)
            .expect("left coalesce requires a non-empty left run");

        let new_block;
        if extra < Self::MIN_UNITS {
            trace!("resize: coalescing left and right, absorbing the first block");
            new_block = lowest;
            new_block.set_header(Header::new(size + extra, true, 0));
        } else {
            trace!("resize: coalescing left and right with a free remainder at the left end");
            lowest.set_size(extra - Self::MIN_UNITS);
            self.retire(lowest);
            new_block = lowest.next_in_heap();
            new_block.set_header(Header::new(size, true, 0));
        }
        new_block.sync_footer();

        let new_ptr = new_block.payload();
        ptr::copy(block.payload() as *const u8, new_ptr, (prev_size + 1) * UNIT_BYTES);
        new_ptr
    }

    /// Grows the arena to cover the shortfall, absorbing the free run
    /// that reaches the frontier and, where footers permit, the free run
    /// on the left as well.
    unsafe fn extend_at_frontier(
        &mut self,
        block: BlockPtr<FOOTERED>,
        size: usize,
        shortfall: usize,
        right: BlockPtr<FOOTERED>,
        rightmost: BlockPtr<FOOTERED>,
        left: Option<BlockPtr<FOOTERED>>,
        leftmost: Option<BlockPtr<FOOTERED>>,
    ) -> Result<*mut u8, AllocError> {
        trace!("resize: extending the arena at the frontier");

        let prev_size = block.size();
        self.grow_heap(shortfall)?;
        self.claim_run(right, rightmost);

        if left == leftmost {
            block.set_size(size);
            block.sync_footer();
            return Ok(block.payload());
        }

        let lowest = self
            .claim_left_run(left, leftmost)
            .expect("left coalesce requires a non-empty left run");
        lowest.set_header(Header::new(size, true, 0));
        lowest.sync_footer();

        let new_ptr = lowest.payload();
        ptr::copy(block.payload() as *const u8, new_ptr, (prev_size + 1) * UNIT_BYTES);
        Ok(new_ptr)
    }

    /// Moves the payload into a freshly allocated block.
    unsafe fn relocate(&mut self, block: BlockPtr<FOOTERED>, size: usize) -> Result<*mut u8, AllocError> {
        trace!("resize: relocating");

        let prev_size = block.size();
        let new_ptr = self.alloc_units(size)?;

        if FOOTERED {
            ptr::copy(block.payload() as *const u8, new_ptr, (prev_size + 1) * UNIT_BYTES);
        } else {
            ptr::copy_nonoverlapping(block.payload() as *const u8, new_ptr, (prev_size + 1) * UNIT_BYTES);
        }
        self.retire(block);
        Ok(new_ptr)
    }

    /// Claims every block in `[from, until)`, a contiguous free run.
    unsafe fn claim_run(&mut self, from: BlockPtr<FOOTERED>, until: BlockPtr<FOOTERED>) {
        let mut cursor = from;
        while cursor.as_units() < until.as_units() {
            let next = cursor.next_in_heap();
            self.claim(cursor);
            cursor = next;
        }
    }

    /// Claims the free run `(leftmost, left]`, walking leftward, and
    /// returns its lowest-address block.
    unsafe fn claim_left_run(
        &mut self,
        left: Option<BlockPtr<FOOTERED>>,
        leftmost: Option<BlockPtr<FOOTERED>>,
    ) -> Option<BlockPtr<FOOTERED>> {
        let mut cursor = left;
        let mut lowest = None;

        while cursor != leftmost {
            match cursor {
                Some(block) => {
                    let prev = block.prev_in_heap(self.heap_lo());
                    self.claim(block);
                    lowest = Some(block);
                    cursor = prev;
                }
                None => break,
            }
        }
        lowest
    }

    /// Recovers the block behind a payload pointer, aborting on the
    /// contract violations this can detect.
    unsafe fn checked_block(&self, ptr: *mut u8) -> BlockPtr<FOOTERED> {
        let block = BlockPtr::<FOOTERED>::from_payload(ptr);

        if FOOTERED && !block.footer_matches() {
            eprintln!("{ptr:p} is not a valid block");
            eprintln!("  size according to header: {}", block.size());
            eprintln!("  size according to footer: {}", block.footer().size());
            process::abort();
        }
        if !block.is_alloc() {
            eprintln!("{ptr:p} is the payload of an already freed block");
            eprintln!("  payload size in {UNIT_BYTES}-byte units: {}", block.size() + 1);
            process::abort();
        }
        block
    }

    /// Verifies the arena invariants, panicking with a description on
    /// the first violation: blocks exactly cover the assigned range,
    /// every free block sits in the list its size names, the class
    /// chains are well formed, and footers mirror their headers.
    pub fn check_consistency(&self) {
        let mut free_per_class = [0usize; NUM_CLASSES];
        let heap_lo = self.heap_lo();

        assert_eq!(
            (self.next as usize - heap_lo as usize),
            self.host.heap_size(),
            "frontier does not match the assigned heap size",
        );

        unsafe {
            let mut cursor = heap_lo;
            while cursor < self.next {
                let block = BlockPtr::<FOOTERED>::from_header_ptr(cursor);
                assert!(
                    cursor.add(block.total_units()) <= self.next,
                    "block at {cursor:p} reaches past the frontier",
                );
                assert!(
                    block.footer_matches(),
                    "footer does not mirror header at {cursor:p}",
                );
                if !block.is_alloc() {
                    assert_eq!(
                        block.class(),
                        class_of(block.size()),
                        "free block at {cursor:p} is filed under the wrong class",
                    );
                    free_per_class[block.class()] += 1;
                }
                cursor = cursor.add(block.total_units());
            }
            assert_eq!(cursor, self.next, "block walk overshot the frontier");

            for class in 0..NUM_CLASSES {
                let mut count = 0;
                let mut prev = None;
                let mut cursor = self.lists.head(class);
                while let Some(block) = cursor {
                    assert!(!block.is_alloc(), "allocated block on the class {class} list");
                    assert_eq!(block.class(), class, "class {class} chain holds a foreign block");
                    assert_eq!(block.list_prev(), prev, "broken prev link in class {class}");
                    count += 1;
                    prev = cursor;
                    cursor = block.list_next();
                }
                assert_eq!(
                    self.lists.last(class),
                    prev,
                    "class {class} tail does not terminate its chain",
                );
                assert_eq!(
                    count, free_per_class[class],
                    "class {class} chain length disagrees with the heap walk",
                );
            }
        }
    }
}
