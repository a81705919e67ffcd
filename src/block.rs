use crate::header::{Header, Unit};
use std::ptr;

/// View over one heap block, addressed at its header unit.
///
/// The memory behind the pointer belongs to the arena. Every accessor
/// that touches it requires the block to lie inside the assigned heap
/// range with a well-formed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockPtr<const FOOTERED: bool> {
    ptr: *mut Unit,
}

impl<const FOOTERED: bool> BlockPtr<FOOTERED> {
    /// Smallest legal block span in units, metadata included.
    pub const MIN_BLOCK_UNITS: usize = if FOOTERED { 3 } else { 2 };

    pub fn from_header_ptr(ptr: *mut Unit) -> Self {
        BlockPtr { ptr }
    }

    /// The block whose payload starts at `payload`.
    pub unsafe fn from_payload(payload: *mut u8) -> Self {
        BlockPtr {
            ptr: (payload as *mut Unit).sub(1),
        }
    }

    pub fn as_units(self) -> *mut Unit {
        self.ptr
    }

    pub unsafe fn payload(self) -> *mut u8 {
        self.ptr.add(1) as *mut u8
    }

    pub unsafe fn header(self) -> Header {
        Header::from_bits(self.ptr.read())
    }

    pub unsafe fn set_header(self, header: Header) {
        self.ptr.write(header.bits());
    }

    pub unsafe fn size(self) -> usize {
        self.header().size()
    }

    pub unsafe fn set_size(self, size: usize) {
        self.set_header(self.header().with_size(size));
    }

    pub unsafe fn is_alloc(self) -> bool {
        self.header().is_alloc()
    }

    pub unsafe fn set_alloc(self, alloc: bool) {
        self.set_header(self.header().with_alloc(alloc));
    }

    pub unsafe fn class(self) -> usize {
        self.header().class()
    }

    pub unsafe fn set_class(self, class: usize) {
        self.set_header(self.header().with_class(class));
    }

    /// Total span in units, metadata included.
    pub unsafe fn total_units(self) -> usize {
        self.size() + Self::MIN_BLOCK_UNITS
    }

    /// The block immediately after this one in the heap, not in any list.
    pub unsafe fn next_in_heap(self) -> Self {
        BlockPtr {
            ptr: self.ptr.add(self.total_units()),
        }
    }

    /// The block immediately before this one, located through the
    /// preceding footer. `None` at the base of the heap.
    pub unsafe fn prev_in_heap(self, heap_lo: *mut Unit) -> Option<Self> {
        debug_assert!(FOOTERED);
        if self.ptr == heap_lo {
            return None;
        }
        let footer = Header::from_bits(self.ptr.sub(1).read());
        Some(BlockPtr {
            ptr: self.ptr.sub(Self::MIN_BLOCK_UNITS + footer.size()),
        })
    }

    pub unsafe fn footer(self) -> Header {
        Header::from_bits(self.footer_ptr().read())
    }

    /// Copies the header word into the footer slot. No-op without footers.
    pub unsafe fn sync_footer(self) {
        if FOOTERED {
            self.footer_ptr().write(self.ptr.read());
        }
    }

    pub unsafe fn footer_matches(self) -> bool {
        if !FOOTERED {
            return true;
        }
        self.footer_ptr().read() == self.ptr.read()
    }

    unsafe fn footer_ptr(self) -> *mut Unit {
        self.ptr.add(self.total_units() - 1)
    }

    // Free blocks thread their class list through the first two payload
    // units: unit 0 holds prev, unit 1 holds next.

    pub unsafe fn list_prev(self) -> Option<Self> {
        Self::decode(self.link_slot(0).read())
    }

    pub unsafe fn set_list_prev(self, block: Option<Self>) {
        self.link_slot(0).write(Self::encode(block));
    }

    pub unsafe fn list_next(self) -> Option<Self> {
        Self::decode(self.link_slot(1).read())
    }

    pub unsafe fn set_list_next(self, block: Option<Self>) {
        self.link_slot(1).write(Self::encode(block));
    }

    unsafe fn link_slot(self, index: usize) -> *mut *mut Unit {
        self.ptr.add(1 + index) as *mut *mut Unit
    }

    fn encode(block: Option<Self>) -> *mut Unit {
        match block {
            Some(block) => block.ptr,
            None => ptr::null_mut(),
        }
    }

    fn decode(ptr: *mut Unit) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(BlockPtr { ptr })
        }
    }
}
