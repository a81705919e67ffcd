//! Segregated-fit memory allocation over an sbrk-style arena.
//!
//! The arena is a contiguous region obtained from a [`HostHeap`] and
//! managed in 8-byte units. Free blocks are indexed by eleven size
//! classes, each holding an unsorted doubly linked list threaded through
//! the blocks' own payloads. Two variants share one implementation:
//! [`SingleFit`] keeps a header per block, [`DoubleFit`] additionally
//! mirrors the header into a footer so resizes can coalesce with the
//! left heap neighbour instead of relocating.
//!
//! ```
//! use segfit::{DoubleFit, HostHeap};
//!
//! let mut arena = DoubleFit::new(HostHeap::new(1 << 20)?);
//! let p = unsafe { arena.alloc(256)? };
//! let p = unsafe { arena.realloc(p, 4096)? };
//! unsafe { arena.free(p) };
//! # Ok::<(), segfit::AllocError>(())
//! ```

mod allocator;
mod block;
mod error;
mod free_list;
mod header;
mod host;
mod size_class;

pub use allocator::{Allocator, DoubleFit, SingleFit};
pub use error::AllocError;
pub use host::HostHeap;
