//! Memory regions a packet buffer can be placed over

use core::marker::PhantomData;
use core::ptr::NonNull;

/// A view of shared memory handed to exactly one ring end
///
/// A region does not own its bytes: the peer on the other side of the ring
/// holds a second view of the same span. The producer/consumer protocol
/// decides which bytes each view may touch at any time.
#[derive(Debug)]
pub struct Region<'a> {
    base: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

// SAFETY: a region is only a pointer/length pair; the ring protocol layered
// on top serializes access between its two holders.
unsafe impl Send for Region<'_> {}

impl<'a> Region<'a> {
    /// Borrow a buffer exclusively as a region
    pub fn new(buf: &'a mut [u8]) -> Self {
        let len = buf.len();
        Self {
            base: NonNull::from(buf).cast(),
            len,
            _marker: PhantomData,
        }
    }

    /// Build a region from a raw address, e.g. a linker-placed shared SRAM
    /// section
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    /// `ptr..ptr + len` must stay valid for reads and writes for `'a`, and
    /// apart from the peer's view of the same span nothing else may access
    /// it while the region is alive.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|base| Self {
            base,
            len,
            _marker: PhantomData,
        })
    }

    /// Start address of the region
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }
}

#[cfg(feature = "alloc")]
pub use owned::SharedMemory;

#[cfg(feature = "alloc")]
mod owned {
    use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
    use core::ops::Range;
    use core::ptr::NonNull;

    use super::Region;
    use crate::layout::DCACHE_LINE;

    /// Heap block standing in for a shared SRAM window
    ///
    /// Used when both ends of a ring live in one process (host emulation and
    /// tests). The block is zeroed and cache-line aligned.
    #[derive(Debug)]
    pub struct SharedMemory {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    // SAFETY: the block is plain memory; views handed out by `split` carry
    // the borrow that keeps it alive.
    unsafe impl Send for SharedMemory {}
    unsafe impl Sync for SharedMemory {}

    impl SharedMemory {
        /// Allocate `len` zeroed bytes aligned to [`DCACHE_LINE`]
        pub fn new(len: usize) -> Self {
            let size = len.max(1);
            let layout = match Layout::from_size_align(size, DCACHE_LINE) {
                Ok(layout) => layout,
                Err(_) => handle_alloc_error(Layout::new::<u8>()),
            };

            // SAFETY: `layout` has a non-zero size.
            let raw = unsafe { alloc_zeroed(layout) };
            let ptr = match NonNull::new(raw) {
                Some(ptr) => ptr,
                None => handle_alloc_error(layout),
            };

            Self { ptr, layout }
        }

        pub fn len(&self) -> usize {
            self.layout.size()
        }

        pub fn is_empty(&self) -> bool {
            false
        }

        /// Hand out the producer view and the consumer view of the whole block
        pub fn split(&mut self) -> (Region<'_>, Region<'_>) {
            let len = self.len();
            self.views(0, len)
        }

        /// Like [`split`](Self::split), restricted to `range`
        ///
        /// Returns `None` if the range is out of bounds.
        pub fn split_range(&mut self, range: Range<usize>) -> Option<(Region<'_>, Region<'_>)> {
            if range.start > range.end || range.end > self.len() {
                return None;
            }
            Some(self.views(range.start, range.end - range.start))
        }

        /// Contents of the whole block
        pub fn bytes(&self) -> &[u8] {
            // SAFETY: no view is alive while `&self` is shared, since views
            // borrow `self` mutably.
            unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
        }

        /// Mutable contents of the whole block
        pub fn bytes_mut(&mut self) -> &mut [u8] {
            // SAFETY: as for `bytes`, with exclusive access.
            unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
        }

        fn views(&mut self, offset: usize, len: usize) -> (Region<'_>, Region<'_>) {
            // SAFETY: `offset + len` is within the allocation, which outlives
            // the `&mut self` borrow both views are tied to.
            let base = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
            let view = Region {
                base,
                len,
                _marker: core::marker::PhantomData,
            };
            let peer = Region {
                base,
                len,
                _marker: core::marker::PhantomData,
            };
            (view, peer)
        }
    }

    impl Drop for SharedMemory {
        fn drop(&mut self) {
            // SAFETY: allocated in `new` with the same layout.
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
        }
    }
}
