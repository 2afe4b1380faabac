//! Shared memory layout of a packet buffer
//!
//! Both peers must agree on every offset here bit-for-bit, so the layout is
//! expressed as plain byte offsets rather than a `repr(C)` struct: the write
//! index moves depending on [`RingFlags::CACHE`], and the data area length is
//! only known at runtime.

use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;

use bitflags::bitflags;
use static_assertions::{assert_eq_align, assert_eq_size, const_assert, const_assert_eq};

use crate::region::Region;
use crate::{PbufError, Result};

/// Data cache line size assumed for both peers when [`RingFlags::CACHE`] is set
pub const DCACHE_LINE: usize = 32;

/// Maximum allocation request. Requesting exactly this asks for the largest
/// span available.
pub const MAX_LEN: u16 = 0xFF00;

/// Size of the per-frame header word (16-bit length + 2 reserved bytes)
pub const FRAME_HEADER_LEN: u32 = 4;

/// Bytes always left unused so that a full buffer differs from an empty one
pub const FREE_SPACE_DISTANCE: u32 = 4;

/// Length value marking "wrapped, continue at offset 0"
pub(crate) const PADDING_MARK: u16 = 0xFFFF;

pub(crate) const WORD: u32 = 4;

const LEN_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 4;
const RD_IDX_OFFSET: usize = 8;
const COMMON_SIZE: usize = 12;

const UTILIZATION_OFFSET: u32 = 8;
const UTILIZATION_BITS: u32 = 24;
const FLAGS_MASK: u32 = (1 << UTILIZATION_OFFSET) - 1;

const_assert!(DCACHE_LINE.is_power_of_two());
const_assert!(DCACHE_LINE >= COMMON_SIZE);
const_assert_eq!(MAX_LEN as u32 % WORD, 0);
const_assert!((PADDING_MARK as u32) > MAX_LEN as u32);
assert_eq_size!(AtomicU32, u32);
assert_eq_align!(AtomicU32, u32);

bitflags! {
    /// Option flags stored in the low byte of the header flags word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RingFlags: u32 {
        /// Region is not coherent between the peers: pad the header to a
        /// cache line and run cache maintenance around every publish/consume
        const CACHE = 1 << 0;
        /// Consumer records the peak number of occupied bytes
        const UTILIZATION = 1 << 1;
    }
}

impl RingFlags {
    pub(crate) fn from_word(word: u32) -> Self {
        RingFlags::from_bits_truncate(word & FLAGS_MASK)
    }
}

pub(crate) fn utilization_of(word: u32) -> u32 {
    word >> UTILIZATION_OFFSET
}

pub(crate) fn with_utilization(word: u32, used: u32) -> u32 {
    let used = used.min((1 << UTILIZATION_BITS) - 1);
    (word & FLAGS_MASK) | (used << UTILIZATION_OFFSET)
}

/// Offsets of the producer-owned half of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeaderLayout {
    pub wr_idx: usize,
    pub data: usize,
}

impl HeaderLayout {
    pub const fn for_flags(flags: RingFlags) -> Self {
        let wr_idx = if flags.contains(RingFlags::CACHE) {
            DCACHE_LINE
        } else {
            COMMON_SIZE
        };

        Self {
            wr_idx,
            data: wr_idx + WORD as usize,
        }
    }
}

/// Round `len` up to the next word boundary
pub(crate) const fn align_word(len: u32) -> u32 {
    (len + WORD - 1) & !(WORD - 1)
}

/// Bytes a payload of `len` bytes occupies in the data area
pub const fn frame_size(len: usize) -> usize {
    FRAME_HEADER_LEN as usize + align_word(len as u32) as usize
}

/// Required base alignment of a region created with `flags`
pub const fn region_alignment(flags: RingFlags) -> usize {
    if flags.contains(RingFlags::CACHE) {
        DCACHE_LINE
    } else {
        WORD as usize
    }
}

/// Smallest region able to carry a one-byte frame
pub const fn min_region_size(flags: RingFlags) -> usize {
    HeaderLayout::for_flags(flags).data + frame_size(1) + FREE_SPACE_DISTANCE as usize
}

/// Validate a region for [`crate::Producer::init`] without touching it
///
/// # Returns
/// Length of the data area that the header will advertise
///
/// # Errors
/// - `InvalidAlignment` if the base is not aligned for `flags`
/// - `RegionTooSmall` if not even a one-byte frame would fit
pub fn check_region(region: &Region<'_>, flags: RingFlags) -> Result<u32> {
    let required = region_alignment(flags);
    if region.addr() % required != 0 {
        return Err(PbufError::InvalidAlignment {
            addr: region.addr(),
            required,
        });
    }

    let min = min_region_size(flags);
    if region.len() < min {
        return Err(PbufError::RegionTooSmall {
            size: region.len(),
            min,
        });
    }

    let data = region.len() - HeaderLayout::for_flags(flags).data;
    let data = data.min(u32::MAX as usize) as u32;
    Ok(data & !(WORD - 1))
}

/// Point-in-time view of a ring's header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingState {
    /// Length of the data area advertised by the producer
    pub len: u32,
    /// Option flags (utilization bits stripped)
    pub flags: RingFlags,
    /// Offset of the next unread frame
    pub read_index: u32,
    /// Offset of the next free byte
    pub write_index: u32,
}

impl RingState {
    /// Whether no committed frame is pending
    pub fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    /// Bytes between the read and write index, including wrap padding
    pub fn occupied(&self) -> u32 {
        occupied(self.len, self.write_index, self.read_index)
    }
}

/// Bytes stored between `rd` and `wr` in a data area of `len` bytes
pub(crate) fn occupied(len: u32, wr: u32, rd: u32) -> u32 {
    if wr >= rd {
        wr - rd
    } else {
        len - (rd - wr)
    }
}

/// Raw view over the header words and data area of a region
///
/// Every shared header word is accessed through an `AtomicU32`; the data
/// area is handed out as byte slices whose disjointness is guaranteed by the
/// SPSC protocol.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawRing {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the pointer targets shared memory that outlives the owning
// producer or consumer; which bytes each side touches is fixed by the ring
// protocol, not by the thread it runs on.
unsafe impl Send for RawRing {}

impl RawRing {
    pub fn new(region: &Region<'_>) -> Self {
        Self {
            base: region.base(),
            size: region.len(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + WORD as usize <= self.size);
        debug_assert_eq!((self.base.as_ptr() as usize + offset) % WORD as usize, 0);
        // SAFETY: the region is word aligned and at least `min_region_size`
        // bytes long (checked when the handle was created), and `AtomicU32`
        // has the layout of `u32`.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU32) }
    }

    pub fn len_word(&self) -> &AtomicU32 {
        self.word(LEN_OFFSET)
    }

    pub fn flags_word(&self) -> &AtomicU32 {
        self.word(FLAGS_OFFSET)
    }

    pub fn rd_idx(&self) -> &AtomicU32 {
        self.word(RD_IDX_OFFSET)
    }

    pub fn wr_idx(&self, layout: HeaderLayout) -> &AtomicU32 {
        self.word(layout.wr_idx)
    }

    pub fn common_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub fn common_len(&self) -> usize {
        COMMON_SIZE
    }

    pub fn wr_idx_ptr(&self, layout: HeaderLayout) -> *const u8 {
        // SAFETY: in bounds, see `word`.
        unsafe { self.base.as_ptr().add(layout.wr_idx) }
    }

    /// Pointer to `offset` within the data area
    pub fn data_ptr(&self, layout: HeaderLayout, offset: u32) -> *mut u8 {
        debug_assert!(layout.data + offset as usize <= self.size);
        // SAFETY: callers keep `offset` within the advertised data length,
        // which never exceeds the region.
        unsafe { self.base.as_ptr().add(layout.data + offset as usize) }
    }

    /// Largest data length this region can hold for `layout`
    pub fn data_capacity(&self, layout: HeaderLayout) -> u32 {
        let data = self.size.saturating_sub(layout.data);
        (data.min(u32::MAX as usize) as u32) & !(WORD - 1)
    }

    pub fn read_frame_len(&self, layout: HeaderLayout, offset: u32) -> u16 {
        let ptr = self.data_ptr(layout, offset);
        // SAFETY: a frame header word is always in bounds of the data area.
        let bytes = unsafe { [ptr.read_volatile(), ptr.add(1).read_volatile()] };
        u16::from_be_bytes(bytes)
    }

    pub fn write_frame_len(&self, layout: HeaderLayout, offset: u32, len: u16) {
        let ptr = self.data_ptr(layout, offset);
        let [hi, lo] = len.to_be_bytes();
        // SAFETY: the header word at `offset` belongs to the producer until
        // the write index moves past it.
        unsafe {
            ptr.write_volatile(hi);
            ptr.add(1).write_volatile(lo);
        }
    }
}
