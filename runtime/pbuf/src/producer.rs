//! Producer end of a packet buffer

use core::sync::atomic::Ordering;

use log::{debug, trace};

use crate::cache::{DataCache, COHERENT};
use crate::layout::{
    align_word, check_region, occupied, HeaderLayout, RawRing, RingFlags, RingState,
    FRAME_HEADER_LEN, FREE_SPACE_DISTANCE, MAX_LEN, PADDING_MARK,
};
use crate::region::Region;
use crate::{PbufError, Result};

/// What [`Producer::write`] does when the free span is shorter than the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    /// Write as much as fits and report the shorter length
    #[default]
    BestEffort,
    /// Write the whole frame or nothing
    Exact,
}

/// Outcome of looking for space, computed without touching the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    /// Continue at offset 0, leaving a padding marker at the current index
    wrap: bool,
    /// Payload bytes available at the chosen position
    grant: u32,
}

/// Writing end of a packet buffer
///
/// Owns the write index. Created by [`Producer::init`], which lays out a
/// fresh header over the region.
pub struct Producer<'a> {
    ring: RawRing,
    layout: HeaderLayout,
    flags: RingFlags,
    len: u32,
    wr: u32,
    granted: Option<u32>,
    policy: AllocPolicy,
    cache: &'a dyn DataCache,
    _region: Region<'a>,
}

impl<'a> Producer<'a> {
    /// Initialize a ring over `region` and take its producer end
    ///
    /// # Errors
    /// - `InvalidAlignment` / `RegionTooSmall` from [`check_region`]
    pub fn init(region: Region<'a>, flags: RingFlags) -> Result<Self> {
        Self::init_with_cache(region, flags, &COHERENT)
    }

    /// Like [`init`](Self::init) with platform cache maintenance
    pub fn init_with_cache(
        region: Region<'a>,
        flags: RingFlags,
        cache: &'a dyn DataCache,
    ) -> Result<Self> {
        let len = check_region(&region, flags)?;
        let ring = RawRing::new(&region);
        let layout = HeaderLayout::for_flags(flags);

        let producer = Self {
            ring,
            layout,
            flags,
            len,
            wr: 0,
            granted: None,
            policy: AllocPolicy::default(),
            cache,
            _region: region,
        };

        ring.flags_word().store(flags.bits(), Ordering::Relaxed);
        ring.rd_idx().store(0, Ordering::Relaxed);
        ring.wr_idx(layout).store(0, Ordering::Relaxed);
        ring.len_word().store(len, Ordering::Release);
        producer.writeback(ring.common_ptr(), ring.common_len());
        producer.writeback(ring.wr_idx_ptr(layout), FRAME_HEADER_LEN as usize);

        debug!(
            "pbuf: initialized {} byte ring ({} data bytes, flags {:?})",
            ring.size(),
            len,
            flags
        );
        Ok(producer)
    }

    /// Select the [`AllocPolicy`] used by [`write`](Self::write)
    pub fn with_policy(mut self, policy: AllocPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    pub fn flags(&self) -> RingFlags {
        self.flags
    }

    /// Largest payload a single frame can ever carry in this ring
    pub fn capacity(&self) -> usize {
        (self.len - FREE_SPACE_DISTANCE - FRAME_HEADER_LEN) as usize
    }

    /// Reserve up to `len` contiguous bytes
    ///
    /// The span stays invisible to the consumer until [`commit`](Self::commit).
    /// If the frame does not fit whole before the end of the data area, the
    /// larger of the tail and head spans is used. Wrapping to the head is
    /// published immediately. Passing [`MAX_LEN`] asks for the largest span
    /// available.
    ///
    /// # Errors
    /// - `InvalidLength` if `len` is 0 or above [`MAX_LEN`]
    /// - `Full` if not a single byte can be granted
    pub fn alloc(&mut self, len: usize) -> Result<&mut [u8]> {
        if len == 0 || len > MAX_LEN as usize {
            return Err(PbufError::InvalidLength { len });
        }

        let plan = self.plan(len as u32);
        if plan.grant == 0 {
            self.granted = None;
            return Err(PbufError::Full { requested: len });
        }

        Ok(self.apply(plan))
    }

    /// Publish the first `len` bytes of the last allocation
    ///
    /// # Errors
    /// - `InvalidLength` if nothing is allocated, `len` is 0, or `len`
    ///   exceeds the allocated span
    pub fn commit(&mut self, len: usize) -> Result<()> {
        let granted = self.granted.take().unwrap_or(0) as usize;
        if len == 0 || len > granted {
            return Err(PbufError::InvalidLength { len });
        }

        let wr = self.wr;
        self.ring.write_frame_len(self.layout, wr, len as u16);
        let frame = FRAME_HEADER_LEN + align_word(len as u32);
        self.writeback(self.ring.data_ptr(self.layout, wr), frame as usize);

        let mut next = wr + frame;
        if next == self.len {
            next = 0;
        }
        self.publish(next);

        trace!("pbuf: committed {} byte frame at {}, wr_idx {}", len, wr, next);
        Ok(())
    }

    /// Copy `buf` into the ring as one frame
    ///
    /// # Returns
    /// Number of bytes written. Under [`AllocPolicy::BestEffort`] this may be
    /// less than `buf.len()`.
    ///
    /// # Errors
    /// - `InvalidLength` if `buf` is empty or not shorter than [`MAX_LEN`]
    /// - `OutOfSpace` if the frame can never fit this ring
    /// - `Full` if there is currently no room (under `Exact`, no room for the
    ///   whole frame); the ring is left untouched
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let len = buf.len();
        if len == 0 || len >= MAX_LEN as usize {
            return Err(PbufError::InvalidLength { len });
        }
        if len > self.capacity() {
            return Err(PbufError::OutOfSpace {
                requested: len,
                capacity: self.capacity(),
            });
        }

        let plan = self.plan(len as u32);
        let short = (plan.grant as usize) < len;
        if plan.grant == 0 || (short && self.policy == AllocPolicy::Exact) {
            return Err(PbufError::Full { requested: len });
        }

        let span = self.apply(plan);
        let written = span.len();
        span.copy_from_slice(&buf[..written]);
        self.commit(written)?;

        if short {
            debug!("pbuf: short write, {} of {} bytes", written, len);
        }
        Ok(written)
    }

    /// Whether not even a one-byte frame fits right now
    ///
    /// A snapshot: the consumer may free space at any moment.
    pub fn is_full(&self) -> bool {
        self.plan(1).grant == 0
    }

    /// Current header contents
    pub fn state(&self) -> RingState {
        RingState {
            len: self.len,
            flags: self.flags,
            read_index: self.load_rd(),
            write_index: self.wr,
        }
    }

    fn plan(&self, len: u32) -> Plan {
        let rd = self.load_rd();
        let wr = self.wr;
        let need = FRAME_HEADER_LEN + align_word(len);

        let (wrap, space) = if wr >= rd {
            // Reaching the end with rd at 0 would make the ring look empty.
            let reserve = if rd == 0 { FREE_SPACE_DISTANCE } else { 0 };
            let tail = (self.len - wr).saturating_sub(reserve);
            let head = rd.saturating_sub(FREE_SPACE_DISTANCE);

            // A frame that does not fit whole at the end goes to the larger span.
            let wrap = tail < need && head > tail;
            (wrap, if wrap { head } else { tail })
        } else {
            (false, (rd - wr).saturating_sub(FREE_SPACE_DISTANCE))
        };

        Plan {
            wrap,
            grant: space.saturating_sub(FRAME_HEADER_LEN).min(len),
        }
    }

    fn apply(&mut self, plan: Plan) -> &mut [u8] {
        if plan.wrap {
            let wr = self.wr;
            self.ring.write_frame_len(self.layout, wr, PADDING_MARK);
            self.writeback(
                self.ring.data_ptr(self.layout, wr),
                FRAME_HEADER_LEN as usize,
            );
            self.publish(0);
            trace!("pbuf: wrapped at {}", wr);
        }

        self.granted = Some(plan.grant);
        let ptr = self.ring.data_ptr(self.layout, self.wr + FRAME_HEADER_LEN);
        // SAFETY: the plan keeps `wr + header + grant` inside the data area
        // and outside every byte the consumer may still read; the slice is
        // tied to `&mut self`, so only one allocation is live at a time.
        unsafe { core::slice::from_raw_parts_mut(ptr, plan.grant as usize) }
    }

    fn publish(&mut self, wr: u32) {
        self.wr = wr;
        self.ring.wr_idx(self.layout).store(wr, Ordering::Release);
        self.writeback(
            self.ring.wr_idx_ptr(self.layout),
            FRAME_HEADER_LEN as usize,
        );
    }

    fn load_rd(&self) -> u32 {
        if self.flags.contains(RingFlags::CACHE) {
            self.cache
                .invalidate(self.ring.common_ptr(), self.ring.common_len());
        }
        self.ring.rd_idx().load(Ordering::Acquire)
    }

    fn writeback(&self, addr: *const u8, len: usize) {
        if self.flags.contains(RingFlags::CACHE) {
            self.cache.writeback(addr, len);
        }
    }

    /// Bytes currently queued, including wrap padding
    pub fn occupied(&self) -> u32 {
        occupied(self.len, self.wr, self.load_rd())
    }
}

impl core::fmt::Debug for Producer<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Producer")
            .field("len", &self.len)
            .field("flags", &self.flags)
            .field("wr", &self.wr)
            .field("granted", &self.granted)
            .field("policy", &self.policy)
            .finish()
    }
}
