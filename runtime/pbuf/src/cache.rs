//! Data cache maintenance hooks
//!
//! When the two peers do not share a coherent view of the region the
//! producer must write back everything it publishes and the consumer must
//! invalidate everything before it looks. The hooks are only invoked for
//! rings created with [`RingFlags::CACHE`](crate::RingFlags::CACHE).

/// Platform cache maintenance
pub trait DataCache: Sync {
    /// Push `len` bytes at `addr` out to memory visible to the peer
    fn writeback(&self, addr: *const u8, len: usize);

    /// Drop any cached copy of `len` bytes at `addr`
    fn invalidate(&self, addr: *const u8, len: usize);
}

/// No-op maintenance for coherent memory
#[derive(Debug, Default, Clone, Copy)]
pub struct Coherent;

impl DataCache for Coherent {
    fn writeback(&self, _addr: *const u8, _len: usize) {}

    fn invalidate(&self, _addr: *const u8, _len: usize) {}
}

/// Shared instance used by rings that were not given a cache
pub static COHERENT: Coherent = Coherent;
