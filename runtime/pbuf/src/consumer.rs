//! Consumer end of a packet buffer

use core::sync::atomic::Ordering;

use log::{trace, warn};

use crate::cache::{DataCache, COHERENT};
use crate::layout::{
    align_word, min_region_size, occupied, region_alignment, utilization_of, with_utilization,
    HeaderLayout, RawRing, RingFlags, RingState, FRAME_HEADER_LEN, MAX_LEN, PADDING_MARK, WORD,
};
use crate::region::Region;
use crate::{PbufError, Result};

/// Header fields as published by the producer
#[derive(Debug, Clone, Copy)]
struct Header {
    len: u32,
    flags: RingFlags,
    layout: HeaderLayout,
}

/// Location of a claimed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Claim {
    layout: HeaderLayout,
    offset: u32,
    len: u32,
}

/// Reading end of a packet buffer
///
/// Attaches to a region whose header the producer initializes, possibly
/// later. Until then the ring reads as empty.
pub struct Consumer<'a> {
    ring: RawRing,
    claimed: Option<Claim>,
    cache: &'a dyn DataCache,
    _region: Region<'a>,
}

impl<'a> Consumer<'a> {
    /// Take the consumer end of the ring placed over `region`
    ///
    /// # Errors
    /// - `InvalidAlignment` if the region is not word aligned
    /// - `RegionTooSmall` if the region cannot hold any ring
    pub fn attach(region: Region<'a>) -> Result<Self> {
        Self::attach_with_cache(region, &COHERENT)
    }

    /// Like [`attach`](Self::attach) with platform cache maintenance
    pub fn attach_with_cache(region: Region<'a>, cache: &'a dyn DataCache) -> Result<Self> {
        let required = region_alignment(RingFlags::empty());
        if region.addr() % required != 0 {
            return Err(PbufError::InvalidAlignment {
                addr: region.addr(),
                required,
            });
        }
        let min = min_region_size(RingFlags::empty());
        if region.len() < min {
            return Err(PbufError::RegionTooSmall {
                size: region.len(),
                min,
            });
        }

        Ok(Self {
            ring: RawRing::new(&region),
            claimed: None,
            cache,
            _region: region,
        })
    }

    /// Expose the next pending frame without consuming it
    ///
    /// Returns an empty slice when nothing is pending. The frame stays
    /// pending until [`free`](Self::free) is called with its length.
    pub fn claim(&mut self) -> &[u8] {
        self.claimed = self.locate();
        match self.claimed {
            Some(claim) => self.payload(claim),
            None => &[],
        }
    }

    /// Release the frame returned by the last [`claim`](Self::claim)
    ///
    /// # Errors
    /// - `InvalidLength` if no frame is claimed or `len` differs from the
    ///   claimed length
    pub fn free(&mut self, len: usize) -> Result<()> {
        let claim = match self.claimed.take() {
            Some(claim) if claim.len as usize == len => claim,
            other => {
                self.claimed = other;
                return Err(PbufError::InvalidLength { len });
            }
        };

        // The claim proved the header valid.
        let Some(header) = self.header() else {
            return Err(PbufError::InvalidLength { len });
        };

        let mut rd = claim.offset + FRAME_HEADER_LEN + align_word(claim.len);
        if rd == header.len {
            rd = 0;
        }
        self.store_rd(header, rd);

        trace!("pbuf: freed {} byte frame, rd_idx {}", len, rd);
        Ok(())
    }

    /// Copy the next frame into `buf` and consume it
    ///
    /// # Returns
    /// Length of the frame, or 0 if nothing was pending
    ///
    /// # Errors
    /// - `TooLarge` if the frame does not fit `buf`; the frame is kept
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let frame = self.claim();
        let len = frame.len();
        if len == 0 {
            return Ok(0);
        }
        if len > buf.len() {
            return Err(PbufError::TooLarge {
                frame: len,
                buf: buf.len(),
            });
        }

        buf[..len].copy_from_slice(frame);
        self.free(len)?;
        Ok(len)
    }

    /// Length of the next pending frame, 0 if none
    pub fn pending_len(&mut self) -> usize {
        self.locate().map_or(0, |claim| claim.len as usize)
    }

    /// Whether the read and write indices meet
    ///
    /// A snapshot: the producer may commit at any moment.
    pub fn is_empty(&self) -> bool {
        match self.header() {
            Some(header) => self.load_rd() == self.load_wr(header),
            None => true,
        }
    }

    /// Peak number of occupied bytes seen at claim time
    ///
    /// # Errors
    /// - `Unsupported` if the ring was not created with
    ///   [`RingFlags::UTILIZATION`]
    pub fn utilization(&self) -> Result<u32> {
        match self.header() {
            Some(header) if header.flags.contains(RingFlags::UTILIZATION) => {
                Ok(utilization_of(self.ring.flags_word().load(Ordering::Relaxed)))
            }
            _ => Err(PbufError::Unsupported),
        }
    }

    /// Current header contents; all zero before the producer initializes
    pub fn state(&self) -> RingState {
        match self.header() {
            Some(header) => RingState {
                len: header.len,
                flags: header.flags,
                read_index: self.load_rd(),
                write_index: self.load_wr(header),
            },
            None => RingState {
                len: 0,
                flags: RingFlags::empty(),
                read_index: 0,
                write_index: 0,
            },
        }
    }

    fn header(&self) -> Option<Header> {
        // Flags are unknown until read, so always refresh the common part.
        self.cache
            .invalidate(self.ring.common_ptr(), self.ring.common_len());

        let len = self.ring.len_word().load(Ordering::Acquire);
        if len == 0 {
            return None;
        }

        let flags = RingFlags::from_word(self.ring.flags_word().load(Ordering::Relaxed));
        let layout = HeaderLayout::for_flags(flags);
        if len % WORD != 0 || len > self.ring.data_capacity(layout) {
            warn!("pbuf: header advertises {} data bytes, ignoring ring", len);
            return None;
        }

        Some(Header { len, flags, layout })
    }

    fn locate(&mut self) -> Option<Claim> {
        let header = self.header()?;
        let wr = self.load_wr(header);
        let mut rd = self.load_rd();

        if rd >= header.len || wr >= header.len || rd % WORD != 0 || wr % WORD != 0 {
            warn!(
                "pbuf: corrupted indices rd {} wr {} (len {})",
                rd, wr, header.len
            );
            return None;
        }
        if rd == wr {
            return None;
        }

        if header.flags.contains(RingFlags::UTILIZATION) {
            self.record_utilization(occupied(header.len, wr, rd));
        }

        self.invalidate(header, rd, FRAME_HEADER_LEN);
        let mut len = self.ring.read_frame_len(header.layout, rd);
        if len == PADDING_MARK {
            rd = 0;
            self.store_rd(header, rd);
            if rd == wr {
                return None;
            }
            self.invalidate(header, rd, FRAME_HEADER_LEN);
            len = self.ring.read_frame_len(header.layout, rd);
        }

        let len = len as u32;
        let end = rd + FRAME_HEADER_LEN + align_word(len);
        if len == 0 || len > MAX_LEN as u32 || end > header.len {
            warn!("pbuf: corrupted frame header at {} (len {})", rd, len);
            return None;
        }

        self.invalidate(header, rd + FRAME_HEADER_LEN, len);
        Some(Claim {
            layout: header.layout,
            offset: rd,
            len,
        })
    }

    fn payload(&self, claim: Claim) -> &[u8] {
        let ptr = self
            .ring
            .data_ptr(claim.layout, claim.offset + FRAME_HEADER_LEN);
        // SAFETY: `locate` bounded the frame by the data length, and the
        // producer does not write past the read index until it is freed.
        unsafe { core::slice::from_raw_parts(ptr, claim.len as usize) }
    }

    fn record_utilization(&self, used: u32) {
        let word = self.ring.flags_word();
        let current = word.load(Ordering::Relaxed);
        if used > utilization_of(current) {
            word.store(with_utilization(current, used), Ordering::Relaxed);
            self.cache.writeback(self.ring.common_ptr(), self.ring.common_len());
        }
    }

    fn load_wr(&self, header: Header) -> u32 {
        if header.flags.contains(RingFlags::CACHE) {
            self.cache
                .invalidate(self.ring.wr_idx_ptr(header.layout), WORD as usize);
        }
        self.ring.wr_idx(header.layout).load(Ordering::Acquire)
    }

    fn load_rd(&self) -> u32 {
        self.ring.rd_idx().load(Ordering::Relaxed)
    }

    fn store_rd(&self, header: Header, rd: u32) {
        self.ring.rd_idx().store(rd, Ordering::Release);
        if header.flags.contains(RingFlags::CACHE) {
            self.cache
                .writeback(self.ring.common_ptr(), self.ring.common_len());
        }
    }

    fn invalidate(&self, header: Header, offset: u32, len: u32) {
        if header.flags.contains(RingFlags::CACHE) {
            self.cache
                .invalidate(self.ring.data_ptr(header.layout, offset), len as usize);
        }
    }
}

impl core::fmt::Debug for Consumer<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Consumer")
            .field("state", &self.state())
            .field("claimed", &self.claimed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::Producer;
    use crate::region::SharedMemory;

    const REGION: usize = 80;

    #[test]
    fn test_attach_before_producer_reads_empty() {
        let mut mem = SharedMemory::new(REGION);
        let (_, region) = mem.split();
        let mut consumer = Consumer::attach(region).unwrap();

        assert!(consumer.is_empty());
        assert!(consumer.claim().is_empty());
        assert_eq!(consumer.state().len, 0);
    }

    #[test]
    fn test_attach_rejects_small_region() {
        let mut mem = SharedMemory::new(8);
        let (_, region) = mem.split();
        assert!(matches!(
            Consumer::attach(region),
            Err(PbufError::RegionTooSmall { size: 8, .. })
        ));
    }

    #[test]
    fn test_write_then_read() {
        let mut mem = SharedMemory::new(REGION);
        let (tx, rx) = mem.split();
        let mut producer = Producer::init(tx, RingFlags::empty()).unwrap();
        let mut consumer = Consumer::attach(rx).unwrap();

        assert_eq!(producer.write(b"hello").unwrap(), 5);
        assert!(!consumer.is_empty());

        let mut buf = [0u8; 16];
        assert_eq!(consumer.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert!(consumer.is_empty());
        assert_eq!(consumer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_claim_does_not_consume() {
        let mut mem = SharedMemory::new(REGION);
        let (tx, rx) = mem.split();
        let mut producer = Producer::init(tx, RingFlags::empty()).unwrap();
        let mut consumer = Consumer::attach(rx).unwrap();

        producer.write(b"abc").unwrap();
        assert_eq!(consumer.claim(), b"abc");
        assert_eq!(consumer.claim(), b"abc");
        assert_eq!(consumer.pending_len(), 3);

        assert_eq!(consumer.free(2).unwrap_err(), PbufError::InvalidLength { len: 2 });
        consumer.free(3).unwrap();
        assert!(consumer.claim().is_empty());
    }

    #[test]
    fn test_free_without_claim_fails() {
        let mut mem = SharedMemory::new(REGION);
        let (tx, rx) = mem.split();
        let mut producer = Producer::init(tx, RingFlags::empty()).unwrap();
        let mut consumer = Consumer::attach(rx).unwrap();

        producer.write(b"abc").unwrap();
        assert!(consumer.free(3).is_err());
    }

    #[test]
    fn test_read_too_large_keeps_frame() {
        let mut mem = SharedMemory::new(REGION);
        let (tx, rx) = mem.split();
        let mut producer = Producer::init(tx, RingFlags::empty()).unwrap();
        let mut consumer = Consumer::attach(rx).unwrap();

        producer.write(&[7u8; 12]).unwrap();

        let mut small = [0u8; 8];
        assert_eq!(
            consumer.read(&mut small).unwrap_err(),
            PbufError::TooLarge { frame: 12, buf: 8 }
        );

        let mut big = [0u8; 12];
        assert_eq!(consumer.read(&mut big).unwrap(), 12);
        assert_eq!(big, [7u8; 12]);
    }

    #[test]
    fn test_wrap_skips_padding() {
        let mut mem = SharedMemory::new(REGION);
        let (tx, rx) = mem.split();
        let mut producer = Producer::init(tx, RingFlags::empty()).unwrap();
        let mut consumer = Consumer::attach(rx).unwrap();
        let mut buf = [0u8; 64];

        // Move both indices to 40 so only 24 tail bytes remain.
        producer.write(&[1u8; 36]).unwrap();
        assert_eq!(consumer.read(&mut buf).unwrap(), 36);

        // 28 byte frame does not fit the tail, fits the head.
        assert_eq!(producer.write(&[2u8; 24]).unwrap(), 24);
        assert_eq!(producer.state().write_index, 28);

        assert_eq!(consumer.read(&mut buf).unwrap(), 24);
        assert_eq!(&buf[..24], &[2u8; 24]);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_max_len_request_takes_larger_span() {
        let mut mem = SharedMemory::new(REGION);
        let (tx, rx) = mem.split();
        let mut producer = Producer::init(tx, RingFlags::empty()).unwrap();
        let mut consumer = Consumer::attach(rx).unwrap();
        let mut buf = [0u8; 64];

        producer.write(&[1u8; 44]).unwrap();
        consumer.read(&mut buf).unwrap();

        // Tail is 16 bytes, head is 44 bytes.
        let span = producer.alloc(MAX_LEN as usize).unwrap();
        assert_eq!(span.len(), 40);
        span[..3].copy_from_slice(b"xyz");
        producer.commit(3).unwrap();

        assert_eq!(consumer.claim(), b"xyz");
    }

    #[test]
    fn test_utilization_tracks_peak() {
        let mut mem = SharedMemory::new(REGION);
        let (tx, rx) = mem.split();
        let mut producer = Producer::init(tx, RingFlags::UTILIZATION).unwrap();
        let mut consumer = Consumer::attach(rx).unwrap();
        let mut buf = [0u8; 64];

        assert_eq!(consumer.utilization().unwrap(), 0);

        producer.write(&[0u8; 8]).unwrap();
        producer.write(&[0u8; 8]).unwrap();
        consumer.read(&mut buf).unwrap();
        consumer.read(&mut buf).unwrap();
        assert_eq!(consumer.utilization().unwrap(), 24);

        producer.write(&[0u8; 4]).unwrap();
        consumer.read(&mut buf).unwrap();
        assert_eq!(consumer.utilization().unwrap(), 24);
    }

    #[test]
    fn test_utilization_unsupported_without_flag() {
        let mut mem = SharedMemory::new(REGION);
        let (tx, rx) = mem.split();
        let _producer = Producer::init(tx, RingFlags::empty()).unwrap();
        let consumer = Consumer::attach(rx).unwrap();

        assert_eq!(consumer.utilization().unwrap_err(), PbufError::Unsupported);
    }

    #[test]
    fn test_corrupted_index_reads_empty() {
        let mut mem = SharedMemory::new(REGION);
        let (tx, rx) = mem.split();
        let mut producer = Producer::init(tx, RingFlags::empty()).unwrap();
        let mut consumer = Consumer::attach(rx).unwrap();

        producer.write(b"abcd").unwrap();
        consumer.ring.rd_idx().store(1000, Ordering::Relaxed);
        assert!(consumer.claim().is_empty());
    }

    #[test]
    fn test_cache_layout_round_trip() {
        let mut mem = SharedMemory::new(128);
        let (tx, rx) = mem.split();
        let mut producer = Producer::init(tx, RingFlags::CACHE).unwrap();
        let mut consumer = Consumer::attach(rx).unwrap();

        assert_eq!(producer.state().len, 128 - 36);
        producer.write(b"cached").unwrap();
        assert_eq!(consumer.claim(), b"cached");
        consumer.free(6).unwrap();
        assert!(consumer.is_empty());
    }
}
