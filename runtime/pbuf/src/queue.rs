//! Fixed 4-byte slot queue
//!
//! Carries 32-bit words (interrupt line numbers, short commands) between two
//! contexts over the same ring layout as variable-length frames. Every frame
//! is exactly one little-endian word, so the queue never truncates.

use log::warn;

use crate::consumer::Consumer;
use crate::layout::RingFlags;
use crate::producer::{AllocPolicy, Producer};
use crate::region::Region;
use crate::Result;

const SLOT: usize = 4;

/// Pushing end of a word queue
#[derive(Debug)]
pub struct WordProducer<'a> {
    inner: Producer<'a>,
}

impl<'a> WordProducer<'a> {
    /// Initialize a queue over `region`
    pub fn init(region: Region<'a>) -> Result<Self> {
        let inner = Producer::init(region, RingFlags::empty())?.with_policy(AllocPolicy::Exact);
        Ok(Self { inner })
    }

    /// Append a word
    ///
    /// # Errors
    /// - `Full` if no slot is free
    pub fn push(&mut self, word: u32) -> Result<()> {
        self.inner.write(&word.to_le_bytes()).map(|_| ())
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }
}

/// Popping end of a word queue
#[derive(Debug)]
pub struct WordConsumer<'a> {
    inner: Consumer<'a>,
}

impl<'a> WordConsumer<'a> {
    pub fn attach(region: Region<'a>) -> Result<Self> {
        Ok(Self {
            inner: Consumer::attach(region)?,
        })
    }

    /// Remove and return the oldest word
    pub fn pop(&mut self) -> Option<u32> {
        loop {
            let word = self.peek_slot()?;
            match word {
                Ok(word) => {
                    self.inner.free(SLOT).ok()?;
                    return Some(word);
                }
                Err(len) => {
                    warn!("pbuf: dropping {} byte frame from word queue", len);
                    self.inner.free(len).ok()?;
                }
            }
        }
    }

    /// Return the oldest word without removing it
    pub fn peek(&mut self) -> Option<u32> {
        match self.peek_slot()? {
            Ok(word) => Some(word),
            Err(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Claim the head frame; `Err` carries the length of a malformed frame
    fn peek_slot(&mut self) -> Option<core::result::Result<u32, usize>> {
        let frame = self.inner.claim();
        match frame.len() {
            0 => None,
            SLOT => {
                let mut bytes = [0u8; SLOT];
                bytes.copy_from_slice(frame);
                Some(Ok(u32::from_le_bytes(bytes)))
            }
            len => Some(Err(len)),
        }
    }
}
