//! SPSC Packet Buffer - Variable-length frames over a fixed shared memory region
//!
//! # Purpose
//! Provides the byte-stream ring used to move frames between two execution
//! contexts (two cores, or a core and an interrupt handler) that share a
//! statically placed memory region but no allocator, lock or scheduler.
//!
//! # Integration Points
//! - Depends on: nothing but the memory region itself
//! - Provides to: `icmsg` sessions (one ring per direction), interrupt-line queues
//! - IPC endpoints: none, signaling is the caller's concern
//! - Capabilities required: a word-aligned (or cache-line aligned) memory span
//!
//! # Architecture
//! The region starts with a control header followed by the data area:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬───────────────┬──────────────┬────────────┐
//! │ len (u32)    │ flags (u32)  │ rd_idx (u32) │ [cache pad]   │ wr_idx (u32) │ data[len]  │
//! └──────────────┴──────────────┴──────────────┴───────────────┴──────────────┴────────────┘
//! ```
//!
//! Each frame in the data area is one header word (big-endian 16-bit length
//! plus two reserved bytes) followed by the payload padded to 4 bytes. The
//! producer owns `wr_idx`, the consumer owns `rd_idx`; one word is always left
//! unused so a full ring never looks empty.
//!
//! # Concurrency
//! Lock-free under a single producer and a single consumer. The split into
//! [`Producer`] and [`Consumer`] handles, each taking `&mut self`, keeps the
//! discipline at the type level on each side of the region.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(feature = "alloc")]
extern crate alloc;

mod cache;
mod consumer;
mod layout;
mod producer;
mod queue;
mod region;

pub use cache::{Coherent, DataCache, COHERENT};
pub use consumer::Consumer;
pub use layout::{
    check_region, frame_size, min_region_size, region_alignment, RingFlags, RingState,
    DCACHE_LINE, FRAME_HEADER_LEN, FREE_SPACE_DISTANCE, MAX_LEN,
};
pub use producer::{AllocPolicy, Producer};
pub use queue::{WordConsumer, WordProducer};
pub use region::Region;

#[cfg(feature = "alloc")]
pub use region::SharedMemory;

use thiserror::Error;

/// Packet buffer error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PbufError {
    #[error("Region at {addr:#x} is not aligned to {required} bytes")]
    InvalidAlignment { addr: usize, required: usize },

    #[error("Region of {size} bytes is too small (minimum {min})")]
    RegionTooSmall { size: usize, min: usize },

    #[error("Invalid frame length {len}")]
    InvalidLength { len: usize },

    #[error("Frame of {requested} bytes can never fit (capacity {capacity})")]
    OutOfSpace { requested: usize, capacity: usize },

    #[error("No room for a {requested} byte frame right now")]
    Full { requested: usize },

    #[error("Pending frame of {frame} bytes does not fit a {buf} byte buffer")]
    TooLarge { frame: usize, buf: usize },

    #[error("Feature not enabled for this buffer")]
    Unsupported,
}

pub type Result<T> = core::result::Result<T, PbufError>;
