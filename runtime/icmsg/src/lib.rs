//! icmsg - Inter-core message sessions over shared memory
//!
//! # Purpose
//! Establishes a verified, bidirectional channel between two execution
//! domains that share two memory regions (one per direction) and can raise
//! doorbell lines on each other. No OS coordinates the peers: each side opens
//! on its own schedule and the handshake converges through a retry timer.
//!
//! # Integration Points
//! - Depends on: `spsc-pbuf` (one ring per direction), `ipc-mbox` (doorbells)
//! - Provides to: applications through [`ChannelSession`] or the endpoint
//!   layer in [`service`]
//! - Platform hooks: [`NotifyTimer`] for the handshake retry,
//!   [`spsc_pbuf::DataCache`] for non-coherent memory
//!
//! # Architecture
//! ```text
//!   OFF --open()--> BUSY --peer magic received--> READY
//! ```
//! `open` writes a 13-byte magic frame to the TX ring and raises the peer's
//! line, then keeps re-raising from the timer until the peer's magic arrives.
//! In READY, [`ChannelSession::send`] writes one frame and raises the line,
//! and [`ChannelSession::on_signal`] drains every pending RX frame into the
//! application callbacks.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

mod config;
pub mod service;
mod session;
mod timer;

pub use config::{ChannelConfig, ChannelConfigBuilder};
pub use session::{ChannelCallbacks, ChannelSession, ChannelState, RxHold, TxReservation};
pub use timer::{ManualTimer, NotifyTimer, TimerAction};

use ipc_mbox::MboxError;
use spsc_pbuf::PbufError;
use static_assertions::const_assert;
use thiserror::Error;

/// Handshake payload, identical on both peers
pub const MAGIC: [u8; 13] = [
    0x45, 0x6d, 0x31, 0x6c, 0x31, 0x4b, 0x30, 0x72, 0x6e, 0x33, 0x6c, 0x69, 0x34,
];

const_assert!(MAGIC.len() < spsc_pbuf::MAX_LEN as usize);

/// Broad category of an [`IcmsgError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad sizing, alignment or wiring; fix the configuration
    Config,
    /// Peer sent something that breaks the protocol
    Protocol,
    /// Frame does not fit right now or ever
    Capacity,
    /// Operation not allowed in the current session state
    State,
    /// Part of the message was written, the rest is lost
    Truncation,
}

/// Session error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IcmsgError {
    #[error("Session already open")]
    AlreadyOpen,

    #[error("Bad channel configuration: {0}")]
    BadConfig(&'static str),

    #[error("Session is not ready")]
    NotReady,

    #[error("Empty message")]
    EmptyMessage,

    #[error("TX buffer is in use")]
    Busy,

    #[error("Message truncated: {written} of {requested} bytes sent")]
    Truncated { requested: usize, written: usize },

    #[error("Handshake frame does not match the magic sequence")]
    HandshakeCorrupted,

    #[error("No RX buffer is held")]
    NoHeldBuffer,

    #[error("Ring error: {0}")]
    Ring(#[from] PbufError),

    #[error("Signal error: {0}")]
    Signal(#[from] MboxError),
}

impl IcmsgError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IcmsgError::AlreadyOpen | IcmsgError::BadConfig(_) | IcmsgError::Signal(_) => {
                ErrorClass::Config
            }
            IcmsgError::HandshakeCorrupted => ErrorClass::Protocol,
            IcmsgError::EmptyMessage => ErrorClass::Capacity,
            IcmsgError::NotReady | IcmsgError::Busy | IcmsgError::NoHeldBuffer => {
                ErrorClass::State
            }
            IcmsgError::Truncated { .. } => ErrorClass::Truncation,
            IcmsgError::Ring(PbufError::InvalidAlignment { .. })
            | IcmsgError::Ring(PbufError::RegionTooSmall { .. }) => ErrorClass::Config,
            IcmsgError::Ring(_) => ErrorClass::Capacity,
        }
    }

    /// Whether the session cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Protocol
    }
}

pub type Result<T> = core::result::Result<T, IcmsgError>;
