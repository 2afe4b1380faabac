//! IPC Mailbox - Doorbell signal lines between execution domains
//!
//! # Purpose
//! A doorbell carries no data: raising a line on a peer domain only tells
//! the peer "look at shared memory". This crate models that capability as
//! the [`SignalPort`] trait and builds the receive side on top of it:
//! per-line handler dispatch, enable masks and IRQ routing.
//!
//! # Integration Points
//! - Depends on: a doorbell backend implementing [`SignalPort`]
//! - Provides to: `icmsg` sessions (raise on send, upcall on receive)
//! - IRQs: one per bellboard instance, or one per line for vevif
//!
//! # Architecture
//! - [`SignalPort`]: enable/disable lines, raise a line on a peer, collect
//!   pending events
//! - [`Mailbox`]: per-line handlers and the software enable mask over one port
//! - [`MailboxRegistry`]: explicit IRQ → mailbox routing table
//! - [`LoopbackFabric`]: in-process doorbell hardware for host emulation

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

mod loopback;
mod mailbox;
mod registry;

pub use loopback::{LoopbackFabric, LoopbackPort};
pub use mailbox::{LineHandler, Mailbox, MailboxConfig, SignalSource};
pub use registry::MailboxRegistry;

use alloc::sync::Arc;
use bitflags::bitflags;
use thiserror::Error;

/// Number of signal lines per port
pub const LINE_COUNT: u8 = 32;

/// Index of a signal line, below [`LINE_COUNT`]
pub type LineId = u8;

/// Execution domain (core) a line is raised on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u8);

bitflags! {
    /// Set of signal lines
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LineMask: u32 {
        const _ = !0;
    }
}

impl LineMask {
    /// Mask with only `line` set
    ///
    /// # Errors
    /// - `InvalidLine` if `line` is not below [`LINE_COUNT`]
    pub fn line(line: LineId) -> Result<Self> {
        if line >= LINE_COUNT {
            return Err(MboxError::InvalidLine { line });
        }
        Ok(LineMask::from_bits_retain(1 << line))
    }

    /// Lines in the mask, lowest first
    pub fn lines(self) -> impl Iterator<Item = LineId> {
        let mut bits = self.bits();
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let line = bits.trailing_zeros() as LineId;
            bits &= bits - 1;
            Some(line)
        })
    }
}

/// Doorbell capability of one execution domain
///
/// Implemented by hardware backends, by [`LoopbackPort`] for emulation and
/// by [`Mailbox`] itself so sessions can signal through either.
pub trait SignalPort: Send + Sync {
    /// Let events on `mask` interrupt this domain
    fn enable(&self, mask: LineMask) -> Result<()>;

    /// Stop events on `mask` from interrupting this domain
    fn disable(&self, mask: LineMask) -> Result<()>;

    /// Raise `line` on `domain`
    fn raise(&self, domain: DomainId, line: LineId) -> Result<()>;

    /// Read and acknowledge the pending, enabled events within `mask`
    fn take_pending(&self, mask: LineMask) -> LineMask;
}

impl<T: SignalPort + ?Sized> SignalPort for &T {
    fn enable(&self, mask: LineMask) -> Result<()> {
        (**self).enable(mask)
    }

    fn disable(&self, mask: LineMask) -> Result<()> {
        (**self).disable(mask)
    }

    fn raise(&self, domain: DomainId, line: LineId) -> Result<()> {
        (**self).raise(domain, line)
    }

    fn take_pending(&self, mask: LineMask) -> LineMask {
        (**self).take_pending(mask)
    }
}

impl<T: SignalPort + ?Sized> SignalPort for Arc<T> {
    fn enable(&self, mask: LineMask) -> Result<()> {
        (**self).enable(mask)
    }

    fn disable(&self, mask: LineMask) -> Result<()> {
        (**self).disable(mask)
    }

    fn raise(&self, domain: DomainId, line: LineId) -> Result<()> {
        (**self).raise(domain, line)
    }

    fn take_pending(&self, mask: LineMask) -> LineMask {
        (**self).take_pending(mask)
    }
}

/// Mailbox error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MboxError {
    #[error("Invalid signal line {line}")]
    InvalidLine { line: LineId },

    #[error("Line {line} already enabled")]
    AlreadyEnabled { line: LineId },

    #[error("Line {line} already disabled")]
    AlreadyDisabled { line: LineId },

    #[error("Mailbox is not local to this domain")]
    NotLocal,

    #[error("Unknown domain {domain}")]
    UnknownDomain { domain: u8 },

    #[error("Signal instance {instance} already initialized")]
    InstanceInUse { instance: u8 },

    #[error("IRQ {irq} already routed")]
    IrqInUse { irq: u32 },

    #[error("No mailbox routed for IRQ {irq}")]
    UnroutedIrq { irq: u32 },
}

pub type Result<T> = core::result::Result<T, MboxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_line_mask_bounds() {
        assert_eq!(LineMask::line(0).unwrap().bits(), 1);
        assert_eq!(LineMask::line(31).unwrap().bits(), 1 << 31);
        assert_eq!(LineMask::line(32), Err(MboxError::InvalidLine { line: 32 }));
    }

    #[test]
    fn test_lines_lowest_first() {
        let mask = LineMask::from_bits_retain(0b1010_0001 | 1 << 31);
        let lines: Vec<_> = mask.lines().collect();
        assert_eq!(lines, vec![0, 5, 7, 31]);
        assert_eq!(LineMask::empty().lines().count(), 0);
    }
}
