//! In-process doorbell fabric
//!
//! Emulates doorbell hardware for domains that are threads (or just two
//! objects) in one process. Each domain has a pending word, set by peers
//! raising lines, and an enable word owned by the domain itself. Events on
//! disabled lines stay latched until the line is enabled again.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::trace;

use crate::{DomainId, LineId, LineMask, MboxError, Result, SignalPort};

#[derive(Debug, Default)]
struct DomainLines {
    pending: AtomicU32,
    enabled: AtomicU32,
    raised: AtomicUsize,
}

/// Shared doorbell state of all emulated domains
#[derive(Debug)]
pub struct LoopbackFabric {
    domains: Vec<DomainLines>,
}

impl LoopbackFabric {
    /// Fabric connecting `domains` domains, numbered from 0
    pub fn new(domains: u8) -> Arc<Self> {
        Arc::new(Self {
            domains: (0..domains).map(|_| DomainLines::default()).collect(),
        })
    }

    /// Port through which `domain` signals its peers
    ///
    /// # Errors
    /// - `UnknownDomain` if `domain` is not part of the fabric
    pub fn port(self: &Arc<Self>, domain: DomainId) -> Result<LoopbackPort> {
        self.lines(domain)?;
        Ok(LoopbackPort {
            fabric: Arc::clone(self),
            domain,
        })
    }

    /// Lines raised on `domain` and not yet taken, enabled or not
    pub fn pending(&self, domain: DomainId) -> Result<LineMask> {
        let lines = self.lines(domain)?;
        Ok(LineMask::from_bits_retain(
            lines.pending.load(Ordering::Acquire),
        ))
    }

    /// Total number of raises targeting `domain`
    pub fn raised_count(&self, domain: DomainId) -> Result<usize> {
        Ok(self.lines(domain)?.raised.load(Ordering::Relaxed))
    }

    fn lines(&self, domain: DomainId) -> Result<&DomainLines> {
        self.domains
            .get(domain.0 as usize)
            .ok_or(MboxError::UnknownDomain { domain: domain.0 })
    }
}

/// One domain's view of a [`LoopbackFabric`]
#[derive(Debug, Clone)]
pub struct LoopbackPort {
    fabric: Arc<LoopbackFabric>,
    domain: DomainId,
}

impl LoopbackPort {
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// Lines currently enabled on this domain
    pub fn enabled(&self) -> LineMask {
        LineMask::from_bits_retain(self.own().enabled.load(Ordering::Acquire))
    }

    fn own(&self) -> &DomainLines {
        // The domain was checked when the port was created.
        &self.fabric.domains[self.domain.0 as usize]
    }
}

impl SignalPort for LoopbackPort {
    fn enable(&self, mask: LineMask) -> Result<()> {
        self.own().enabled.fetch_or(mask.bits(), Ordering::AcqRel);
        Ok(())
    }

    fn disable(&self, mask: LineMask) -> Result<()> {
        self.own().enabled.fetch_and(!mask.bits(), Ordering::AcqRel);
        Ok(())
    }

    fn raise(&self, domain: DomainId, line: LineId) -> Result<()> {
        let mask = LineMask::line(line)?;
        let target = self.fabric.lines(domain)?;
        target.pending.fetch_or(mask.bits(), Ordering::Release);
        target.raised.fetch_add(1, Ordering::Relaxed);
        trace!("mbox: domain {} raised line {} on {}", self.domain.0, line, domain.0);
        Ok(())
    }

    fn take_pending(&self, mask: LineMask) -> LineMask {
        let own = self.own();
        let wanted = mask.bits() & own.enabled.load(Ordering::Acquire);
        let taken = own.pending.fetch_and(!wanted, Ordering::AcqRel) & wanted;
        LineMask::from_bits_retain(taken)
    }
}
