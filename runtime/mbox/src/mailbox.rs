//! Per-line handler dispatch over one signal port

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};
use spin::Mutex;

use crate::{DomainId, LineId, LineMask, MboxError, Result, SignalPort, LINE_COUNT};

/// Handler invoked with the line that fired
pub type LineHandler = Arc<dyn Fn(LineId) + Send + Sync>;

/// Doorbell hardware behind a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    /// One IRQ for the whole instance; the pending register says which
    /// lines fired
    Bellboard { instance: u8, irq: u32 },
    /// One IRQ per line, numbered from `irq_base`
    Vevif { irq_base: u32 },
}

/// Static description of a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxConfig {
    pub source: SignalSource,
    /// Domain that [`Mailbox::send`] signals
    pub peer: DomainId,
    /// Whether events of this mailbox are delivered to this domain
    pub local: bool,
}

/// Handler table and enable mask for the lines of one port
pub struct Mailbox<P: SignalPort> {
    port: P,
    config: MailboxConfig,
    enabled: AtomicU32,
    handlers: Mutex<[Option<LineHandler>; LINE_COUNT as usize]>,
}

impl<P: SignalPort> Mailbox<P> {
    pub fn new(port: P, config: MailboxConfig) -> Self {
        Self {
            port,
            config,
            enabled: AtomicU32::new(0),
            handlers: Mutex::new(core::array::from_fn(|_| None)),
        }
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Lines enabled through [`set_enabled`](Self::set_enabled)
    pub fn enabled(&self) -> LineMask {
        LineMask::from_bits_retain(self.enabled.load(Ordering::Acquire))
    }

    /// Install the handler for `line`, replacing any previous one
    ///
    /// # Errors
    /// - `NotLocal` if this mailbox only sends
    /// - `InvalidLine` if `line` is out of range
    pub fn register_callback<F>(&self, line: LineId, handler: F) -> Result<()>
    where
        F: Fn(LineId) + Send + Sync + 'static,
    {
        if !self.config.local {
            return Err(MboxError::NotLocal);
        }
        LineMask::line(line)?;

        self.handlers.lock()[line as usize] = Some(Arc::new(handler));
        debug!("mbox: handler registered for line {}", line);
        Ok(())
    }

    /// Enable or disable delivery on `line`
    ///
    /// # Errors
    /// - `InvalidLine` if `line` is out of range
    /// - `AlreadyEnabled` / `AlreadyDisabled` if nothing would change
    /// - whatever the port reports; the line keeps its previous state
    pub fn set_enabled(&self, line: LineId, enable: bool) -> Result<()> {
        let bit = LineMask::line(line)?.bits();

        let previous = if enable {
            self.enabled.fetch_or(bit, Ordering::AcqRel)
        } else {
            self.enabled.fetch_and(!bit, Ordering::AcqRel)
        };
        match (enable, previous & bit != 0) {
            (true, true) => return Err(MboxError::AlreadyEnabled { line }),
            (false, false) => return Err(MboxError::AlreadyDisabled { line }),
            _ => {}
        }

        let enabled = self.enabled();
        let applied = self
            .port
            .disable(enabled.complement())
            .and_then(|()| self.port.enable(enabled));
        if let Err(err) = applied {
            if enable {
                self.enabled.fetch_and(!bit, Ordering::AcqRel);
            } else {
                self.enabled.fetch_or(bit, Ordering::AcqRel);
            }
            warn!("mbox: line {} left unchanged: {}", line, err);
            return Err(err);
        }
        debug!("mbox: line {} {}", line, if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Raise `line` on the configured peer
    pub fn send(&self, line: LineId) -> Result<()> {
        self.port.raise(self.config.peer, line)
    }

    /// Run the handler of `line`
    ///
    /// Events on lines disabled in software are dropped and the line is
    /// masked in hardware.
    pub fn dispatch(&self, line: LineId) {
        if line >= LINE_COUNT {
            warn!("mbox: event on illegal line {}", line);
            return;
        }

        if !self.enabled().contains(LineMask::from_bits_retain(1 << line)) {
            warn!("mbox: event on disabled line {}, masking it", line);
            let _ = self.port.disable(LineMask::from_bits_retain(1 << line));
            return;
        }

        let handler = self.handlers.lock()[line as usize].clone();
        if let Some(handler) = handler {
            handler(line);
        }
    }

    /// Dispatch every line in `pending`, lowest first
    pub fn dispatch_pending(&self, pending: LineMask) {
        for line in pending.lines() {
            self.dispatch(line);
        }
    }

    /// Interrupt entry point
    ///
    /// # Errors
    /// - `UnroutedIrq` if `irq` does not belong to this mailbox
    pub fn handle_irq(&self, irq: u32) -> Result<()> {
        match self.config.source {
            SignalSource::Bellboard { irq: own, .. } if own == irq => {
                self.dispatch_pending(self.port.take_pending(LineMask::all()));
                Ok(())
            }
            SignalSource::Vevif { irq_base }
                if irq >= irq_base && irq - irq_base < LINE_COUNT as u32 =>
            {
                let line = (irq - irq_base) as LineId;
                self.port.take_pending(LineMask::from_bits_retain(1 << line));
                self.dispatch(line);
                Ok(())
            }
            _ => Err(MboxError::UnroutedIrq { irq }),
        }
    }

    /// Collect and dispatch everything pending, without an interrupt
    ///
    /// # Returns
    /// Lines that were dispatched
    pub fn poll(&self) -> LineMask {
        let pending = self.port.take_pending(LineMask::all());
        self.dispatch_pending(pending);
        pending
    }
}

impl<P: SignalPort> SignalPort for Mailbox<P> {
    /// Enable every line in `mask`; fails if any is already enabled
    fn enable(&self, mask: LineMask) -> Result<()> {
        for line in mask.lines() {
            self.set_enabled(line, true)?;
        }
        Ok(())
    }

    fn disable(&self, mask: LineMask) -> Result<()> {
        for line in mask.lines() {
            self.set_enabled(line, false)?;
        }
        Ok(())
    }

    fn raise(&self, domain: DomainId, line: LineId) -> Result<()> {
        self.port.raise(domain, line)
    }

    fn take_pending(&self, mask: LineMask) -> LineMask {
        self.port.take_pending(mask)
    }
}

impl<P: SignalPort> core::fmt::Debug for Mailbox<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mailbox")
            .field("config", &self.config)
            .field("enabled", &self.enabled())
            .finish()
    }
}
