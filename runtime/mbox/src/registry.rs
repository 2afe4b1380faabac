//! IRQ routing table for mailboxes
//!
//! Built once at startup and passed by reference to whatever services
//! interrupts. Lookup is a single map access per IRQ.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;

use crate::mailbox::{Mailbox, SignalSource};
use crate::{LineMask, MboxError, Result, SignalPort, LINE_COUNT};

/// Key identifying a signal instance; vevif has a single instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum InstanceKey {
    Bellboard(u8),
    Vevif,
}

/// Owns the mailboxes of one domain and routes IRQs to them
pub struct MailboxRegistry<P: SignalPort> {
    mailboxes: Vec<Arc<Mailbox<P>>>,
    instances: BTreeMap<InstanceKey, usize>,
    routes: BTreeMap<u32, usize>,
}

impl<P: SignalPort> MailboxRegistry<P> {
    pub fn new() -> Self {
        Self {
            mailboxes: Vec::new(),
            instances: BTreeMap::new(),
            routes: BTreeMap::new(),
        }
    }

    /// Take ownership of `mailbox` and route its IRQs
    ///
    /// # Errors
    /// - `InstanceInUse` if the signal instance is already registered
    /// - `IrqInUse` if one of its IRQs is routed to another mailbox
    pub fn register(&mut self, mailbox: Mailbox<P>) -> Result<Arc<Mailbox<P>>> {
        let source = mailbox.config().source;
        let (key, irqs) = match source {
            SignalSource::Bellboard { instance, irq } => (InstanceKey::Bellboard(instance), irq..irq + 1),
            SignalSource::Vevif { irq_base } => (InstanceKey::Vevif, irq_base..irq_base + LINE_COUNT as u32),
        };

        if self.instances.contains_key(&key) {
            let instance = match key {
                InstanceKey::Bellboard(instance) => instance,
                InstanceKey::Vevif => 0,
            };
            return Err(MboxError::InstanceInUse { instance });
        }
        if let Some(irq) = irqs.clone().find(|irq| self.routes.contains_key(irq)) {
            return Err(MboxError::IrqInUse { irq });
        }

        let index = self.mailboxes.len();
        let mailbox = Arc::new(mailbox);
        self.mailboxes.push(Arc::clone(&mailbox));
        self.instances.insert(key, index);
        for irq in irqs {
            self.routes.insert(irq, index);
        }

        debug!("mbox: registered {:?} as mailbox {}", source, index);
        Ok(mailbox)
    }

    /// Route `irq` to its mailbox
    ///
    /// # Errors
    /// - `UnroutedIrq` if no mailbox owns `irq`
    pub fn handle_irq(&self, irq: u32) -> Result<()> {
        let index = self
            .routes
            .get(&irq)
            .copied()
            .ok_or(MboxError::UnroutedIrq { irq })?;
        self.mailboxes[index].handle_irq(irq)
    }

    /// Poll every mailbox, for hosts without real interrupts
    ///
    /// # Returns
    /// Union of the lines dispatched
    pub fn poll(&self) -> LineMask {
        self.mailboxes
            .iter()
            .fold(LineMask::empty(), |acc, mailbox| acc | mailbox.poll())
    }

    /// Mailbox registered for bellboard `instance`
    pub fn bellboard(&self, instance: u8) -> Option<&Arc<Mailbox<P>>> {
        self.instances
            .get(&InstanceKey::Bellboard(instance))
            .map(|&index| &self.mailboxes[index])
    }

    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }
}

impl<P: SignalPort> Default for MailboxRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
