//! Two simulated cores joined by a loopback doorbell fabric

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use icmsg::{ChannelCallbacks, ChannelConfig, ChannelSession, IcmsgError, ManualTimer, RxHold};
use ipc_mbox::{DomainId, LineId, LoopbackFabric, LoopbackPort, Mailbox, MailboxConfig, SignalSource};
use spsc_pbuf::{AllocPolicy, Region, SharedMemory};

pub const LINE: LineId = 0;
pub const TICK: Duration = Duration::from_millis(1);

pub type Session = ChannelSession<'static, Arc<Mailbox<LoopbackPort>>, ManualTimer>;

/// Everything a core observed through its callbacks
#[derive(Default)]
pub struct Inbox {
    pub bound: AtomicUsize,
    pub frames: Mutex<Vec<Vec<u8>>>,
    pub errors: Mutex<Vec<IcmsgError>>,
}

impl ChannelCallbacks for Inbox {
    fn bound(&self) {
        self.bound.fetch_add(1, Ordering::AcqRel);
    }

    fn received(&self, data: &[u8], _hold: &mut RxHold) {
        self.frames.lock().unwrap().push(data.to_vec());
    }

    fn error(&self, err: &IcmsgError) {
        self.errors.lock().unwrap().push(*err);
    }
}

impl Inbox {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

/// Shared memory block that lives for the rest of the test binary
pub fn shared(len: usize) -> (Region<'static>, Region<'static>) {
    Box::leak(Box::new(SharedMemory::new(len))).split()
}

pub struct Core {
    pub domain: DomainId,
    pub peer: DomainId,
    pub mailbox: Arc<Mailbox<LoopbackPort>>,
    pub session: &'static Session,
    pub inbox: Arc<Inbox>,
}

impl Core {
    pub fn new(fabric: &Arc<LoopbackFabric>, domain: u8, peer: u8) -> Self {
        let config = MailboxConfig {
            source: SignalSource::Bellboard {
                instance: 0,
                irq: 40 + domain as u32,
            },
            peer: DomainId(peer),
            local: true,
        };
        let mailbox = Arc::new(Mailbox::new(fabric.port(DomainId(domain)).unwrap(), config));
        let session: &'static Session = Box::leak(Box::new(ChannelSession::new(
            Arc::clone(&mailbox),
            ManualTimer::new(),
        )));

        mailbox
            .register_callback(LINE, move |_| {
                // Failures reach the error callback.
                let _ = session.on_signal();
            })
            .unwrap();

        Self {
            domain: DomainId(domain),
            peer: DomainId(peer),
            mailbox,
            session,
            inbox: Arc::new(Inbox::default()),
        }
    }

    pub fn open(&self, tx: Region<'static>, rx: Region<'static>) {
        self.open_with(tx, rx, AllocPolicy::BestEffort)
    }

    pub fn open_with(&self, tx: Region<'static>, rx: Region<'static>, policy: AllocPolicy) {
        let config = ChannelConfig::builder()
            .tx(tx)
            .rx(rx)
            .peer(self.peer)
            .tx_line(LINE)
            .rx_line(LINE)
            .alloc_policy(policy)
            .build()
            .unwrap();
        self.session.open(config, Arc::clone(&self.inbox)).unwrap();
    }

    /// Advance virtual time one tick, then service timer and doorbell
    pub fn tick(&self) {
        if self.session.timer().advance(TICK) {
            self.session.on_notify_timer().unwrap();
        }
        self.service_doorbell();
    }

    /// Dispatch pending doorbell lines without advancing time
    pub fn service_doorbell(&self) {
        self.mailbox.poll();
    }
}
