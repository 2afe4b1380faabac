//! Channel wiring and tuning

use core::time::Duration;

use ipc_mbox::{DomainId, LineId, LINE_COUNT};
use spsc_pbuf::{AllocPolicy, DataCache, Region, RingFlags, COHERENT};

use crate::{IcmsgError, Result};

/// Delay before the first handshake re-announcement
pub const DEFAULT_INITIAL_NOTIFY: Duration = Duration::from_millis(10);

/// Period of the handshake re-announcement until the peer answers
pub const DEFAULT_NOTIFY_PERIOD: Duration = Duration::from_millis(1);

/// Everything a session needs to open one channel
pub struct ChannelConfig<'a> {
    pub(crate) tx: Region<'a>,
    pub(crate) rx: Region<'a>,
    pub(crate) cache: &'a dyn DataCache,
    pub(crate) params: ChannelParams,
}

/// Plain-data part of a [`ChannelConfig`], kept by the session after open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChannelParams {
    pub peer: DomainId,
    pub tx_line: LineId,
    pub rx_line: LineId,
    pub ring_flags: RingFlags,
    pub alloc_policy: AllocPolicy,
    pub initial_notify: Duration,
    pub notify_period: Duration,
}

impl<'a> ChannelConfig<'a> {
    pub fn builder() -> ChannelConfigBuilder<'a> {
        ChannelConfigBuilder::default()
    }

    pub fn peer(&self) -> DomainId {
        self.params.peer
    }

    pub fn tx_line(&self) -> LineId {
        self.params.tx_line
    }

    pub fn rx_line(&self) -> LineId {
        self.params.rx_line
    }
}

impl core::fmt::Debug for ChannelConfig<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("tx", &self.tx)
            .field("rx", &self.rx)
            .field("params", &self.params)
            .finish()
    }
}

/// Builder for [`ChannelConfig`]
pub struct ChannelConfigBuilder<'a> {
    tx: Option<Region<'a>>,
    rx: Option<Region<'a>>,
    cache: &'a dyn DataCache,
    peer: DomainId,
    tx_line: LineId,
    rx_line: LineId,
    ring_flags: RingFlags,
    alloc_policy: AllocPolicy,
    initial_notify: Duration,
    notify_period: Duration,
}

impl Default for ChannelConfigBuilder<'_> {
    fn default() -> Self {
        Self {
            tx: None,
            rx: None,
            cache: &COHERENT,
            peer: DomainId(0),
            tx_line: 0,
            rx_line: 0,
            ring_flags: RingFlags::empty(),
            alloc_policy: AllocPolicy::BestEffort,
            initial_notify: DEFAULT_INITIAL_NOTIFY,
            notify_period: DEFAULT_NOTIFY_PERIOD,
        }
    }
}

impl<'a> ChannelConfigBuilder<'a> {
    /// Region this side writes; the session initializes it
    pub fn tx(mut self, region: Region<'a>) -> Self {
        self.tx = Some(region);
        self
    }

    /// Region the peer writes
    pub fn rx(mut self, region: Region<'a>) -> Self {
        self.rx = Some(region);
        self
    }

    /// Domain whose line is raised after every write
    pub fn peer(mut self, peer: DomainId) -> Self {
        self.peer = peer;
        self
    }

    pub fn tx_line(mut self, line: LineId) -> Self {
        self.tx_line = line;
        self
    }

    pub fn rx_line(mut self, line: LineId) -> Self {
        self.rx_line = line;
        self
    }

    pub fn ring_flags(mut self, flags: RingFlags) -> Self {
        self.ring_flags = flags;
        self
    }

    pub fn alloc_policy(mut self, policy: AllocPolicy) -> Self {
        self.alloc_policy = policy;
        self
    }

    /// Cache maintenance for rings created with [`RingFlags::CACHE`]
    pub fn cache(mut self, cache: &'a dyn DataCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn initial_notify(mut self, delay: Duration) -> Self {
        self.initial_notify = delay;
        self
    }

    pub fn notify_period(mut self, period: Duration) -> Self {
        self.notify_period = period;
        self
    }

    /// # Errors
    /// - `BadConfig` if a region is missing, a line is out of range or the
    ///   retry period is zero
    pub fn build(self) -> Result<ChannelConfig<'a>> {
        let tx = self.tx.ok_or(IcmsgError::BadConfig("missing TX region"))?;
        let rx = self.rx.ok_or(IcmsgError::BadConfig("missing RX region"))?;
        if self.tx_line >= LINE_COUNT || self.rx_line >= LINE_COUNT {
            return Err(IcmsgError::BadConfig("signal line out of range"));
        }
        if self.notify_period.is_zero() {
            return Err(IcmsgError::BadConfig("zero notify period"));
        }

        Ok(ChannelConfig {
            tx,
            rx,
            cache: self.cache,
            params: ChannelParams {
                peer: self.peer,
                tx_line: self.tx_line,
                rx_line: self.rx_line,
                ring_flags: self.ring_flags,
                alloc_policy: self.alloc_policy,
                initial_notify: self.initial_notify,
                notify_period: self.notify_period,
            },
        })
    }
}
