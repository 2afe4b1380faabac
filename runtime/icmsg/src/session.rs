//! Channel session state machine

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use ipc_mbox::{LineMask, SignalPort};
use log::{debug, error, trace, warn};
use spin::{Mutex, Once};
use spsc_pbuf::{check_region, frame_size, Consumer, Producer, RingFlags, FREE_SPACE_DISTANCE};

use crate::config::{ChannelConfig, ChannelParams};
use crate::timer::{NotifyTimer, TimerAction};
use crate::{IcmsgError, Result, MAGIC};

/// Session lifecycle; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Not opened
    Off = 0,
    /// Opened, waiting for the peer's handshake
    Busy = 1,
    /// Handshake verified, data flows
    Ready = 2,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ChannelState::Busy,
            2 => ChannelState::Ready,
            _ => ChannelState::Off,
        }
    }
}

/// Ownership of the frame at the head of the RX ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxBuffer {
    Released,
    Releasing,
    Held { len: usize },
}

/// Handle passed to [`ChannelCallbacks::received`]
///
/// Calling [`hold`](Self::hold) keeps the frame in the RX ring after the
/// callback returns; further deliveries wait until
/// [`ChannelSession::release_rx_buffer`].
#[derive(Debug, Default)]
pub struct RxHold {
    held: bool,
}

impl RxHold {
    pub fn hold(&mut self) {
        self.held = true;
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

/// Application upcalls
///
/// They run in whatever context calls [`ChannelSession::on_signal`]
/// (usually an interrupt handler) and must return quickly.
pub trait ChannelCallbacks: Send + Sync {
    /// The peer's handshake arrived; the session is READY
    fn bound(&self) {}

    /// A frame arrived; `data` is only valid for the duration of the call
    /// unless [`RxHold::hold`] is called
    fn received(&self, _data: &[u8], _hold: &mut RxHold) {}

    /// A fatal protocol error ended the session
    fn error(&self, _err: &IcmsgError) {}
}

impl ChannelCallbacks for () {}

impl<C: ChannelCallbacks + ?Sized> ChannelCallbacks for Arc<C> {
    fn bound(&self) {
        (**self).bound()
    }

    fn received(&self, data: &[u8], hold: &mut RxHold) {
        (**self).received(data, hold)
    }

    fn error(&self, err: &IcmsgError) {
        (**self).error(err)
    }
}

/// Exclusive right to write the TX ring, released on drop
#[must_use = "the TX buffer is released as soon as the reservation is dropped"]
#[derive(Debug)]
pub struct TxReservation<'s> {
    flag: &'s AtomicBool,
}

impl Drop for TxReservation<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// One end of an icmsg channel
///
/// All methods take `&self`: `send` may run on an application thread while
/// `on_signal` runs from the doorbell interrupt and `on_notify_timer` from the
/// platform timer.
pub struct ChannelSession<'a, P: SignalPort, T: NotifyTimer> {
    port: P,
    timer: T,
    state: AtomicU8,
    opened: AtomicBool,
    failed: AtomicBool,
    params: Once<ChannelParams>,
    callbacks: Once<Box<dyn ChannelCallbacks + 'a>>,
    // Uncontended: `tx_reserved` serializes writers and `rx_active`
    // serializes readers before these locks are taken.
    tx: Mutex<Option<Producer<'a>>>,
    rx: Mutex<Option<Consumer<'a>>>,
    tx_reserved: AtomicBool,
    rx_active: AtomicBool,
    rx_pending: AtomicBool,
    rx_buffer: Mutex<RxBuffer>,
}

impl<'a, P: SignalPort, T: NotifyTimer> ChannelSession<'a, P, T> {
    /// Closed session signaling through `port` and retrying through `timer`
    pub fn new(port: P, timer: T) -> Self {
        Self {
            port,
            timer,
            state: AtomicU8::new(ChannelState::Off as u8),
            opened: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            params: Once::new(),
            callbacks: Once::new(),
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            tx_reserved: AtomicBool::new(false),
            rx_active: AtomicBool::new(false),
            rx_pending: AtomicBool::new(false),
            rx_buffer: Mutex::new(RxBuffer::Released),
        }
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    /// Whether a fatal protocol error ended the session
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Open the channel and start the handshake
    ///
    /// Enables the RX line, initializes the TX ring with the magic frame,
    /// attaches to the RX ring, announces itself to the peer and arms the
    /// retry timer. A failed first announcement is logged and left to the
    /// timer.
    ///
    /// # Errors
    /// - `BadConfig` if a region cannot hold a ring carrying the magic frame
    /// - `AlreadyOpen` if the session was opened before
    /// - `Signal` if the RX line cannot be enabled; the session stays closed
    ///   and may be opened again
    pub fn open<C>(&self, config: ChannelConfig<'a>, callbacks: C) -> Result<()>
    where
        C: ChannelCallbacks + 'a,
    {
        self.open_from(&mut Some(config), callbacks)
    }

    /// [`open`](Self::open) taking the configuration out of `slot`
    ///
    /// The configuration is only taken once every check passed and the RX
    /// line is enabled, so a failed attempt leaves it in place.
    pub(crate) fn open_from<C>(
        &self,
        slot: &mut Option<ChannelConfig<'a>>,
        callbacks: C,
    ) -> Result<()>
    where
        C: ChannelCallbacks + 'a,
    {
        let params = match slot.as_ref() {
            Some(config) => {
                check_config(config)?;
                config.params
            }
            None => return Err(IcmsgError::AlreadyOpen),
        };
        let rx_line = LineMask::line(params.rx_line)?;

        if self.opened.swap(true, Ordering::AcqRel) {
            return Err(IcmsgError::AlreadyOpen);
        }

        if let Err(err) = self.port.enable(rx_line) {
            warn!("icmsg: cannot enable rx line {}: {}", params.rx_line, err);
            self.opened.store(false, Ordering::Release);
            return Err(err.into());
        }

        let rings = slot
            .take()
            .ok_or(IcmsgError::AlreadyOpen)
            .and_then(attach_rings);
        let (producer, consumer) = match rings {
            Ok(rings) => rings,
            Err(err) => {
                if let Err(disable) = self.port.disable(rx_line) {
                    warn!("icmsg: cannot disable rx line {}: {}", params.rx_line, disable);
                }
                self.opened.store(false, Ordering::Release);
                return Err(err);
            }
        };

        self.params.call_once(|| params);
        self.callbacks.call_once(|| Box::new(callbacks));
        *self.tx.lock() = Some(producer);
        *self.rx.lock() = Some(consumer);
        self.state.store(ChannelState::Busy as u8, Ordering::Release);

        if let Err(err) = self.port.raise(params.peer, params.tx_line) {
            warn!("icmsg: announce to domain {} failed: {}", params.peer.0, err);
        }
        self.timer.schedule(params.initial_notify);

        debug!(
            "icmsg: opened, tx line {} to domain {}, rx line {}",
            params.tx_line, params.peer.0, params.rx_line
        );

        // Doorbell that fired after the line was enabled but before BUSY.
        if self.rx_pending.load(Ordering::Acquire) {
            // Failures are reported through the error callback.
            let _ = self.on_signal();
        }
        Ok(())
    }

    /// Reserve the single TX slot
    ///
    /// # Errors
    /// - `Busy` if a send is already in flight
    pub fn reserve_tx_buffer(&self) -> Result<TxReservation<'_>> {
        if self.tx_reserved.swap(true, Ordering::AcqRel) {
            return Err(IcmsgError::Busy);
        }
        Ok(TxReservation {
            flag: &self.tx_reserved,
        })
    }

    /// Send one message to the peer
    ///
    /// # Returns
    /// Number of bytes sent, equal to `data.len()`
    ///
    /// # Errors
    /// - `NotReady` before the handshake completes
    /// - `EmptyMessage` if `data` is empty
    /// - `Busy` if another send holds the TX slot
    /// - `Ring` if the frame does not fit the TX ring
    /// - `Truncated` if only part of `data` fit; that part was sent and the
    ///   peer signaled
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        if !self.is_ready() {
            return Err(IcmsgError::NotReady);
        }
        if data.is_empty() {
            return Err(IcmsgError::EmptyMessage);
        }
        let params = self.params.get().ok_or(IcmsgError::NotReady)?;

        let reservation = self.reserve_tx_buffer()?;
        let written = match self.tx.lock().as_mut() {
            Some(producer) => producer.write(data),
            None => return Err(IcmsgError::NotReady),
        };
        drop(reservation);

        let written = written?;
        self.port.raise(params.peer, params.tx_line)?;
        trace!("icmsg: sent {} byte message", written);

        if written < data.len() {
            warn!("icmsg: message truncated to {} of {} bytes", written, data.len());
            return Err(IcmsgError::Truncated {
                requested: data.len(),
                written,
            });
        }
        Ok(written)
    }

    /// Doorbell upcall: process everything pending on the RX ring
    ///
    /// A no-op when nothing is pending. Concurrent or nested calls fold into
    /// the drain already running.
    ///
    /// # Errors
    /// - `HandshakeCorrupted` the first time the peer's handshake frame does
    ///   not match; the session is dead afterwards
    pub fn on_signal(&self) -> Result<()> {
        if self.is_failed() {
            return Ok(());
        }

        self.rx_pending.store(true, Ordering::Release);
        if self.state() == ChannelState::Off {
            return Ok(());
        }
        loop {
            if self.rx_active.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.rx_pending.store(false, Ordering::Release);

            let result = self.drain();
            self.rx_active.store(false, Ordering::Release);
            result?;

            if !self.rx_pending.load(Ordering::Acquire) {
                return Ok(());
            }
        }
    }

    /// Handshake timer callback
    ///
    /// Re-raises the peer's line and re-arms the timer while the handshake is
    /// pending.
    pub fn on_notify_timer(&self) -> Result<TimerAction> {
        let Some(params) = self.params.get() else {
            return Ok(TimerAction::Stop);
        };
        if self.state() != ChannelState::Busy || self.is_failed() {
            return Ok(TimerAction::Stop);
        }

        self.port.raise(params.peer, params.tx_line)?;
        self.timer.schedule(params.notify_period);
        trace!("icmsg: handshake re-announced");
        Ok(TimerAction::Reschedule(params.notify_period))
    }

    /// Run `f` on the frame held by [`RxHold::hold`]
    ///
    /// # Errors
    /// - `NoHeldBuffer` if no frame is held
    /// - `Busy` if called from inside a callback
    pub fn held_rx_frame<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let len = self.held_len()?;
        let mut rx = self.rx.try_lock().ok_or(IcmsgError::Busy)?;
        let consumer = rx.as_mut().ok_or(IcmsgError::NoHeldBuffer)?;

        let frame = consumer.claim();
        if frame.len() != len {
            return Err(IcmsgError::NoHeldBuffer);
        }
        Ok(f(frame))
    }

    /// Free the held frame and deliver anything that queued up behind it
    ///
    /// # Errors
    /// - `NoHeldBuffer` if no frame is held
    /// - `Busy` if called from inside a callback
    pub fn release_rx_buffer(&self) -> Result<()> {
        let len = self.held_len()?;
        {
            let mut rx = self.rx.try_lock().ok_or(IcmsgError::Busy)?;
            let consumer = rx.as_mut().ok_or(IcmsgError::NoHeldBuffer)?;

            *self.rx_buffer.lock() = RxBuffer::Releasing;
            let claimed = consumer.claim().len();
            let freed = if claimed == len {
                consumer.free(len).map_err(IcmsgError::from)
            } else {
                Err(IcmsgError::NoHeldBuffer)
            };
            *self.rx_buffer.lock() = RxBuffer::Released;
            freed?;
        }

        debug!("icmsg: released held {} byte frame", len);
        self.on_signal()
    }

    fn held_len(&self) -> Result<usize> {
        match *self.rx_buffer.lock() {
            RxBuffer::Held { len } => Ok(len),
            _ => Err(IcmsgError::NoHeldBuffer),
        }
    }

    fn drain(&self) -> Result<()> {
        let mut rx = self.rx.lock();
        let Some(consumer) = rx.as_mut() else {
            return Ok(());
        };

        loop {
            if *self.rx_buffer.lock() != RxBuffer::Released {
                return Ok(());
            }

            let frame = consumer.claim();
            if frame.is_empty() {
                return Ok(());
            }
            let len = frame.len();

            match self.state() {
                ChannelState::Busy => {
                    if frame != MAGIC {
                        return Err(self.fail(IcmsgError::HandshakeCorrupted));
                    }
                    consumer.free(len)?;

                    if let Some(callbacks) = self.callbacks.get() {
                        callbacks.bound();
                    }
                    self.state.store(ChannelState::Ready as u8, Ordering::Release);
                    self.timer.cancel();
                    debug!("icmsg: handshake complete, channel ready");
                }
                ChannelState::Ready => {
                    let mut hold = RxHold::default();
                    if let Some(callbacks) = self.callbacks.get() {
                        callbacks.received(frame, &mut hold);
                    }

                    if hold.is_held() {
                        *self.rx_buffer.lock() = RxBuffer::Held { len };
                        trace!("icmsg: holding {} byte frame", len);
                        return Ok(());
                    }
                    consumer.free(len)?;
                }
                ChannelState::Off => return Ok(()),
            }
        }
    }

    fn fail(&self, err: IcmsgError) -> IcmsgError {
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!("icmsg: {}", err);
            self.timer.cancel();
            if let Some(callbacks) = self.callbacks.get() {
                callbacks.error(&err);
            }
        }
        err
    }
}

/// Reject regions a session could not open on
fn check_config(config: &ChannelConfig<'_>) -> Result<()> {
    let data_len = check_region(&config.tx, config.params.ring_flags)
        .map_err(|_| IcmsgError::BadConfig("TX region cannot hold a ring"))?;
    if (data_len as usize) < frame_size(MAGIC.len()) + FREE_SPACE_DISTANCE as usize {
        return Err(IcmsgError::BadConfig("TX region cannot hold the handshake"));
    }
    check_region(&config.rx, RingFlags::empty())
        .map_err(|_| IcmsgError::BadConfig("RX region cannot hold a ring"))?;
    Ok(())
}

/// Initialize the TX ring with the magic frame and attach to the RX ring
fn attach_rings(config: ChannelConfig<'_>) -> Result<(Producer<'_>, Consumer<'_>)> {
    let ChannelConfig {
        tx,
        rx,
        cache,
        params,
    } = config;

    let consumer = Consumer::attach_with_cache(rx, cache)?;
    let mut producer = Producer::init_with_cache(tx, params.ring_flags, cache)?
        .with_policy(params.alloc_policy);
    if producer.write(&MAGIC)? != MAGIC.len() {
        return Err(IcmsgError::BadConfig("TX region cannot hold the handshake"));
    }
    Ok((producer, consumer))
}

impl<P: SignalPort, T: NotifyTimer> core::fmt::Debug for ChannelSession<'_, P, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("state", &self.state())
            .field("failed", &self.is_failed())
            .field("tx_reserved", &self.tx_reserved.load(Ordering::Relaxed))
            .field("params", &self.params.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTimer;
    use alloc::vec::Vec;
    use core::time::Duration;
    use ipc_mbox::{DomainId, LineId, LoopbackFabric, LoopbackPort, MboxError};
    use spsc_pbuf::SharedMemory;

    #[derive(Default)]
    struct Recorder {
        bound: AtomicU8,
        frames: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<IcmsgError>>,
        hold_next: AtomicBool,
    }

    impl ChannelCallbacks for Recorder {
        fn bound(&self) {
            self.bound.fetch_add(1, Ordering::Relaxed);
        }

        fn received(&self, data: &[u8], hold: &mut RxHold) {
            self.frames.lock().push(data.to_vec());
            if self.hold_next.swap(false, Ordering::Relaxed) {
                hold.hold();
            }
        }

        fn error(&self, err: &IcmsgError) {
            self.errors.lock().push(*err);
        }
    }

    type Session<'a> = ChannelSession<'a, LoopbackPort, ManualTimer>;

    struct Pair<'a> {
        a: Session<'a>,
        b: Session<'a>,
        a_cb: Arc<Recorder>,
        b_cb: Arc<Recorder>,
    }

    fn pair<'a>(ab: &'a mut SharedMemory, ba: &'a mut SharedMemory) -> Pair<'a> {
        let fabric = LoopbackFabric::new(2);
        let (ab_tx, ab_rx) = ab.split();
        let (ba_tx, ba_rx) = ba.split();

        let a = Session::new(fabric.port(DomainId(0)).unwrap(), ManualTimer::new());
        let b = Session::new(fabric.port(DomainId(1)).unwrap(), ManualTimer::new());
        let a_cb = Arc::new(Recorder::default());
        let b_cb = Arc::new(Recorder::default());

        let a_config = ChannelConfig::builder()
            .tx(ab_tx)
            .rx(ba_rx)
            .peer(DomainId(1))
            .tx_line(1)
            .rx_line(1)
            .build()
            .unwrap();
        let b_config = ChannelConfig::builder()
            .tx(ba_tx)
            .rx(ab_rx)
            .peer(DomainId(0))
            .tx_line(1)
            .rx_line(1)
            .build()
            .unwrap();

        a.open(a_config, Arc::clone(&a_cb)).unwrap();
        b.open(b_config, Arc::clone(&b_cb)).unwrap();

        Pair { a, b, a_cb, b_cb }
    }

    #[test]
    fn test_handshake_and_send() {
        let mut ab = SharedMemory::new(256);
        let mut ba = SharedMemory::new(256);
        let p = pair(&mut ab, &mut ba);

        assert_eq!(p.a.state(), ChannelState::Busy);
        assert_eq!(p.a.send(b"early"), Err(IcmsgError::NotReady));

        p.a.on_signal().unwrap();
        p.b.on_signal().unwrap();
        assert!(p.a.is_ready() && p.b.is_ready());
        assert_eq!(p.a_cb.bound.load(Ordering::Relaxed), 1);

        assert_eq!(p.a.send(b"hello").unwrap(), 5);
        assert_eq!(p.a.send(b"world").unwrap(), 5);
        p.b.on_signal().unwrap();
        assert_eq!(*p.b_cb.frames.lock(), vec![b"hello".to_vec(), b"world".to_vec()]);
        assert!(p.a_cb.frames.lock().is_empty());
    }

    #[test]
    fn test_open_twice() {
        let mut ab = SharedMemory::new(256);
        let mut ba = SharedMemory::new(256);
        let mut extra = SharedMemory::new(256);
        let p = pair(&mut ab, &mut ba);

        let (tx, rx) = extra.split();
        let config = ChannelConfig::builder().tx(tx).rx(rx).build().unwrap();
        assert_eq!(p.a.open(config, ()), Err(IcmsgError::AlreadyOpen));
    }

    #[test]
    fn test_open_rejects_small_tx_region() {
        let mut tx = SharedMemory::new(32);
        let mut rx = SharedMemory::new(256);
        let fabric = LoopbackFabric::new(2);
        let session = Session::new(fabric.port(DomainId(0)).unwrap(), ManualTimer::new());

        let config = ChannelConfig::builder()
            .tx(tx.split().0)
            .rx(rx.split().1)
            .build()
            .unwrap();
        assert!(matches!(session.open(config, ()), Err(IcmsgError::BadConfig(_))));
        assert_eq!(session.state(), ChannelState::Off);
    }

    /// Loopback port whose next `enable` or `raise` can be made to fail
    struct FlakyPort {
        inner: LoopbackPort,
        fail_enable: AtomicBool,
        fail_raise: AtomicBool,
    }

    impl FlakyPort {
        fn new(inner: LoopbackPort) -> Self {
            Self {
                inner,
                fail_enable: AtomicBool::new(false),
                fail_raise: AtomicBool::new(false),
            }
        }
    }

    impl SignalPort for FlakyPort {
        fn enable(&self, mask: LineMask) -> ipc_mbox::Result<()> {
            if self.fail_enable.swap(false, Ordering::AcqRel) {
                return Err(MboxError::NotLocal);
            }
            self.inner.enable(mask)
        }

        fn disable(&self, mask: LineMask) -> ipc_mbox::Result<()> {
            self.inner.disable(mask)
        }

        fn raise(&self, domain: DomainId, line: LineId) -> ipc_mbox::Result<()> {
            if self.fail_raise.swap(false, Ordering::AcqRel) {
                return Err(MboxError::UnknownDomain { domain: domain.0 });
            }
            self.inner.raise(domain, line)
        }

        fn take_pending(&self, mask: LineMask) -> LineMask {
            self.inner.take_pending(mask)
        }
    }

    fn config<'a>(tx: &'a mut SharedMemory, rx: &'a mut SharedMemory) -> ChannelConfig<'a> {
        ChannelConfig::builder()
            .tx(tx.split().0)
            .rx(rx.split().1)
            .peer(DomainId(1))
            .tx_line(1)
            .rx_line(1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_open_rejects_small_rx_region() {
        let mut tx = SharedMemory::new(256);
        let mut rx = SharedMemory::new(8);
        let fabric = LoopbackFabric::new(2);
        let session = Session::new(fabric.port(DomainId(0)).unwrap(), ManualTimer::new());

        let err = session.open(config(&mut tx, &mut rx), ()).unwrap_err();
        assert_eq!(err, IcmsgError::BadConfig("RX region cannot hold a ring"));
        assert_eq!(session.state(), ChannelState::Off);
    }

    #[test]
    fn test_open_recovers_from_enable_failure() {
        let (mut tx1, mut rx1) = (SharedMemory::new(256), SharedMemory::new(256));
        let (mut tx2, mut rx2) = (SharedMemory::new(256), SharedMemory::new(256));
        let fabric = LoopbackFabric::new(2);
        let port = FlakyPort::new(fabric.port(DomainId(0)).unwrap());
        port.fail_enable.store(true, Ordering::Relaxed);
        let session = ChannelSession::new(port, ManualTimer::new());
        let cb = Arc::new(Recorder::default());

        let err = session.open(config(&mut tx1, &mut rx1), Arc::clone(&cb));
        assert_eq!(err, Err(IcmsgError::Signal(MboxError::NotLocal)));
        assert_eq!(session.state(), ChannelState::Off);
        assert_eq!(session.timer().deadline(), None);

        session.open(config(&mut tx2, &mut rx2), Arc::clone(&cb)).unwrap();
        assert_eq!(session.state(), ChannelState::Busy);
        assert!(session.timer().deadline().is_some());
    }

    #[test]
    fn test_failed_announce_left_to_timer() {
        let mut tx = SharedMemory::new(256);
        let mut rx = SharedMemory::new(256);
        let fabric = LoopbackFabric::new(2);
        let port = FlakyPort::new(fabric.port(DomainId(0)).unwrap());
        port.fail_raise.store(true, Ordering::Relaxed);
        let session = ChannelSession::new(port, ManualTimer::new());

        session.open(config(&mut tx, &mut rx), ()).unwrap();
        assert_eq!(session.state(), ChannelState::Busy);
        assert!(session.timer().deadline().is_some());
        assert!(matches!(session.on_notify_timer(), Ok(TimerAction::Reschedule(_))));
    }

    #[test]
    fn test_empty_message_leaves_ring_untouched() {
        let mut ab = SharedMemory::new(256);
        let mut ba = SharedMemory::new(256);
        let p = pair(&mut ab, &mut ba);
        p.a.on_signal().unwrap();
        p.b.on_signal().unwrap();

        let before = p.a.tx.lock().as_ref().unwrap().state();
        assert_eq!(p.a.send(&[]), Err(IcmsgError::EmptyMessage));
        assert_eq!(p.a.tx.lock().as_ref().unwrap().state(), before);
    }

    #[test]
    fn test_send_while_reserved_is_busy() {
        let mut ab = SharedMemory::new(256);
        let mut ba = SharedMemory::new(256);
        let p = pair(&mut ab, &mut ba);
        p.a.on_signal().unwrap();
        p.b.on_signal().unwrap();

        let reservation = p.a.reserve_tx_buffer().unwrap();
        assert_eq!(p.a.send(b"blocked"), Err(IcmsgError::Busy));
        assert_eq!(p.a.send(b"blocked"), Err(IcmsgError::Busy));
        drop(reservation);
        assert_eq!(p.a.send(b"free").unwrap(), 4);
    }

    #[test]
    fn test_truncated_send_is_reported() {
        let mut ab = SharedMemory::new(128);
        let mut ba = SharedMemory::new(128);
        let p = pair(&mut ab, &mut ba);
        p.a.on_signal().unwrap();
        p.b.on_signal().unwrap();

        // 112 data bytes; the handshake left both indices at 20, so after
        // 84 more only 8 tail bytes remain and the frame wraps into the 16
        // bytes in front of rd.
        assert_eq!(p.a.send(&[1u8; 80]).unwrap(), 80);
        let err = p.a.send(&[2u8; 40]).unwrap_err();
        assert_eq!(err, IcmsgError::Truncated { requested: 40, written: 12 });

        p.b.on_signal().unwrap();
        let frames = p.b_cb.frames.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], vec![2u8; 12]);
    }

    #[test]
    fn test_on_signal_without_data_is_noop() {
        let mut ab = SharedMemory::new(256);
        let mut ba = SharedMemory::new(256);
        let p = pair(&mut ab, &mut ba);
        p.a.on_signal().unwrap();
        p.b.on_signal().unwrap();

        for _ in 0..3 {
            p.b.on_signal().unwrap();
        }
        assert!(p.b_cb.frames.lock().is_empty());
        assert_eq!(p.b_cb.bound.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_hold_defers_delivery() {
        let mut ab = SharedMemory::new(256);
        let mut ba = SharedMemory::new(256);
        let p = pair(&mut ab, &mut ba);
        p.a.on_signal().unwrap();
        p.b.on_signal().unwrap();

        p.b_cb.hold_next.store(true, Ordering::Relaxed);
        p.a.send(b"first").unwrap();
        p.a.send(b"second").unwrap();
        p.b.on_signal().unwrap();
        assert_eq!(p.b_cb.frames.lock().len(), 1);

        let held = p.b.held_rx_frame(|frame| frame.to_vec()).unwrap();
        assert_eq!(held, b"first");

        p.b.release_rx_buffer().unwrap();
        assert_eq!(p.b_cb.frames.lock().len(), 2);
        assert_eq!(p.b.release_rx_buffer(), Err(IcmsgError::NoHeldBuffer));
    }

    #[test]
    fn test_timer_reannounces_until_ready() {
        let mut ab = SharedMemory::new(256);
        let mut ba = SharedMemory::new(256);
        let p = pair(&mut ab, &mut ba);

        assert_eq!(p.a.timer.deadline(), Some(Duration::from_millis(10)));
        assert!(p.a.timer.advance(Duration::from_millis(10)));
        assert_eq!(
            p.a.on_notify_timer().unwrap(),
            TimerAction::Reschedule(Duration::from_millis(1))
        );
        assert_eq!(p.a.timer.deadline(), Some(Duration::from_millis(11)));

        p.a.on_signal().unwrap();
        assert!(p.a.is_ready());
        assert_eq!(p.a.on_notify_timer().unwrap(), TimerAction::Stop);
    }

    #[test]
    fn test_corrupted_handshake_reported_once() {
        let mut ab = SharedMemory::new(256);
        let mut ba = SharedMemory::new(256);
        let fabric = LoopbackFabric::new(2);
        let (ab_tx, _) = ab.split();
        let (ba_tx, ba_rx) = ba.split();

        let mut bogus = MAGIC;
        bogus[12] ^= 0xFF;
        let mut peer = Producer::init(ba_tx, RingFlags::empty()).unwrap();
        peer.write(&bogus).unwrap();

        let a = Session::new(fabric.port(DomainId(0)).unwrap(), ManualTimer::new());
        let a_cb = Arc::new(Recorder::default());
        let config = ChannelConfig::builder()
            .tx(ab_tx)
            .rx(ba_rx)
            .peer(DomainId(1))
            .build()
            .unwrap();
        a.open(config, Arc::clone(&a_cb)).unwrap();

        assert_eq!(a.on_signal(), Err(IcmsgError::HandshakeCorrupted));
        assert_eq!(a.on_signal(), Ok(()));
        assert!(a.is_failed());
        assert_eq!(a.state(), ChannelState::Busy);
        assert_eq!(*a_cb.errors.lock(), vec![IcmsgError::HandshakeCorrupted]);
        assert_eq!(a_cb.bound.load(Ordering::Relaxed), 0);
        assert_eq!(a.on_notify_timer().unwrap(), TimerAction::Stop);
    }
}
