//! Endpoint layer over a single channel session
//!
//! An [`Instance`] owns one [`ChannelSession`] and hands it out as one named
//! endpoint. Registering the endpoint opens the session; the endpoint's
//! `bound` callback fires once the peer completes the handshake.

use alloc::boxed::Box;
use alloc::sync::Arc;

use ipc_mbox::SignalPort;
use log::info;

use crate::config::ChannelConfig;
use crate::session::{ChannelCallbacks, ChannelSession, RxHold};
use crate::timer::{NotifyTimer, TimerAction};
use crate::{IcmsgError, Result};

/// Identity of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig<'n> {
    pub name: &'n str,
    /// Informational; a single-endpoint instance has nothing to arbitrate
    pub priority: u8,
}

/// Endpoint upcalls, called with the endpoint name for logging
pub trait EndpointCallbacks: Send + Sync {
    fn bound(&self) {}
    fn received(&self, _data: &[u8], _hold: &mut RxHold) {}
    fn error(&self, _message: &str) {}
}

struct Adapter<'n, C> {
    name: &'n str,
    inner: C,
}

impl<C: EndpointCallbacks> ChannelCallbacks for Adapter<'_, C> {
    fn bound(&self) {
        info!("ipc: endpoint '{}' bound", self.name);
        self.inner.bound();
    }

    fn received(&self, data: &[u8], hold: &mut RxHold) {
        self.inner.received(data, hold);
    }

    fn error(&self, err: &IcmsgError) {
        let message = alloc::format!("{}", err);
        self.inner.error(&message);
    }
}

/// One icmsg channel exposed as an endpoint
pub struct Instance<'a, P: SignalPort, T: NotifyTimer> {
    session: ChannelSession<'a, P, T>,
    config: spin::Mutex<Option<ChannelConfig<'a>>>,
}

impl<'a, P: SignalPort, T: NotifyTimer> Instance<'a, P, T> {
    /// Instance whose channel is opened on endpoint registration
    pub fn new(port: P, timer: T, config: ChannelConfig<'a>) -> Self {
        Self {
            session: ChannelSession::new(port, timer),
            config: spin::Mutex::new(Some(config)),
        }
    }

    /// Register the instance's only endpoint and open the channel
    ///
    /// The channel configuration is kept when opening fails, so registration
    /// can be retried once the cause is cleared.
    ///
    /// # Errors
    /// - `AlreadyOpen` if an endpoint is already registered
    /// - anything [`ChannelSession::open`] reports
    pub fn register_endpoint<C>(
        &self,
        endpoint: EndpointConfig<'a>,
        callbacks: C,
    ) -> Result<Endpoint<'_, 'a, P, T>>
    where
        C: EndpointCallbacks + 'a,
    {
        let adapter = Adapter {
            name: endpoint.name,
            inner: callbacks,
        };
        self.session.open_from(&mut self.config.lock(), adapter)?;

        info!(
            "ipc: endpoint '{}' registered (priority {})",
            endpoint.name, endpoint.priority
        );
        Ok(Endpoint {
            instance: self,
            name: endpoint.name,
        })
    }

    /// Session backing the endpoint; route doorbell and timer events here
    pub fn session(&self) -> &ChannelSession<'a, P, T> {
        &self.session
    }

    pub fn on_signal(&self) -> Result<()> {
        self.session.on_signal()
    }

    pub fn on_notify_timer(&self) -> Result<TimerAction> {
        self.session.on_notify_timer()
    }
}

/// Handle to a registered endpoint
pub struct Endpoint<'i, 'a, P: SignalPort, T: NotifyTimer> {
    instance: &'i Instance<'a, P, T>,
    name: &'a str,
}

impl<P: SignalPort, T: NotifyTimer> Endpoint<'_, '_, P, T> {
    pub fn name(&self) -> &str {
        self.name
    }

    /// See [`ChannelSession::send`]
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.instance.session.send(data)
    }

    /// See [`ChannelSession::release_rx_buffer`]
    pub fn release_rx_buffer(&self) -> Result<()> {
        self.instance.session.release_rx_buffer()
    }

    pub fn is_bound(&self) -> bool {
        self.instance.session.is_ready()
    }
}

impl<P: SignalPort, T: NotifyTimer> core::fmt::Debug for Endpoint<'_, '_, P, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl<C: EndpointCallbacks + ?Sized> EndpointCallbacks for Arc<C> {
    fn bound(&self) {
        (**self).bound()
    }

    fn received(&self, data: &[u8], hold: &mut RxHold) {
        (**self).received(data, hold)
    }

    fn error(&self, message: &str) {
        (**self).error(message)
    }
}

impl<C: EndpointCallbacks + ?Sized> EndpointCallbacks for Box<C> {
    fn bound(&self) {
        (**self).bound()
    }

    fn received(&self, data: &[u8], hold: &mut RxHold) {
        (**self).received(data, hold)
    }

    fn error(&self, message: &str) {
        (**self).error(message)
    }
}
