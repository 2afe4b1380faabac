//! icmsg-loopback - Two emulated cores talking icmsg over host memory
//!
//! Each core runs on its own thread with its own mailbox registry, retry
//! timer and channel session. Both cores open, wait for the handshake, then
//! stream numbered messages at each other and verify ordering on receipt.
//!
//! Usage:
//!   icmsg-loopback --config loopback.toml --messages 50000

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use icmsg::{ChannelCallbacks, ChannelConfig, ChannelSession, IcmsgError, NotifyTimer, RxHold};
use ipc_mbox::{
    DomainId, LoopbackFabric, LoopbackPort, Mailbox, MailboxConfig, MailboxRegistry, SignalSource,
};
use spsc_pbuf::{PbufError, Region, SharedMemory};

use crate::config::LoopbackConfig;

#[derive(Parser, Debug)]
#[command(name = "icmsg-loopback")]
#[command(about = "Exchange icmsg traffic between two emulated cores")]
struct Args {
    /// TOML run configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the number of messages each core sends
    #[arg(long)]
    messages: Option<u64>,

    /// Override the shared memory size per direction
    #[arg(long)]
    ring_size: Option<usize>,

    /// Give up if the handshake has not completed after this many milliseconds
    #[arg(long, default_value_t = 1000)]
    handshake_timeout_ms: u64,
}

/// Retry timer backed by the host clock
#[derive(Default)]
struct HostTimer {
    deadline: Mutex<Option<Instant>>,
}

impl HostTimer {
    /// Consume the deadline if it has passed
    fn expired(&self) -> bool {
        let Ok(mut deadline) = self.deadline.lock() else {
            return false;
        };
        match *deadline {
            Some(at) if at <= Instant::now() => {
                *deadline = None;
                true
            }
            _ => false,
        }
    }
}

impl NotifyTimer for HostTimer {
    fn schedule(&self, after: Duration) {
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = Some(Instant::now() + after);
        }
    }

    fn cancel(&self) {
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = None;
        }
    }
}

type Session = ChannelSession<'static, Arc<Mailbox<LoopbackPort>>, HostTimer>;

/// Receive-side bookkeeping for one core
#[derive(Default)]
struct Stats {
    received: AtomicU64,
    bytes: AtomicU64,
    short: AtomicU64,
    out_of_order: AtomicU64,
}

impl ChannelCallbacks for Stats {
    fn bound(&self) {
        log::info!("channel bound");
    }

    fn received(&self, data: &[u8], _hold: &mut RxHold) {
        let expected = self.received.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

        let Some(seq) = data.get(..4).and_then(|head| <[u8; 4]>::try_from(head).ok()) else {
            self.short.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if u64::from(u32::from_le_bytes(seq)) != expected & u64::from(u32::MAX) {
            self.out_of_order.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn error(&self, err: &IcmsgError) {
        log::error!("channel error: {}", err);
    }
}

struct Core {
    name: &'static str,
    registry: MailboxRegistry<LoopbackPort>,
    session: &'static Session,
    stats: Arc<Stats>,
    full_retries: AtomicU64,
    truncated: AtomicU64,
}

impl Core {
    fn new(
        name: &'static str,
        fabric: &Arc<LoopbackFabric>,
        domain: u8,
        peer: u8,
        line: u8,
    ) -> Result<Self> {
        let port = fabric.port(DomainId(domain))?;
        let mut registry = MailboxRegistry::new();
        let mailbox = registry.register(Mailbox::new(
            port,
            MailboxConfig {
                source: SignalSource::Bellboard {
                    instance: 0,
                    irq: 64,
                },
                peer: DomainId(peer),
                local: true,
            },
        ))?;

        let session: &'static Session = Box::leak(Box::new(ChannelSession::new(
            Arc::clone(&mailbox),
            HostTimer::default(),
        )));
        mailbox.register_callback(line, move |_| {
            if let Err(err) = session.on_signal() {
                log::warn!("{}", err);
            }
        })?;

        Ok(Self {
            name,
            registry,
            session,
            stats: Arc::new(Stats::default()),
            full_retries: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
        })
    }

    fn open(
        &self,
        cfg: &LoopbackConfig,
        tx: Region<'static>,
        rx: Region<'static>,
        peer: u8,
    ) -> Result<()> {
        let config = ChannelConfig::builder()
            .tx(tx)
            .rx(rx)
            .peer(DomainId(peer))
            .tx_line(cfg.line)
            .rx_line(cfg.line)
            .ring_flags(cfg.ring_flags())
            .alloc_policy(cfg.policy.into())
            .build()?;
        self.session
            .open(config, Arc::clone(&self.stats))
            .with_context(|| format!("{}: open failed", self.name))
    }

    fn service(&self) -> Result<()> {
        if self.session.timer().expired() {
            self.session.on_notify_timer()?;
        }
        self.registry.poll();
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while !self.session.is_ready() {
            if self.session.is_failed() {
                return Err(anyhow!("{}: handshake failed", self.name));
            }
            if start.elapsed() > timeout {
                return Err(anyhow!("{}: no handshake after {:?}", self.name, timeout));
            }
            self.service()?;
            std::thread::yield_now();
        }
        Ok(())
    }

    fn run(&self, cfg: &LoopbackConfig, timeout: Duration) -> Result<()> {
        self.wait_ready(timeout)?;
        log::info!("{}: ready", self.name);

        let mut message = vec![0u8; cfg.max_len];
        let mut seq = 0u64;
        while seq < cfg.messages || self.stats.received.load(Ordering::Relaxed) < cfg.messages {
            if seq < cfg.messages {
                let len = cfg.message_len(seq);
                message[..4].copy_from_slice(&(seq as u32).to_le_bytes());
                message[4..len].fill(seq as u8);

                match self.session.send(&message[..len]) {
                    Ok(_) => seq += 1,
                    Err(IcmsgError::Truncated { .. }) => {
                        self.truncated.fetch_add(1, Ordering::Relaxed);
                        seq += 1;
                    }
                    Err(IcmsgError::Ring(PbufError::Full { .. })) => {
                        self.full_retries.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => return Err(err).context(format!("{}: send {}", self.name, seq)),
                }
            }
            self.service()?;
        }
        Ok(())
    }

    fn report(&self, elapsed: Duration) {
        let received = self.stats.received.load(Ordering::Relaxed);
        let bytes = self.stats.bytes.load(Ordering::Relaxed);
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);

        log::info!("{}:", self.name);
        log::info!("  Received:     {} messages, {} bytes", received, bytes);
        log::info!(
            "  Rate:         {:.0} msg/s, {:.1} MiB/s",
            received as f64 / secs,
            bytes as f64 / secs / (1 << 20) as f64
        );
        log::info!("  Full retries: {}", self.full_retries.load(Ordering::Relaxed));
        log::info!("  Truncated:    {}", self.truncated.load(Ordering::Relaxed));
        log::info!("  Short frames: {}", self.stats.short.load(Ordering::Relaxed));
        log::info!("  Out of order: {}", self.stats.out_of_order.load(Ordering::Relaxed));
    }
}

/// Shared memory block living for the rest of the process
fn shared(len: usize) -> (Region<'static>, Region<'static>) {
    Box::leak(Box::new(SharedMemory::new(len))).split()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = LoopbackConfig::load(args.config.as_deref())?;
    if let Some(messages) = args.messages {
        cfg.messages = messages;
    }
    if let Some(ring_size) = args.ring_size {
        cfg.ring_size = ring_size;
    }
    cfg.validate()?;

    log::info!("Configuration:");
    log::info!("  Ring size: {} bytes per direction", cfg.ring_size);
    log::info!(
        "  Messages:  {} per core, {}..={} bytes",
        cfg.messages,
        cfg.min_len,
        cfg.max_len
    );
    log::info!("  Policy:    {:?}, flags {:?}", cfg.policy, cfg.ring_flags());

    let fabric = LoopbackFabric::new(2);
    let app = Core::new("app", &fabric, 0, 1, cfg.line)?;
    let net = Core::new("net", &fabric, 1, 0, cfg.line)?;
    let (app_tx, net_rx) = shared(cfg.ring_size);
    let (net_tx, app_rx) = shared(cfg.ring_size);

    app.open(&cfg, app_tx, app_rx, 1)?;
    // The second core comes up late; the retry timer covers the gap.
    std::thread::sleep(Duration::from_millis(20));
    net.open(&cfg, net_tx, net_rx, 0)?;

    let timeout = Duration::from_millis(args.handshake_timeout_ms);
    let start = Instant::now();
    let results = crossbeam::scope(|s| {
        let a = s.spawn(|_| app.run(&cfg, timeout));
        let b = s.spawn(|_| net.run(&cfg, timeout));
        (a.join(), b.join())
    })
    .map_err(|_| anyhow!("core thread panicked"))?;
    let elapsed = start.elapsed();

    for result in [results.0, results.1] {
        result.map_err(|_| anyhow!("core thread panicked"))??;
    }

    app.report(elapsed);
    net.report(elapsed);

    let errors = [&app, &net]
        .iter()
        .map(|core| core.stats.out_of_order.load(Ordering::Relaxed))
        .sum::<u64>();
    if errors > 0 {
        return Err(anyhow!("{} messages arrived out of order", errors));
    }
    Ok(())
}
