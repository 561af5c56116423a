//! In-memory lossy network for deterministic testing.
//!
//! Real networks drop, delay, reorder and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`SimulatedLink::pair`] returns two connected [`SimChannel`]s that
//! implement [`DatagramChannel`] and apply a [`FaultPlan`] to everything
//! they send:
//!
//! | Fault            | Description                                        |
//! |------------------|----------------------------------------------------|
//! | Scripted drop    | Drop the n-th segment of a given type.             |
//! | Random loss      | Drop any segment with probability `loss_rate`.     |
//! | Duplication      | Deliver a segment twice (`duplicate_rate`).        |
//! | Latency          | Deliver every segment `latency` after it was sent. |
//! | Reordering       | Hold a segment back by an extra `reorder_delay`,   |
//! |                  | letting later segments overtake it.                |
//!
//! Randomness comes from a seeded [`StdRng`] so failures are reproducible.
//! Time is tokio time: under `#[tokio::test(start_paused = true)]` every
//! timeout and latency elapses instantly and deterministically.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::packet::{Segment, SegmentType};
use crate::socket::{DatagramChannel, DEFAULT_RECEIVE_TIMEOUT};

/// Drop the `nth` (1-based) segment of type `kind` sent in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropRule {
    pub kind: SegmentType,
    pub nth: u32,
}

impl DropRule {
    pub fn nth(kind: SegmentType, nth: u32) -> Self {
        Self { kind, nth }
    }

    pub fn first(kind: SegmentType) -> Self {
        Self::nth(kind, 1)
    }
}

/// Fault model for one direction of a link.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct FaultPlan {
    pub drops: Vec<DropRule>,
    /// Probability that any given segment is silently dropped.
    pub loss_rate: f64,
    /// Probability that a delivered segment is delivered twice.
    pub duplicate_rate: f64,
    /// One-way delay applied to every segment.
    pub latency: Duration,
    /// Probability that a segment is held back by `reorder_delay`.
    pub reorder_rate: f64,
    /// Extra delay applied to reordered segments.
    pub reorder_delay: Duration,
    pub seed: u64,
}

impl Default for FaultPlan {
    fn default() -> Self {
        // No faults by default; the link is a transparent pass-through.
        Self {
            drops: Vec::new(),
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            latency: Duration::from_millis(5),
            reorder_rate: 0.0,
            reorder_delay: Duration::ZERO,
            seed: 0,
        }
    }
}

impl FaultPlan {
    /// Pass-through plan that drops the listed segments.
    pub fn dropping(drops: impl IntoIterator<Item = DropRule>) -> Self {
        Self {
            drops: drops.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Random loss and duplication driven by `seed`.
    pub fn lossy(loss_rate: f64, duplicate_rate: f64, seed: u64) -> Self {
        Self {
            loss_rate,
            duplicate_rate,
            seed,
            ..Self::default()
        }
    }

    /// Hold back segments with probability `reorder_rate` so that later ones
    /// overtake them.
    pub fn reordering(reorder_rate: f64, reorder_delay: Duration, seed: u64) -> Self {
        Self {
            reorder_rate,
            reorder_delay,
            seed,
            ..Self::default()
        }
    }

    /// Replace the one-way latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every segment is lost.
    pub fn black_hole() -> Self {
        Self {
            loss_rate: 1.0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: HashMap<SegmentType, u32>,
    dropped: HashMap<SegmentType, u32>,
    duplicated: HashMap<SegmentType, u32>,
    reordered: HashMap<SegmentType, u32>,
}

/// Shared per-direction counters, readable after the channel is gone.
#[derive(Debug, Clone, Default)]
pub struct LinkStats(Arc<Mutex<Counters>>);

impl LinkStats {
    /// Segments of `kind` handed to the link (including dropped ones).
    pub fn sent(&self, kind: SegmentType) -> u32 {
        self.read(|c| c.sent.get(&kind).copied().unwrap_or(0))
    }

    /// Segments of `kind` the fault plan discarded.
    pub fn dropped(&self, kind: SegmentType) -> u32 {
        self.read(|c| c.dropped.get(&kind).copied().unwrap_or(0))
    }

    /// Segments of `kind` delivered a second time.
    pub fn duplicated(&self, kind: SegmentType) -> u32 {
        self.read(|c| c.duplicated.get(&kind).copied().unwrap_or(0))
    }

    /// Segments of `kind` held back by the reorder fault.
    pub fn reordered(&self, kind: SegmentType) -> u32 {
        self.read(|c| c.reordered.get(&kind).copied().unwrap_or(0))
    }

    fn read<R>(&self, f: impl FnOnce(&Counters) -> R) -> R {
        f(&self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn update(&self, f: impl FnOnce(&mut Counters)) {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Debug)]
struct InTransit {
    deliver_at: Instant,
    from: SocketAddr,
    bytes: Vec<u8>,
}

/// Factory for connected [`SimChannel`] pairs.
pub struct SimulatedLink;

impl SimulatedLink {
    /// Address of the first endpoint returned by [`SimulatedLink::pair`].
    pub const A: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4000);
    /// Address of the second endpoint.
    pub const B: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 4000);

    /// Two endpoints; `a_to_b` governs what A sends, `b_to_a` what B sends.
    pub fn pair(a_to_b: FaultPlan, b_to_a: FaultPlan) -> (SimChannel, SimChannel) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let a = SimChannel::new(Self::A, Self::B, tx_ab, rx_ba, a_to_b);
        let b = SimChannel::new(Self::B, Self::A, tx_ba, rx_ab, b_to_a);
        (a, b)
    }
}

/// One endpoint of a [`SimulatedLink`].
#[derive(Debug)]
pub struct SimChannel {
    local: SocketAddr,
    remote: SocketAddr,
    bound: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<InTransit>,
    inbound: mpsc::UnboundedReceiver<InTransit>,
    /// Datagrams taken off `inbound` whose delivery time has not come yet,
    /// in arrival order.
    queued: Vec<InTransit>,
    /// Set once the far end is dropped; `inbound` will never yield again.
    far_end_gone: bool,
    plan: FaultPlan,
    rng: StdRng,
    seen: HashMap<SegmentType, u32>,
    stats: LinkStats,
    receive_timeout: Duration,
    closed: bool,
}

impl SimChannel {
    fn new(
        local: SocketAddr,
        remote: SocketAddr,
        outbound: mpsc::UnboundedSender<InTransit>,
        inbound: mpsc::UnboundedReceiver<InTransit>,
        plan: FaultPlan,
    ) -> Self {
        Self {
            local,
            remote,
            bound: None,
            outbound,
            inbound,
            queued: Vec::new(),
            far_end_gone: false,
            rng: StdRng::seed_from_u64(plan.seed),
            plan,
            seen: HashMap::new(),
            stats: LinkStats::default(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            closed: false,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Counters for everything this endpoint sends.
    pub fn stats(&self) -> LinkStats {
        self.stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel is closed"));
        }
        Ok(())
    }

    /// `true` if the plan says this datagram never arrives.
    fn should_drop(&mut self, kind: Option<SegmentType>) -> bool {
        if let Some(kind) = kind {
            let count = self.seen.entry(kind).or_insert(0);
            *count += 1;
            let nth = *count;
            if self.plan.drops.iter().any(|r| r.kind == kind && r.nth == nth) {
                return true;
            }
        }
        self.plan.loss_rate > 0.0 && self.rng.gen::<f64>() < self.plan.loss_rate
    }

    fn enqueue(&mut self, kind: Option<SegmentType>, bytes: &[u8]) {
        let mut delay = self.plan.latency;
        if self.plan.reorder_rate > 0.0 && self.rng.gen::<f64>() < self.plan.reorder_rate {
            delay += self.plan.reorder_delay;
            if let Some(kind) = kind {
                log::debug!("[sim] {} holding back {kind} by {:?}", self.local, self.plan.reorder_delay);
                self.stats.update(|c| *c.reordered.entry(kind).or_insert(0) += 1);
            }
        }
        let datagram = InTransit {
            deliver_at: Instant::now() + delay,
            from: self.local,
            bytes: bytes.to_vec(),
        };
        // The far end may already be released; like UDP, that is not an error.
        let _ = self.outbound.send(datagram);
    }
}

impl DatagramChannel for SimChannel {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    async fn connect_remote(&mut self, peer: SocketAddr) -> io::Result<()> {
        self.ensure_open()?;
        if peer != self.remote {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{peer} is not reachable on this link"),
            ));
        }
        self.bound = Some(peer);
        Ok(())
    }

    async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        let kind = Segment::decode(datagram).ok().map(|s| s.kind);

        if let Some(kind) = kind {
            self.stats.update(|c| *c.sent.entry(kind).or_insert(0) += 1);
        }
        if self.should_drop(kind) {
            if let Some(kind) = kind {
                log::debug!("[sim] {} dropped {kind}", self.local);
                self.stats.update(|c| *c.dropped.entry(kind).or_insert(0) += 1);
            }
            return Ok(());
        }

        self.enqueue(kind, datagram);
        if self.plan.duplicate_rate > 0.0 && self.rng.gen::<f64>() < self.plan.duplicate_rate {
            if let Some(kind) = kind {
                self.stats.update(|c| *c.duplicated.entry(kind).or_insert(0) += 1);
            }
            self.enqueue(kind, datagram);
        }
        Ok(())
    }

    async fn receive_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;

        loop {
            while let Ok(datagram) = self.inbound.try_recv() {
                self.queued.push(datagram);
            }

            // Earliest due first; ties keep arrival order.
            let due = self
                .queued
                .iter()
                .enumerate()
                .min_by_key(|(_, datagram)| datagram.deliver_at)
                .map(|(index, datagram)| (index, datagram.deliver_at));
            let now = Instant::now();
            if let Some((index, deliver_at)) = due {
                if deliver_at <= now {
                    let next = self.queued.remove(index);
                    let n = next.bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&next.bytes[..n]);
                    return Ok(Some((n, next.from)));
                }
            }
            if now >= deadline {
                return Ok(None);
            }

            let wake = due.map_or(deadline, |(_, deliver_at)| deliver_at.min(deadline));
            if self.far_end_gone {
                sleep_until(wake).await;
                continue;
            }
            match timeout_at(wake, self.inbound.recv()).await {
                Ok(Some(datagram)) => self.queued.push(datagram),
                Ok(None) => self.far_end_gone = true,
                Err(_elapsed) => {}
            }
        }
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }

    fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    async fn close(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        self.closed = true;
        self.queued.clear();
        self.inbound.close();
        Ok(())
    }
}
