//! Dispatch engine
//!
//! One thread runs [`Dispatcher::run`], which loops forever over
//!
//! 1. POLL_RX: pull a burst of frames from the NIC port
//! 2. CLASSIFY + FORWARD: route each frame by destination MAC into a client
//!    worker's ingress queue, or fan it out to every client for broadcast
//! 3. POLL_COMPLETIONS: release buffers runtimes have finished with
//! 4. POLL_CONTROL: apply a bounded burst of add/remove requests
//!
//! Nothing in the loop blocks or takes a lock. Resource exhaustion (empty
//! pool, full ingress queue, full control channel) loses the affected packet
//! or notification and is logged; it never stops the loop.

use std::io;
use std::mem;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smoltcp::wire::EthernetAddress;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::client::{Client, RX_NET_RECV, TxCommand};
use crate::config::{ConfigError, DataplaneConfig};
use crate::control::{ControlMsg, DataplaneLink};
use crate::lrpc::LrpcError;
use crate::nic::NicPort;
use crate::packet::{Destination, RX_NET_HDR_SIZE, classify, prepend_rx_preamble};
use crate::pool::{PacketBuf, PacketPool, PoolError, SharedBuf};
use crate::registry::{ClientRegistry, RegistryError};
use crate::shm::ShmPtr;

/// Iterations between periodic stats logs
const STATS_INTERVAL: u64 = 1 << 24;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("packet pool: {0}")]
    Pool(#[from] PoolError),

    #[error("NIC port: {0}")]
    Nic(#[from] io::Error),

    #[error("control channel: {0}")]
    Channel(#[from] LrpcError),
}

/// Dispatch counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub unicast_delivered: u64,
    /// One per successful per-client broadcast enqueue
    pub broadcast_delivered: u64,
    pub dropped_unregistered: u64,
    pub dropped_no_clients: u64,
    pub dropped_unsupported: u64,
    pub dropped_queue_full: u64,
    pub dropped_headroom: u64,
    pub completions: u64,
    pub control_messages: u64,
    pub tx_packets: u64,
    pub tx_dropped: u64,
}

pub struct Dispatcher<P: NicPort> {
    port: P,
    pool: Arc<PacketPool>,
    registry: ClientRegistry,
    link: DataplaneLink,
    config: DataplaneConfig,
    rng: StdRng,
    /// Reused RX burst vector
    rx_bufs: Vec<PacketBuf>,
    tx_pending: Vec<PacketBuf>,
    stats: DispatchStats,
}

impl<P: NicPort> Dispatcher<P> {
    pub fn new(
        port: P,
        pool: Arc<PacketPool>,
        link: DataplaneLink,
        config: DataplaneConfig,
    ) -> Result<Self, InitError> {
        config.validate()?;
        if pool.headroom() < RX_NET_HDR_SIZE {
            return Err(PoolError::InsufficientHeadroom {
                needed: RX_NET_HDR_SIZE,
                available: pool.headroom(),
            }
            .into());
        }
        Ok(Self {
            port,
            pool,
            registry: ClientRegistry::with_capacity(config.max_clients),
            link,
            rng: StdRng::from_entropy(),
            rx_bufs: Vec::with_capacity(config.rx_burst),
            tx_pending: Vec::with_capacity(config.rx_burst),
            stats: DispatchStats::default(),
            config,
        })
    }

    /// Use a deterministic worker-thread selection sequence.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Run the dispatch loop forever.
    pub fn run(&mut self) -> ! {
        if let (Some(port_node), Some(poll_node)) = (self.port.numa_node(), self.config.numa_node)
            && port_node != poll_node
        {
            warn!(
                port = self.port.name(),
                port_numa_node = port_node,
                poll_numa_node = poll_node,
                "NIC port is on a remote NUMA node, performance may suffer"
            );
        }
        info!(
            port = self.port.name(),
            mac = %self.port.mac_address(),
            rx_burst = self.config.rx_burst,
            control_burst = self.config.control_burst,
            "Dispatcher running"
        );

        let mut iterations: u64 = 0;
        loop {
            self.poll_once();
            iterations = iterations.wrapping_add(1);
            if iterations % STATS_INTERVAL == 0 {
                debug!(stats = ?self.stats, available = self.pool.available(), "Dispatcher stats");
            }
        }
    }

    /// One loop iteration. Returns the number of frames received.
    pub fn poll_once(&mut self) -> usize {
        let received = self.poll_rx();
        self.poll_completions();
        self.poll_control();
        received
    }

    /// Receive one burst from the port and forward every frame.
    pub fn poll_rx(&mut self) -> usize {
        let mut bufs = mem::take(&mut self.rx_bufs);
        if let Err(e) = self
            .port
            .rx_burst(&self.pool, &mut bufs, self.config.rx_burst)
        {
            self.stats.rx_errors += 1;
            warn!(port = self.port.name(), error = %e, "RX burst failed");
        }
        let received = bufs.len();
        for buf in bufs.drain(..) {
            self.dispatch(buf);
        }
        self.rx_bufs = bufs;
        received
    }

    /// Classify one received frame and hand it on.
    pub fn dispatch(&mut self, buf: PacketBuf) {
        self.stats.rx_packets += 1;
        match classify(buf.data()) {
            Destination::Unicast(dst) => self.forward_unicast(buf, dst),
            Destination::Broadcast if !self.registry.is_empty() => self.forward_broadcast(buf),
            Destination::Broadcast => {
                trace!("Broadcast frame with no clients, dropping");
                self.stats.dropped_no_clients += 1;
            }
            Destination::Multicast(dst) => {
                warn!(mac = %dst, "Unhandled packet with MAC");
                self.stats.dropped_unsupported += 1;
            }
            Destination::Malformed => {
                warn!(len = buf.len(), "Frame shorter than Ethernet header");
                self.stats.dropped_unsupported += 1;
            }
        }
    }

    fn forward_unicast(&mut self, mut buf: PacketBuf, dst: EthernetAddress) {
        let Some(client) = self.registry.lookup(&dst) else {
            warn!(mac = %dst, "Received packet for unregistered MAC");
            self.stats.dropped_unregistered += 1;
            return;
        };
        if let Err(e) = prepend_rx_preamble(&mut buf) {
            error!(error = %e, "Failed to prepend receive preamble");
            self.stats.dropped_headroom += 1;
            return;
        }

        let shared = buf.into_shared();
        if enqueue_to_runtime(&mut self.rng, client, &shared) {
            let _ = shared.into_raw();
            self.stats.unicast_delivered += 1;
        } else {
            warn!(pid = client.pid(), "Ingress queue full, dropping packet");
            self.stats.dropped_queue_full += 1;
        }
    }

    fn forward_broadcast(&mut self, mut buf: PacketBuf) {
        if let Err(e) = prepend_rx_preamble(&mut buf) {
            error!(error = %e, "Failed to prepend receive preamble");
            self.stats.dropped_headroom += 1;
            return;
        }

        // The first handle keeps the buffer alive during fan-out; every
        // attempt holds its own share, kept only if the enqueue succeeds.
        let shared = buf.into_shared();
        let mut delivered = 0;
        for client in self.registry.broadcast_targets() {
            let share = shared.clone();
            if enqueue_to_runtime(&mut self.rng, client, &share) {
                let _ = share.into_raw();
                delivered += 1;
            } else {
                warn!(pid = client.pid(), "Ingress queue full, dropping broadcast copy");
                self.stats.dropped_queue_full += 1;
            }
        }
        trace!(delivered, ptr = ?shared.shm_ptr(), "Broadcast fan-out done");
        self.stats.broadcast_delivered += delivered;
    }

    /// Release buffers runtimes reported as consumed, at most
    /// `completion_burst` per worker thread.
    pub fn poll_completions(&mut self) -> usize {
        let budget = self.config.completion_burst;
        let mut handled = 0;
        for client in self.registry.broadcast_targets() {
            handled += reclaim_completions(&self.pool, &mut self.stats, client, budget);
        }
        handled
    }

    /// Apply up to `control_burst` control messages.
    pub fn poll_control(&mut self) -> usize {
        let mut handled = 0;
        while handled < self.config.control_burst {
            let Some(msg) = self.link.commands.recv() else {
                break;
            };
            handled += 1;
            self.stats.control_messages += 1;
            match msg {
                ControlMsg::AddClient(client) => self.add_client(client),
                ControlMsg::RemoveClient(client) => {
                    let _ = self.remove_client(&client);
                }
                ControlMsg::ClientRemoved(client) => {
                    warn!(pid = client.pid(), "Unexpected CLIENT_REMOVED on command channel");
                }
                ControlMsg::Unknown { cmd, .. } => {
                    error!(cmd, "Received unrecognized command");
                }
            }
        }
        handled
    }

    /// Register `client`. A full table is reported back to the control plane
    /// as an immediate removal.
    pub fn add_client(&mut self, client: Arc<Client>) {
        let pid = client.pid();
        let mac = client.mac();
        match self.registry.add_client(Arc::clone(&client)) {
            Ok(()) => info!(pid, mac = %mac, threads = client.thread_count(), "Client added"),
            Err(e) => {
                error!(pid, mac = %mac, error = %e, "Cannot add client");
                self.notify_removed(client);
            }
        }
    }

    /// Unregister `client` and acknowledge to the control plane.
    pub fn remove_client(&mut self, client: &Arc<Client>) -> Result<(), RegistryError> {
        let removed = match self.registry.remove_client(client) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(pid = client.pid(), "Expected to find client");
                return Err(e);
            }
        };
        // Completions posted before removal are never polled again
        let reclaimed = reclaim_completions(&self.pool, &mut self.stats, &removed, usize::MAX);
        // TODO: reclaim ingress buffers still queued for a removed client
        info!(pid = removed.pid(), mac = %removed.mac(), reclaimed, "Client removed");
        self.notify_removed(removed);
        Ok(())
    }

    fn notify_removed(&mut self, client: Arc<Client>) {
        if let Err(msg) = self.link.notifications.send(ControlMsg::ClientRemoved(client)) {
            error!(cmd = ?msg.command(), "Failed to inform control plane of client removal");
        }
    }

    /// Queue a frame for transmission on the port.
    pub fn queue_tx(&mut self, buf: PacketBuf) {
        self.tx_pending.push(buf);
    }

    /// Transmit queued frames; frames the port does not accept are dropped.
    pub fn flush_tx(&mut self) -> usize {
        let sent = match self.port.tx_burst(&mut self.tx_pending) {
            Ok(sent) => sent,
            Err(e) => {
                warn!(port = self.port.name(), error = %e, "TX burst failed");
                0
            }
        };
        self.stats.tx_packets += sent as u64;
        if !self.tx_pending.is_empty() {
            debug!(dropped = self.tx_pending.len(), "TX ring full, dropping frames");
            self.stats.tx_dropped += self.tx_pending.len() as u64;
            self.tx_pending.clear();
        }
        sent
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

/// Drain up to `budget` command words from each worker thread of `client`.
fn reclaim_completions(
    pool: &Arc<PacketPool>,
    stats: &mut DispatchStats,
    client: &Client,
    budget: usize,
) -> usize {
    let mut handled = 0;
    for thread in client.threads() {
        let mut drained = 0;
        while drained < budget {
            let Some(msg) = thread.txcmdq().recv() else {
                break;
            };
            drained += 1;
            match TxCommand::from(msg.cmd) {
                TxCommand::NetComplete => {
                    // SAFETY: runtimes are trusted to complete each ingress
                    // reference exactly once. A duplicate completion recycles
                    // a buffer that may still be shared or already reused;
                    // only pointers outside the pool or to free buffers are
                    // caught here.
                    match unsafe { pool.reclaim(ShmPtr::new(msg.payload)) } {
                        Ok(buf) => {
                            drop(buf);
                            stats.completions += 1;
                        }
                        Err(e) => {
                            warn!(pid = client.pid(), error = %e, "Invalid completion from runtime");
                        }
                    }
                }
                TxCommand::Unknown(cmd) => {
                    warn!(pid = client.pid(), cmd, "Unknown runtime command");
                }
            }
        }
        handled += drained;
    }
    handled
}

/// Hand one reference to a uniformly chosen worker thread of `client`.
///
/// On success the caller must give up its handle with `into_raw`; the runtime
/// now owns the reference.
#[inline]
fn enqueue_to_runtime(rng: &mut StdRng, client: &Client, buf: &SharedBuf) -> bool {
    let threads = client.threads();
    let thread = &threads[rng.gen_range(0..threads.len())];
    thread.rxq().send(RX_NET_RECV, buf.shm_ptr().into())
}
