//! Runtime clients and their per-thread queues
//!
//! A client is a runtime process that owns one MAC address and runs one or
//! more worker threads. Each worker thread has an ingress queue the
//! dispatcher produces into (`RX_NET_RECV` + buffer reference) and a command
//! queue the runtime produces into (`TX_NET_COMPLETE` + buffer reference when
//! it is done with an ingress buffer).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use smoltcp::wire::EthernetAddress;
use thiserror::Error;
use tracing::warn;

use crate::lrpc::{self, LrpcError, LrpcReceiver, LrpcSender};
use crate::shm::ShmPtr;

/// Maximum worker threads per client
pub const MAX_CLIENT_THREADS: usize = 64;

/// Ingress queue command: a received packet
pub const RX_NET_RECV: u64 = 0;

/// Thread command queue command: runtime finished with an ingress buffer
pub const TX_NET_COMPLETE: u64 = 0;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid thread count {0} (must be 1..=64)")]
    InvalidThreadCount(usize),

    #[error("invalid client MAC {0}")]
    InvalidMac(EthernetAddress),

    #[error("queue setup failed: {0}")]
    Queue(#[from] LrpcError),
}

/// Commands arriving on a thread's command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxCommand {
    NetComplete,
    Unknown(u64),
}

impl From<u64> for TxCommand {
    fn from(cmd: u64) -> Self {
        match cmd {
            TX_NET_COMPLETE => TxCommand::NetComplete,
            other => TxCommand::Unknown(other),
        }
    }
}

/// Dispatcher-side queue handles of one worker thread
pub struct ThreadQueues {
    rxq: LrpcSender,
    txcmdq: LrpcReceiver,
}

impl ThreadQueues {
    /// Ingress queue (dispatcher produces)
    #[inline]
    pub fn rxq(&self) -> &LrpcSender {
        &self.rxq
    }

    /// Command queue (runtime produces)
    #[inline]
    pub fn txcmdq(&self) -> &LrpcReceiver {
        &self.txcmdq
    }
}

/// A registered runtime process, as seen by the dispatcher.
pub struct Client {
    pid: u32,
    mac: EthernetAddress,
    threads: Vec<ThreadQueues>,
    removed: AtomicBool,
}

impl Client {
    /// Create a client with `thread_count` worker queues of `queue_size`
    /// entries each, returning the runtime-side endpoint alongside it.
    pub fn new(
        pid: u32,
        mac: EthernetAddress,
        thread_count: usize,
        queue_size: usize,
    ) -> Result<(Client, ClientEndpoint), ClientError> {
        if thread_count == 0 || thread_count > MAX_CLIENT_THREADS {
            return Err(ClientError::InvalidThreadCount(thread_count));
        }
        // Broadcast is a multicast address too
        if mac.is_multicast() || mac == EthernetAddress([0; 6]) {
            return Err(ClientError::InvalidMac(mac));
        }

        let mut threads = Vec::with_capacity(thread_count);
        let mut endpoints = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let (rx_tx, rx_rx) = lrpc::channel(queue_size)?;
            let (cmd_tx, cmd_rx) = lrpc::channel(queue_size)?;
            threads.push(ThreadQueues {
                rxq: rx_tx,
                txcmdq: cmd_rx,
            });
            endpoints.push(ThreadEndpoint {
                rxq: rx_rx,
                txcmdq: cmd_tx,
            });
        }

        let client = Client {
            pid,
            mac,
            threads,
            removed: AtomicBool::new(false),
        };
        Ok((client, ClientEndpoint { threads: endpoints }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    #[inline]
    pub fn threads(&self) -> &[ThreadQueues] {
        &self.threads
    }

    /// Whether the control plane has started tearing this client down
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pid", &self.pid)
            .field("mac", &self.mac)
            .field("threads", &self.threads.len())
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// Runtime-side queue handles of a client
pub struct ClientEndpoint {
    threads: Vec<ThreadEndpoint>,
}

impl ClientEndpoint {
    pub fn thread(&self, index: usize) -> Option<&ThreadEndpoint> {
        self.threads.get(index)
    }

    pub fn threads(&self) -> &[ThreadEndpoint] {
        &self.threads
    }

    /// Pop every pending ingress reference from all threads, in thread order.
    pub fn drain(&self) -> Vec<ShmPtr> {
        let mut out = Vec::new();
        for thread in &self.threads {
            while let Some(ptr) = thread.recv() {
                out.push(ptr);
            }
        }
        out
    }
}

/// Runtime-side queue handles of one worker thread
pub struct ThreadEndpoint {
    rxq: LrpcReceiver,
    txcmdq: LrpcSender,
}

impl ThreadEndpoint {
    /// Next received packet reference. Unexpected commands are skipped.
    pub fn recv(&self) -> Option<ShmPtr> {
        while let Some(msg) = self.rxq.recv() {
            if msg.cmd == RX_NET_RECV {
                return Some(ShmPtr::new(msg.payload));
            }
            warn!(cmd = msg.cmd, "Unexpected command on ingress queue");
        }
        None
    }

    /// Number of messages waiting on the ingress queue
    pub fn pending(&self) -> usize {
        self.rxq.len()
    }

    /// Return an ingress buffer reference to the dispatcher.
    ///
    /// Returns `false` when the command queue is full.
    pub fn complete(&self, ptr: ShmPtr) -> bool {
        self.txcmdq.send(TX_NET_COMPLETE, ptr.into())
    }

    /// Send an arbitrary command word (diagnostics and tests).
    pub fn send_command(&self, cmd: u64, payload: u64) -> bool {
        self.txcmdq.send(cmd, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 1]);

    #[test]
    fn test_new_client() {
        let (client, endpoint) = Client::new(42, MAC, 3, 16).unwrap();
        assert_eq!(client.pid(), 42);
        assert_eq!(client.mac(), MAC);
        assert_eq!(client.thread_count(), 3);
        assert_eq!(endpoint.threads().len(), 3);
        assert!(!client.is_removed());
    }

    #[test]
    fn test_thread_count_bounds() {
        assert!(matches!(
            Client::new(1, MAC, 0, 16),
            Err(ClientError::InvalidThreadCount(0))
        ));
        assert!(matches!(
            Client::new(1, MAC, MAX_CLIENT_THREADS + 1, 16),
            Err(ClientError::InvalidThreadCount(_))
        ));
        assert!(Client::new(1, MAC, MAX_CLIENT_THREADS, 2).is_ok());
    }

    #[test]
    fn test_rejects_invalid_mac() {
        for mac in [
            EthernetAddress([0; 6]),
            EthernetAddress::BROADCAST,
            EthernetAddress([0x01, 0x00, 0x5e, 0, 0, 1]),
        ] {
            assert!(matches!(Client::new(1, mac, 1, 16), Err(ClientError::InvalidMac(_))));
        }
    }

    #[test]
    fn test_rejects_bad_queue_size() {
        assert!(matches!(Client::new(1, MAC, 1, 12), Err(ClientError::Queue(_))));
    }

    #[test]
    fn test_queues_connect() {
        let (client, endpoint) = Client::new(1, MAC, 2, 4).unwrap();

        assert!(client.threads()[1].rxq().send(RX_NET_RECV, 4096));
        assert!(endpoint.thread(0).unwrap().recv().is_none());
        assert_eq!(endpoint.thread(1).unwrap().recv(), Some(ShmPtr::new(4096)));

        assert!(endpoint.thread(0).unwrap().complete(ShmPtr::new(64)));
        let msg = client.threads()[0].txcmdq().recv().unwrap();
        assert_eq!(TxCommand::from(msg.cmd), TxCommand::NetComplete);
        assert_eq!(msg.payload, 64);
    }

    #[test]
    fn test_mark_removed_once() {
        let (client, _endpoint) = Client::new(1, MAC, 1, 4).unwrap();
        assert!(client.mark_removed());
        assert!(!client.mark_removed());
        assert!(client.is_removed());
    }
}
