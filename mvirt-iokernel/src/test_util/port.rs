//! Scripted in-memory NIC port

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use smoltcp::wire::EthernetAddress;
use tracing::debug;

use crate::nic::NicPort;
use crate::pool::{PacketBuf, PacketPool, PoolError};

/// A frame waiting to be "received"
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub data: Vec<u8>,
    pub checksum_good: bool,
}

/// NIC port whose receive queue is filled by the test and whose transmit
/// side records frames.
pub struct ScriptedPort {
    mac: EthernetAddress,
    numa_node: Option<u32>,
    rx: VecDeque<RxFrame>,
    transmitted: Vec<Vec<u8>>,
    /// Frames accepted per `tx_burst` call before the ring is "full"
    tx_limit: usize,
    /// Errors returned by the next `rx_burst` calls
    rx_errors: usize,
}

impl ScriptedPort {
    pub fn new(mac: EthernetAddress) -> Self {
        Self {
            mac,
            numa_node: None,
            rx: VecDeque::new(),
            transmitted: Vec::new(),
            tx_limit: usize::MAX,
            rx_errors: 0,
        }
    }

    pub fn with_numa_node(mut self, node: u32) -> Self {
        self.numa_node = Some(node);
        self
    }

    pub fn with_tx_limit(mut self, limit: usize) -> Self {
        self.tx_limit = limit;
        self
    }

    /// Queue a frame whose IP checksum was not validated.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.inject_with_checksum(frame, false);
    }

    pub fn inject_with_checksum(&mut self, frame: Vec<u8>, checksum_good: bool) {
        self.rx.push_back(RxFrame {
            data: frame,
            checksum_good,
        });
    }

    /// Make the next `count` receive calls fail.
    pub fn fail_rx(&mut self, count: usize) {
        self.rx_errors = count;
    }

    /// Frames still waiting to be received
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn transmitted(&self) -> &[Vec<u8>] {
        &self.transmitted
    }
}

impl NicPort for ScriptedPort {
    fn rx_burst(
        &mut self,
        pool: &Arc<PacketPool>,
        out: &mut Vec<PacketBuf>,
        max: usize,
    ) -> io::Result<usize> {
        if self.rx_errors > 0 {
            self.rx_errors -= 1;
            return Err(io::Error::other("injected receive error"));
        }

        let mut received = 0;
        while received < max {
            let Some(frame) = self.rx.front() else {
                break;
            };
            let mut buf = match pool.allocate() {
                Ok(buf) => buf,
                Err(PoolError::Exhausted) => {
                    debug!(pending = self.rx.len(), "Pool exhausted, frames stay queued");
                    break;
                }
                Err(e) => return Err(io::Error::other(e)),
            };
            let area = buf.write_area();
            let len = frame.data.len().min(area.len());
            area[..len].copy_from_slice(&frame.data[..len]);
            buf.set_len(len);
            buf.set_checksum_good(frame.checksum_good);
            self.rx.pop_front();
            out.push(buf);
            received += 1;
        }
        Ok(received)
    }

    fn tx_burst(&mut self, bufs: &mut Vec<PacketBuf>) -> io::Result<usize> {
        let sent = bufs.len().min(self.tx_limit);
        for buf in bufs.drain(..sent) {
            self.transmitted.push(buf.data().to_vec());
        }
        Ok(sent)
    }

    fn mac_address(&self) -> EthernetAddress {
        self.mac
    }

    fn numa_node(&self) -> Option<u32> {
        self.numa_node
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
