//! NIC port abstraction
//!
//! The dispatcher polls exactly one port. Implementations receive directly
//! into pool buffers so frames are never copied after the device wrote them.

use std::io;
use std::sync::Arc;

use smoltcp::wire::EthernetAddress;

use crate::pool::{PacketBuf, PacketPool};

/// A polled network port
pub trait NicPort: Send {
    /// Receive up to `max` frames (non-blocking).
    ///
    /// Each frame lands in a buffer allocated from `pool`, with its length
    /// and checksum flag set, and is appended to `out` in arrival order.
    /// Returns the number of frames appended; zero is the normal idle case.
    /// Pool exhaustion ends the burst early and leaves the remaining frames
    /// on the device.
    fn rx_burst(
        &mut self,
        pool: &Arc<PacketPool>,
        out: &mut Vec<PacketBuf>,
        max: usize,
    ) -> io::Result<usize>;

    /// Transmit frames from the front of `bufs` (non-blocking).
    ///
    /// Sent buffers are removed from `bufs` and released; unsent ones stay.
    /// Returns the number sent.
    fn tx_burst(&mut self, bufs: &mut Vec<PacketBuf>) -> io::Result<usize>;

    /// Hardware address of the port
    fn mac_address(&self) -> EthernetAddress;

    /// NUMA node the device is attached to, if known
    fn numa_node(&self) -> Option<u32> {
        None
    }

    fn name(&self) -> &str;
}
