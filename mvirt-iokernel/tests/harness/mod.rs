//! Test harness for dispatcher integration tests
//!
//! Wires a dispatcher to a scripted port and an anonymous pool, and plays the
//! runtime side of registered clients.

#![allow(dead_code)]

use std::sync::Arc;

use mvirt_iokernel::client::{Client, ClientEndpoint};
use mvirt_iokernel::packet::{RX_NET_HDR_SIZE, RxNetHdr};
use mvirt_iokernel::pool::SharedBuf;
use mvirt_iokernel::test_util::ScriptedPort;
use mvirt_iokernel::{ControlPlane, DataplaneConfig, Dispatcher, PacketPool, ShmPtr, control_channels};
use smoltcp::wire::EthernetAddress;

pub const PORT_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

pub struct TestBed {
    pub dispatcher: Dispatcher<ScriptedPort>,
    pub control: ControlPlane,
    pub pool: Arc<PacketPool>,
}

impl TestBed {
    pub fn new(pool_capacity: usize) -> Self {
        let config = DataplaneConfig::anonymous(pool_capacity);
        let max_clients = config.max_clients;
        Self::with_config(config, max_clients)
    }

    /// `control_max_clients` bounds the control plane independently of the
    /// dispatcher's MAC table.
    pub fn with_config(config: DataplaneConfig, control_max_clients: usize) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = PacketPool::create(config.pool_params()).unwrap();
        let (control, link) =
            control_channels(config.control_queue_size, control_max_clients).unwrap();
        let dispatcher = Dispatcher::new(ScriptedPort::new(PORT_MAC), Arc::clone(&pool), link, config)
            .unwrap()
            .with_seed(42);
        Self {
            dispatcher,
            control,
            pool,
        }
    }

    /// Create a client and send ADD_CLIENT without letting the dispatcher run.
    pub fn add_client(
        &mut self,
        pid: u32,
        mac: EthernetAddress,
        threads: usize,
        queue_size: usize,
    ) -> (Arc<Client>, ClientEndpoint) {
        let (client, endpoint) = Client::new(pid, mac, threads, queue_size).unwrap();
        let client = Arc::new(client);
        self.control.add_client(Arc::clone(&client)).unwrap();
        (client, endpoint)
    }

    /// Create a client and let the dispatcher apply the registration.
    pub fn register(
        &mut self,
        pid: u32,
        mac: EthernetAddress,
        threads: usize,
        queue_size: usize,
    ) -> (Arc<Client>, ClientEndpoint) {
        let pair = self.add_client(pid, mac, threads, queue_size);
        self.dispatcher.poll_control();
        pair
    }

    pub fn inject(&mut self, frame: Vec<u8>) {
        self.dispatcher.port_mut().inject(frame);
    }

    /// Take ownership of a delivered reference, as a runtime would.
    pub fn take(&self, ptr: ShmPtr) -> SharedBuf {
        unsafe { self.pool.reclaim(ptr) }.unwrap()
    }

    /// Consume everything queued for `endpoint` and return it via completions.
    pub fn consume_all(&mut self, endpoint: &ClientEndpoint) -> usize {
        let mut consumed = 0;
        for thread in endpoint.threads() {
            while let Some(ptr) = thread.recv() {
                while !thread.complete(ptr) {
                    self.dispatcher.poll_completions();
                }
                consumed += 1;
            }
        }
        consumed
    }
}

/// Split a delivered buffer into preamble and frame.
pub fn split_delivery(buf: &SharedBuf) -> (RxNetHdr, Vec<u8>) {
    let data = buf.data();
    let hdr = RxNetHdr::parse(data).unwrap();
    (hdr, data[RX_NET_HDR_SIZE..].to_vec())
}
