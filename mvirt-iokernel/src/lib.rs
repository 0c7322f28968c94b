//! Kernel-bypass packet dispatcher
//!
//! Polls one NIC port, classifies frames by destination MAC and hands them
//! zero-copy to runtime clients through a packet pool in shared memory.

pub mod client;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod lrpc;
pub mod nic;
pub mod packet;
pub mod pool;
pub mod registry;
pub mod shm;
pub mod tap;
pub mod test_util;

pub use client::{Client, ClientEndpoint};
pub use config::DataplaneConfig;
pub use control::{ControlPlane, DataplaneLink, control_channels};
pub use dispatcher::{DispatchStats, Dispatcher, InitError};
pub use nic::NicPort;
pub use pool::{PacketBuf, PacketPool, SharedBuf};
pub use shm::ShmPtr;
