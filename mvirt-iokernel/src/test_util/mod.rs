//! Test utilities for driving the dispatcher without a NIC
//!
//! Frame builders plus an in-memory [`NicPort`](crate::nic::NicPort) whose
//! receive side is scripted by the test.

pub mod packets;
pub mod port;

pub use packets::{GROUP_MAC, MAC_A, MAC_B, build_frame, build_ipv4_frame};
pub use port::ScriptedPort;
