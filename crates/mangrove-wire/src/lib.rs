// SPDX-License-Identifier: MIT

//! Network-facing subsystems for the mangrove node.
//!
//! This crate currently hosts the spork subsystem: a small committee of
//! trusted keys broadcasts signed runtime parameters ("sporks") across the
//! network, and every node tracks the messages it has seen, activating a
//! parameter value once enough distinct committee members have signed it.
//!
//! The peer and connection managers live above this crate; the subsystem
//! talks to them exclusively through the traits in [`node_interface`].

pub mod node_interface;
pub mod spork;

pub use node_interface::Connman;
pub use node_interface::PeerManager;
pub use spork::SporkManager;
pub use spork::SporkMessage;
