// SPDX-License-Identifier: MIT

//! A bounded pool for orphan transactions.
//!
//! An orphan is a transaction received from the network whose parent(s) we
//! don't know yet. Instead of discarding it, the node holds it here in the
//! hope that the missing parents show up, at which point the transaction can
//! be re-evaluated for mempool acceptance.
//!
//! # Overview
//!
//! The pool is adversarial-input territory: every entry comes from an
//! untrusted peer, so it is bounded in three ways:
//!
//! - **Per-transaction weight**: oversized transactions are never admitted
//! - **Age**: entries expire after a fixed holding period
//! - **Count**: when the caller-supplied limit is exceeded, uniformly random
//!   entries are evicted until the pool fits
//!
//! Alongside the main map the pool maintains an index by spent outpoint, so
//! the arrival of a new transaction or block can cheaply discover which
//! orphans became reconsiderable (or conflicted), and per-peer work queues
//! feeding those re-evaluations back to the peers that announced them.

pub mod orphanage;

pub use orphanage::TxOrphanage;
pub use orphanage::ORPHAN_TX_EXPIRE_INTERVAL;
pub use orphanage::ORPHAN_TX_EXPIRE_TIME;
