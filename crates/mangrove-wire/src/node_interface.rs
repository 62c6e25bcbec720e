//! Interfaces into the peer layer.
//!
//! The spork subsystem never touches sockets or peer bookkeeping itself; it
//! calls these traits, and the node wires them to its peer and connection
//! managers. Implementations may take their own locks, so the spork manager
//! guarantees its internal lock is never held across any of these calls.

use bitcoin::hashes::sha256d;
use bitcoin::p2p::message_blockdata::Inventory;
use mangrove_common::PeerId;

use crate::spork::SporkMessage;

/// Inventory type id sporks are announced under.
pub const MSG_SPORK: u32 = 6;

/// Peer-manager hooks consumed by the spork subsystem.
pub trait PeerManager {
    /// Records that `peer` knows the inventory item `hash`, so we don't
    /// announce it back to them.
    fn add_known_inventory(&self, peer: PeerId, hash: sha256d::Hash);

    /// Records that `hash` arrived from `peer`, answering any outstanding
    /// request for it.
    fn received_response(&self, peer: PeerId, hash: sha256d::Hash);

    /// Drops request-tracking state for `hash` from `peer`.
    fn forget_hash(&self, peer: PeerId, hash: sha256d::Hash);

    /// Penalizes `peer`. The peer layer disconnects and bans once the
    /// accumulated score crosses its threshold.
    fn misbehaving(&self, peer: PeerId, score: u32, reason: &str);

    /// Announces `inv` to every connected peer that doesn't know it yet.
    fn relay_inventory(&self, inv: Inventory);
}

/// Direct message submission to a single peer.
pub trait Connman {
    /// Sends one spork message to `peer`.
    fn push_spork(&self, peer: PeerId, spork: &SporkMessage);
}
