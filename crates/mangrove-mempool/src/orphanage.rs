//! The orphan pool itself.
//!
//! Three indices are kept coherent at all times: the main map by wtxid, a
//! dense vector for O(1) uniform-random eviction (with a back-pointer in
//! each entry), and a map from spent outpoint to the entries spending it.
//! All mutation goes through a handful of public operations; nothing here
//! calls back into the peer layer.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bitcoin::policy::MAX_STANDARD_TX_WEIGHT;
use bitcoin::Block;
use bitcoin::OutPoint;
use bitcoin::Transaction;
use bitcoin::Txid;
use bitcoin::Weight;
use bitcoin::Wtxid;
use mangrove_common::NodeClock;
use mangrove_common::PeerId;
use mangrove_common::SystemClock;
use rand::Rng;
use tracing::debug;

/// How long an orphan is held before it becomes eligible for expiry.
pub const ORPHAN_TX_EXPIRE_TIME: Duration = Duration::from_secs(20 * 60);

/// Minimum interval between expiry sweeps.
///
/// The sweep is a linear scan, so it is batched: after a sweep, the next one
/// runs no earlier than this long after the earliest surviving expiry.
pub const ORPHAN_TX_EXPIRE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One held orphan transaction.
struct OrphanTx {
    tx: Arc<Transaction>,

    /// Peers that announced this transaction. Never empty for a live entry.
    announcers: BTreeSet<PeerId>,

    /// When this entry becomes eligible for the expiry sweep.
    expires_at: Instant,

    /// This entry's index in [`TxOrphanage::orphan_list`].
    list_pos: usize,

    /// Parent txids the announcer reported as missing. Stored verbatim for
    /// the caller; the pool itself never interprets them.
    parent_txids: Vec<Txid>,
}

/// A bounded pool of transactions whose parents are not yet known.
///
/// The pool keeps no internal lock; the node owns one instance and guards
/// it with the same lock that serializes peer-message processing, exactly
/// like the mempool. Mutating operations never call out, so no lock-order
/// issues can arise from keeping it inside a wider critical section.
pub struct TxOrphanage<C = SystemClock> {
    /// The orphans themselves, by witness txid.
    orphans: HashMap<Wtxid, OrphanTx>,

    /// Dense list of live entries for O(1) uniform-random eviction.
    /// `orphans[w].list_pos == i` iff `orphan_list[i] == w`.
    orphan_list: Vec<Wtxid>,

    /// Which orphans spend a given outpoint. Every input of every live
    /// entry appears here, and nothing else does.
    outpoint_index: HashMap<OutPoint, BTreeSet<Wtxid>>,

    /// Orphans whose parents showed up, waiting to be re-evaluated, keyed
    /// by the peer that should retry them. May contain wtxids that have
    /// since been erased; those are skipped on drain.
    peer_work_set: HashMap<PeerId, BTreeSet<Wtxid>>,

    /// When the next expiry sweep is due.
    next_sweep: Instant,

    clock: C,
}

impl TxOrphanage<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for TxOrphanage<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: NodeClock> TxOrphanage<C> {
    /// Creates an empty pool reading time from `clock`.
    pub fn with_clock(clock: C) -> Self {
        Self {
            orphans: HashMap::new(),
            orphan_list: Vec::new(),
            outpoint_index: HashMap::new(),
            peer_work_set: HashMap::new(),
            next_sweep: clock.now(),
            clock,
        }
    }

    /// Number of orphans currently held.
    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    /// Adds a transaction announced by `peer`, returning whether a new
    /// entry was created.
    ///
    /// If the transaction is already present, `peer` is attached as an
    /// additional announcer and this returns `false`. Transactions heavier
    /// than the standardness limit are rejected outright: a peer could
    /// otherwise exhaust our memory with large parentless transactions, and
    /// a legitimate sender will rebroadcast once the parents are known.
    pub fn add_tx(&mut self, tx: Arc<Transaction>, peer: PeerId, parent_txids: Vec<Txid>) -> bool {
        let txid = tx.compute_txid();
        let wtxid = tx.compute_wtxid();

        if let Some(orphan) = self.orphans.get_mut(&wtxid) {
            debug_assert!(!orphan.announcers.is_empty());
            if orphan.announcers.insert(peer) {
                debug!("added peer={peer} as announcer of orphan tx {wtxid}");
            }
            // Even when an announcer was added, no new entry was created.
            return false;
        }

        let weight = tx.weight();
        if weight > Weight::from_wu(MAX_STANDARD_TX_WEIGHT as u64) {
            debug!(
                "ignoring large orphan tx (weight: {}, txid: {txid}, wtxid: {wtxid})",
                weight.to_wu()
            );
            return false;
        }

        self.orphan_list.push(wtxid);
        for txin in &tx.input {
            self.outpoint_index
                .entry(txin.previous_output)
                .or_default()
                .insert(wtxid);
        }
        self.orphans.insert(
            wtxid,
            OrphanTx {
                tx,
                announcers: BTreeSet::from([peer]),
                expires_at: self.clock.now() + ORPHAN_TX_EXPIRE_TIME,
                list_pos: self.orphan_list.len() - 1,
                parent_txids,
            },
        );

        debug!(
            "stored orphan tx {txid} (wtxid={wtxid}), weight: {} (mapsz {} outsz {})",
            weight.to_wu(),
            self.orphans.len(),
            self.outpoint_index.len()
        );
        true
    }

    /// Attaches `peer` as an announcer of an existing orphan, returning
    /// whether it was newly added.
    pub fn add_announcer(&mut self, wtxid: &Wtxid, peer: PeerId) -> bool {
        let Some(orphan) = self.orphans.get_mut(wtxid) else {
            return false;
        };

        debug_assert!(!orphan.announcers.is_empty());
        if orphan.announcers.insert(peer) {
            debug!("added peer={peer} as announcer of orphan tx {wtxid}");
            return true;
        }
        false
    }

    /// Erases one orphan, returning how many entries were removed (0 or 1).
    ///
    /// Peer work sets are not purged here; [`Self::get_tx_to_reconsider`]
    /// skips entries that no longer exist.
    pub fn erase_tx(&mut self, wtxid: &Wtxid) -> usize {
        let Some(orphan) = self.orphans.remove(wtxid) else {
            return 0;
        };

        for txin in &orphan.tx.input {
            if let Some(spenders) = self.outpoint_index.get_mut(&txin.previous_output) {
                spenders.remove(wtxid);
                if spenders.is_empty() {
                    self.outpoint_index.remove(&txin.previous_output);
                }
            }
        }

        let old_pos = orphan.list_pos;
        assert_eq!(self.orphan_list[old_pos], *wtxid);
        let last_pos = self.orphan_list.len() - 1;
        if old_pos != last_pos {
            // Move the tail entry into the vacated slot so the list stays
            // dense, and fix its back-pointer.
            let moved = self.orphan_list[last_pos];
            self.orphan_list[old_pos] = moved;
            self.orphans
                .get_mut(&moved)
                .expect("orphan list entries refer to live orphans")
                .list_pos = old_pos;
        }
        self.orphan_list.pop();

        let held_for = (self.clock.now() + ORPHAN_TX_EXPIRE_TIME)
            .saturating_duration_since(orphan.expires_at);
        let txid = orphan.tx.compute_txid();
        debug!(
            "   removed orphan tx {txid} (wtxid={wtxid}) after {}s",
            held_for.as_secs()
        );
        1
    }

    /// Forgets everything about `peer`: its work set, its announcements,
    /// and any orphan it was the only announcer of.
    pub fn erase_for_peer(&mut self, peer: PeerId) {
        self.peer_work_set.remove(&peer);

        let mut erased = 0;
        // Snapshot the wtxids; erase_tx rearranges the list underneath us.
        let wtxids: Vec<Wtxid> = self.orphan_list.clone();
        for wtxid in wtxids {
            let Some(orphan) = self.orphans.get_mut(&wtxid) else {
                continue;
            };
            if orphan.announcers.contains(&peer) {
                if orphan.announcers.len() == 1 {
                    erased += self.erase_tx(&wtxid);
                } else {
                    // Another peer also announced this orphan, keep it.
                    orphan.announcers.remove(&peer);
                }
            }
        }

        if erased > 0 {
            debug!("erased {erased} orphan transaction(s) from peer={peer}");
        }
    }

    /// Gives up on one orphan for one peer: drops it from the peer's work
    /// set and detaches the peer as announcer, erasing the entry if no
    /// other peer announced it.
    pub fn erase_orphan_of_peer(&mut self, wtxid: &Wtxid, peer: PeerId) {
        if !self.orphans.contains_key(wtxid) {
            return;
        }

        // The orphan may persist under another announcer; it must not show
        // up in this peer's reconsider queue after we gave up on it here.
        if let Some(work_set) = self.peer_work_set.get_mut(&peer) {
            work_set.remove(wtxid);
        }

        let orphan = self
            .orphans
            .get_mut(wtxid)
            .expect("presence checked above");
        if orphan.announcers.contains(&peer) {
            if orphan.announcers.len() == 1 {
                self.erase_tx(wtxid);
            } else {
                orphan.announcers.remove(&peer);
            }
        }
    }

    /// Expires old entries (at most once per sweep interval) and then
    /// evicts uniformly random ones until at most `max_orphans` remain.
    /// Returns the wtxids of everything removed.
    ///
    /// The RNG is caller-supplied so eviction is reproducible: the same
    /// seed against the same pool state removes the same entries.
    pub fn limit_orphans(&mut self, max_orphans: usize, rng: &mut impl Rng) -> Vec<Wtxid> {
        let mut erased = Vec::new();
        let now = self.clock.now();

        if self.next_sweep <= now {
            // Sweep out expired entries, remembering the earliest surviving
            // expiry so the next linear scan is batched rather than
            // repeated on every call.
            let mut min_expiry = now + ORPHAN_TX_EXPIRE_TIME - ORPHAN_TX_EXPIRE_INTERVAL;
            for (wtxid, orphan) in &self.orphans {
                if orphan.expires_at <= now {
                    erased.push(*wtxid);
                } else {
                    min_expiry = min_expiry.min(orphan.expires_at);
                }
            }
            for wtxid in &erased {
                self.erase_tx(wtxid);
            }
            self.next_sweep = min_expiry + ORPHAN_TX_EXPIRE_INTERVAL;
            if !erased.is_empty() {
                debug!("erased {} orphan tx due to expiration", erased.len());
            }
        }

        let mut evicted = 0;
        while self.orphans.len() > max_orphans {
            let victim = self.orphan_list[rng.gen_range(0..self.orphan_list.len())];
            self.erase_tx(&victim);
            erased.push(victim);
            evicted += 1;
        }
        if evicted > 0 {
            debug!("orphanage overflow, removed {evicted} tx");
        }

        erased
    }

    /// Called when `tx` has been accepted: queues every orphan spending one
    /// of its outputs for re-evaluation, on behalf of each peer that
    /// announced that orphan.
    pub fn add_children_to_work_set(&mut self, tx: &Transaction) {
        let txid = tx.compute_txid();
        let wtxid = tx.compute_wtxid();

        for vout in 0..tx.output.len() as u32 {
            let Some(spenders) = self.outpoint_index.get(&OutPoint::new(txid, vout)) else {
                continue;
            };
            for child_wtxid in spenders {
                let child = self
                    .orphans
                    .get(child_wtxid)
                    .expect("outpoint index entries refer to live orphans");
                debug_assert!(!child.announcers.is_empty());
                for announcer in &child.announcers {
                    // If the announcer had disconnected, the orphan would
                    // already have been dropped for it.
                    self.peer_work_set
                        .entry(*announcer)
                        .or_default()
                        .insert(*child_wtxid);
                    debug!("added {txid} (wtxid={wtxid}) to peer {announcer} workset");
                }
            }
        }
    }

    /// Pops one orphan from `peer`'s work set, skipping entries that have
    /// been erased since they were queued.
    pub fn get_tx_to_reconsider(&mut self, peer: PeerId) -> Option<Arc<Transaction>> {
        let work_set = self.peer_work_set.get_mut(&peer)?;
        while let Some(wtxid) = work_set.pop_first() {
            if let Some(orphan) = self.orphans.get(&wtxid) {
                return Some(Arc::clone(&orphan.tx));
            }
        }
        None
    }

    /// Whether `peer`'s work set is non-empty. May report `true` for a set
    /// holding only stale entries; the subsequent drain resolves that.
    pub fn have_tx_to_reconsider(&self, peer: PeerId) -> bool {
        self.peer_work_set
            .get(&peer)
            .is_some_and(|work_set| !work_set.is_empty())
    }

    pub fn have_tx(&self, wtxid: &Wtxid) -> bool {
        self.orphans.contains_key(wtxid)
    }

    pub fn have_tx_and_peer(&self, wtxid: &Wtxid, peer: PeerId) -> bool {
        self.orphans
            .get(wtxid)
            .is_some_and(|orphan| orphan.announcers.contains(&peer))
    }

    /// The parent txids the announcer reported for this orphan, if held.
    pub fn get_parent_txids(&self, wtxid: &Wtxid) -> Option<Vec<Txid>> {
        self.orphans
            .get(wtxid)
            .map(|orphan| orphan.parent_txids.clone())
    }

    /// Erases every orphan spending an outpoint consumed by `block`. This
    /// covers orphans the block confirmed as well as orphans it conflicted
    /// with. Returns the gathered wtxids (duplicates possible; erasure is
    /// idempotent).
    pub fn erase_for_block(&mut self, block: &Block) -> Vec<Wtxid> {
        let mut to_erase = Vec::new();

        for tx in &block.txdata {
            for txin in &tx.input {
                let Some(spenders) = self.outpoint_index.get(&txin.previous_output) else {
                    continue;
                };
                to_erase.extend(spenders.iter().copied());
            }
        }

        if !to_erase.is_empty() {
            let mut erased = 0;
            for wtxid in &to_erase {
                erased += self.erase_tx(wtxid);
            }
            debug!("erased {erased} orphan transaction(s) included or conflicted by block");
        }

        to_erase
    }

    /// All orphans spending an output of `parent` that `peer` announced,
    /// most recently added first (ties broken by wtxid so the order is
    /// total), without duplicates.
    pub fn get_children_from_same_peer(
        &self,
        parent: &Transaction,
        peer: PeerId,
    ) -> Vec<Arc<Transaction>> {
        let parent_txid = parent.compute_txid();

        // A child spending several outputs of the parent shows up once per
        // outpoint here; the sort brings the duplicates together.
        let mut found: Vec<(Instant, Wtxid)> = Vec::new();
        for vout in 0..parent.output.len() as u32 {
            let Some(spenders) = self.outpoint_index.get(&OutPoint::new(parent_txid, vout)) else {
                continue;
            };
            for wtxid in spenders {
                let orphan = self
                    .orphans
                    .get(wtxid)
                    .expect("outpoint index entries refer to live orphans");
                if orphan.announcers.contains(&peer) {
                    found.push((orphan.expires_at, *wtxid));
                }
            }
        }

        found.sort_unstable_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        found.dedup_by_key(|(_, wtxid)| *wtxid);

        found
            .into_iter()
            .map(|(_, wtxid)| {
                Arc::clone(
                    &self
                        .orphans
                        .get(&wtxid)
                        .expect("wtxid collected from live orphans above")
                        .tx,
                )
            })
            .collect()
    }
}
