//! The spork manager.
//!
//! A spork is a network-wide runtime parameter signed by a small committee
//! of trusted keys. Every node stores the latest message per (spork, signer)
//! pair; a value becomes *active* once enough distinct authorized signers
//! have signed that same value. Because the threshold is always above half
//! the committee, at most one value can win at a time.
//!
//! All state lives behind one internal lock. The lock is never held across
//! a call into the peer layer ([`PeerManager`]/[`Connman`]); those
//! implementations take their own locks, and nesting ours outside theirs
//! would invert the acquisition order the node relies on.

mod defs;
mod message;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::MutexGuard;

use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::Address;
use bitcoin::Network;
use bitcoin::PrivateKey;
use bitcoin::PubkeyHash;
pub use defs::spork_def;
pub use defs::spork_id_by_name;
pub use defs::spork_name_by_id;
pub use defs::SporkDef;
pub use defs::SPORK_DEFS;
pub use defs::SPORK_INVALID;
pub use defs::SPORK_OFF;
use mangrove_common::hashsigner;
use mangrove_common::NodeClock;
use mangrove_common::PeerId;
use mangrove_common::SystemClock;
pub use message::SporkMessage;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::node_interface::Connman;
use crate::node_interface::PeerManager;
use crate::node_interface::MSG_SPORK;

/// Network message commands handled by the spork subsystem.
pub mod msg_type {
    /// Carries a single serialized spork message.
    pub const SPORK: &str = "spork";

    /// Requests our full active spork set. No payload.
    pub const GETSPORKS: &str = "getsporks";
}

/// Reject sporks whose signing time is further than this into the future,
/// in seconds. Covers honest clock skew; anything beyond it is hostile.
pub const SPORK_TIME_SKEW_TOLERANCE: i64 = 2 * 60 * 60;

/// Version tag for spork state dumps.
pub const SERIALIZATION_VERSION_STRING: &str = "CSporkManager-Version-2";

/// Score applied to peers sending invalid or out-of-window sporks. High
/// enough that a single violation gets the peer disconnected.
const MISBEHAVING_SCORE: u32 = 100;

struct SporkStore {
    /// Accepted messages by spork id, then by signer key id.
    active: BTreeMap<i32, BTreeMap<PubkeyHash, SporkMessage>>,

    /// The same messages, by gossip hash.
    by_hash: BTreeMap<sha256d::Hash, SporkMessage>,

    /// Key ids allowed to sign sporks.
    signer_key_ids: BTreeSet<PubkeyHash>,

    /// How many distinct signers must agree on a value before it wins.
    min_spork_keys: usize,

    /// Set when this node is itself an authorized signer.
    spork_priv_key: Option<PrivateKey>,

    /// Memoized winning value per spork id.
    cached_values: HashMap<i32, i64>,

    /// Memoized activation results; only `true` is recorded, a negative
    /// answer may flip as the clock advances.
    cached_active: HashMap<i32, bool>,
}

/// Tracks spork gossip and answers "what is parameter X right now".
///
/// Shared by the peer-processing workers; all methods take `&self`.
pub struct SporkManager<C = SystemClock> {
    store: Mutex<SporkStore>,
    network: Network,
    clock: C,
}

impl SporkManager<SystemClock> {
    pub fn new(network: Network) -> Self {
        Self::with_clock(network, SystemClock)
    }
}

impl<C: NodeClock> SporkManager<C> {
    /// Creates a manager with no authorized signers, reading time from
    /// `clock`. Addresses are decoded for `network`.
    pub fn with_clock(network: Network, clock: C) -> Self {
        Self {
            store: Mutex::new(SporkStore {
                active: BTreeMap::new(),
                by_hash: BTreeMap::new(),
                signer_key_ids: BTreeSet::new(),
                // Nothing can activate until the threshold is configured.
                min_spork_keys: usize::MAX,
                spork_priv_key: None,
                cached_values: HashMap::new(),
                cached_active: HashMap::new(),
            }),
            network,
            clock,
        }
    }

    fn store(&self) -> MutexGuard<'_, SporkStore> {
        self.store.lock().expect("spork state lock poisoned")
    }

    /// Dispatches a spork-related network message by command string.
    pub fn process_spork_messages(
        &self,
        peer: PeerId,
        command: &str,
        payload: &[u8],
        connman: &impl Connman,
        peerman: &impl PeerManager,
    ) {
        match command {
            msg_type::SPORK => self.process_spork(peer, payload, peerman),
            msg_type::GETSPORKS => self.process_get_sporks(peer, connman),
            _ => {}
        }
    }

    /// Handles one spork message received from `peer`.
    ///
    /// Anything wrong with the message is the peer's fault and is answered
    /// with a misbehavior score; nothing propagates upward.
    pub fn process_spork(&self, peer: PeerId, payload: &[u8], peerman: &impl PeerManager) {
        let spork: SporkMessage = match consensus::deserialize(payload) {
            Ok(spork) => spork,
            Err(err) => {
                debug!("process_spork -- malformed message from peer={peer}: {err}");
                peerman.misbehaving(peer, MISBEHAVING_SCORE, "malformed spork message");
                return;
            }
        };

        let hash = spork.hash();
        peerman.add_known_inventory(peer, hash);
        peerman.received_response(peer, hash);
        let log_msg = format!(
            "spork -- hash: {hash} id: {} value: {:10} peer={peer}",
            spork.spork_id, spork.value
        );

        if spork.time_signed > self.clock.adjusted_time() + SPORK_TIME_SKEW_TOLERANCE {
            peerman.forget_hash(peer, hash);
            debug!("process_spork -- ERROR: too far into the future");
            peerman.misbehaving(peer, MISBEHAVING_SCORE, "spork too far into the future");
            return;
        }

        let Some(signer) = spork.signer_key_id() else {
            peerman.forget_hash(peer, hash);
            debug!("process_spork -- ERROR: invalid signature");
            peerman.misbehaving(peer, MISBEHAVING_SCORE, "invalid spork signature");
            return;
        };
        if !self.store().signer_key_ids.contains(&signer) {
            peerman.forget_hash(peer, hash);
            debug!("process_spork -- ERROR: invalid signature");
            peerman.misbehaving(peer, MISBEHAVING_SCORE, "invalid spork signature");
            return;
        }

        // Duplicate check and store happen in one critical section, so the
        // stored time_signed for a (spork, signer) pair never goes
        // backwards even with several workers processing sporks at once.
        {
            let mut store = self.store();
            let is_duplicate = store
                .active
                .get(&spork.spork_id)
                .and_then(|by_signer| by_signer.get(&signer))
                .is_some_and(|stored| stored.time_signed >= spork.time_signed);
            if is_duplicate {
                drop(store);
                debug!("{log_msg} seen");
                peerman.forget_hash(peer, hash);
                return;
            }

            match store.active.get(&spork.spork_id) {
                // A strictly newer message from a known signer; no news.
                Some(by_signer) if by_signer.contains_key(&signer) => {}
                Some(_) => info!("{log_msg} updated"),
                None => info!("{log_msg} new signer"),
            }

            store.by_hash.insert(hash, spork.clone());
            store
                .active
                .entry(spork.spork_id)
                .or_default()
                .insert(signer, spork.clone());
            store.cached_active.remove(&spork.spork_id);
            store.cached_values.remove(&spork.spork_id);
        }

        self.relay(&spork, peerman);
        peerman.forget_hash(peer, hash);
    }

    /// Answers a `getsporks` request with every stored message.
    pub fn process_get_sporks(&self, peer: PeerId, connman: &impl Connman) {
        // Snapshot under the lock; pushing happens with the lock released.
        let sporks: Vec<SporkMessage> = {
            let store = self.store();
            store
                .active
                .values()
                .flat_map(|by_signer| by_signer.values().cloned())
                .collect()
        };

        for spork in &sporks {
            connman.push_spork(peer, spork);
        }
    }

    /// Signs and broadcasts a new spork value. Only works when this node
    /// holds the private key of an authorized signer.
    ///
    /// The message is installed directly; a node doesn't duplicate-check or
    /// skew-check its own signatures.
    pub fn update_spork(&self, spork_id: i32, value: i64, peerman: &impl PeerManager) -> bool {
        let mut spork = SporkMessage::new(spork_id, value, self.clock.adjusted_time());

        let key = self.store().spork_priv_key;
        let Some(key) = key else {
            error!("update_spork -- ERROR: signing failed for spork {spork_id}: no private key");
            return false;
        };
        if let Err(err) = spork.sign(&key) {
            error!("update_spork -- ERROR: signing failed for spork {spork_id}: {err}");
            return false;
        }

        let Some(signer) = spork.signer_key_id() else {
            error!("update_spork -- failed to find key id for private key");
            return false;
        };

        {
            let mut store = self.store();
            if !store.signer_key_ids.contains(&signer) {
                drop(store);
                error!("update_spork -- failed to find key id for private key");
                return false;
            }

            info!("update_spork -- signed {spork_id} {}", spork.hash());
            store.by_hash.insert(spork.hash(), spork.clone());
            store
                .active
                .entry(spork_id)
                .or_default()
                .insert(signer, spork.clone());
            store.cached_active.remove(&spork_id);
            store.cached_values.remove(&spork_id);
        }

        self.relay(&spork, peerman);
        true
    }

    /// The value that has reached the signer threshold for `spork_id`, if
    /// any.
    pub fn active_spork_value(&self, spork_id: i32) -> Option<i64> {
        let mut guard = self.store();
        let store = &mut *guard;

        let by_signer = store.active.get(&spork_id)?;
        if let Some(value) = store.cached_values.get(&spork_id) {
            return Some(*value);
        }

        let mut value_counts: HashMap<i64, usize> = HashMap::new();
        for spork in by_signer.values() {
            let count = value_counts.entry(spork.value).or_insert(0);
            *count += 1;
            if *count >= store.min_spork_keys {
                // The threshold is above half the committee, so only one
                // value can ever reach it; the first hit is the winner.
                store.cached_values.insert(spork_id, spork.value);
                return Some(spork.value);
            }
        }

        None
    }

    /// The current value of `spork_id`: the threshold winner, else the
    /// compiled-in default, else `-1` for a spork we don't know about.
    pub fn get_spork_value(&self, spork_id: i32) -> i64 {
        if let Some(value) = self.active_spork_value(spork_id) {
            return value;
        }

        match defs::spork_def(spork_id) {
            Some(def) => def.default_value,
            None => {
                debug!("get_spork_value -- unknown spork id {spork_id}");
                -1
            }
        }
    }

    /// Whether `spork_id` is active: its value, read as a unix timestamp,
    /// is strictly in the past.
    ///
    /// A positive answer is memoized (an activated spork normally stays
    /// active, and this skips the clock read); a negative one may flip
    /// shortly, so it is re-evaluated every time.
    pub fn is_spork_active(&self, spork_id: i32) -> bool {
        if self
            .store()
            .cached_active
            .get(&spork_id)
            .copied()
            .unwrap_or(false)
        {
            return true;
        }

        let active = self.get_spork_value(spork_id) < self.clock.adjusted_time();
        if active {
            self.store().cached_active.insert(spork_id, true);
        }
        active
    }

    /// Looks up a stored message by its gossip hash.
    pub fn get_spork_by_hash(&self, hash: &sha256d::Hash) -> Option<SporkMessage> {
        self.store().by_hash.get(hash).cloned()
    }

    /// Authorizes the key a pay-to-pubkey-hash or pay-to-witness-pubkey-hash
    /// address names as a spork signer. Any other destination kind doesn't
    /// name a single key and is rejected. Addresses accumulate.
    pub fn set_spork_address(&self, address: &str) -> bool {
        let Some(key_id) = self.parse_spork_address(address) else {
            error!("set_spork_address -- failed to parse spork address");
            return false;
        };

        self.store().signer_key_ids.insert(key_id);
        true
    }

    /// Withdraws a previously authorized signer address. The caller should
    /// follow up with [`Self::check_and_remove`] to drop the now-orphaned
    /// messages.
    pub fn remove_spork_address(&self, address: &str) -> bool {
        let Some(key_id) = self.parse_spork_address(address) else {
            error!("remove_spork_address -- failed to parse spork address");
            return false;
        };

        self.store().signer_key_ids.remove(&key_id)
    }

    fn parse_spork_address(&self, address: &str) -> Option<PubkeyHash> {
        let address = address
            .parse::<Address<NetworkUnchecked>>()
            .ok()?
            .require_network(self.network)
            .ok()?;

        let script = address.script_pubkey();
        let bytes = script.as_bytes();
        if script.is_p2pkh() {
            // OP_DUP OP_HASH160 <20-byte key hash> OP_EQUALVERIFY OP_CHECKSIG
            PubkeyHash::from_slice(&bytes[3..23]).ok()
        } else if script.is_p2wpkh() {
            // OP_0 <20-byte key hash>
            PubkeyHash::from_slice(&bytes[2..22]).ok()
        } else {
            None
        }
    }

    /// Sets the activation threshold. Accepted only if strictly more than
    /// half of the authorized signers and at most all of them.
    pub fn set_min_spork_keys(&self, min_spork_keys: usize) -> bool {
        let mut store = self.store();
        let max_keys = store.signer_key_ids.len();
        if min_spork_keys <= max_keys / 2 || min_spork_keys > max_keys {
            error!("set_min_spork_keys -- invalid min spork signers number: {min_spork_keys}");
            return false;
        }

        store.min_spork_keys = min_spork_keys;
        true
    }

    /// Configures this node as a spork signer from a WIF-encoded private
    /// key. The key must belong to an already-authorized address, and a
    /// sign/verify self-test must pass before it is stored.
    pub fn set_priv_key(&self, wif: &str) -> bool {
        let key = match PrivateKey::from_wif(wif) {
            Ok(key) => key,
            Err(err) => {
                error!("set_priv_key -- failed to parse private key: {err}");
                return false;
            }
        };

        if !self.store().signer_key_ids.contains(&hashsigner::key_id(&key)) {
            error!("set_priv_key -- new private key does not belong to the spork addresses");
            return false;
        }

        if let Err(err) = SporkMessage::default().sign(&key) {
            error!("set_priv_key -- test signing failed: {err}");
            return false;
        }

        info!("set_priv_key -- successfully initialized as spork signer");
        self.store().spork_priv_key = Some(key);
        true
    }

    /// Re-validates every stored message against the current signer set,
    /// dropping anything signed by a deauthorized key or carrying a
    /// signature that no longer verifies. Called after the signer set
    /// changes.
    pub fn check_and_remove(&self) {
        let mut guard = self.store();
        assert!(!guard.signer_key_ids.is_empty());
        let SporkStore {
            active,
            by_hash,
            signer_key_ids,
            cached_values,
            cached_active,
            ..
        } = &mut *guard;

        active.retain(|_, by_signer| {
            by_signer.retain(|signer, spork| {
                let valid = signer_key_ids.contains(signer) && spork.check_signature(signer);
                if !valid {
                    by_hash.remove(&spork.hash());
                }
                valid
            });
            !by_signer.is_empty()
        });

        by_hash.retain(|_, spork| {
            signer_key_ids
                .iter()
                .any(|signer| spork.check_signature(signer))
        });

        // A memoized winner may have leaned on a signer that was just
        // dropped, so recompute from scratch on the next query.
        cached_values.clear();
        cached_active.clear();
    }

    /// Drops all gossip state. The signer set, threshold and private key
    /// are configuration and stay as they are.
    pub fn clear(&self) {
        let mut store = self.store();
        store.active.clear();
        store.by_hash.clear();
        store.cached_values.clear();
        store.cached_active.clear();
    }

    fn relay(&self, spork: &SporkMessage, peerman: &impl PeerManager) {
        peerman.relay_inventory(Inventory::Unknown {
            inv_type: MSG_SPORK,
            hash: spork.hash().to_byte_array(),
        });
    }
}

impl<C> fmt::Display for SporkManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .store
            .lock()
            .expect("spork state lock poisoned")
            .active
            .len();
        write!(f, "Sporks: {count}")
    }
}
