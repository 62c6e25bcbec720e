//! Compact recoverable ECDSA over raw 32-byte hashes.
//!
//! This is the signature scheme used for signed control messages (sporks):
//! a 65-byte signature whose leading header byte encodes the recovery id
//! and whether the signer's public key is compressed. Verification recovers
//! the public key from the signature and compares its 160-bit hash against
//! the expected signer identity, so messages carry no explicit public key.

use std::sync::LazyLock;

use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::ecdsa::RecoverableSignature;
use bitcoin::secp256k1::ecdsa::RecoveryId;
use bitcoin::secp256k1::All;
use bitcoin::secp256k1::Message;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::PrivateKey;
use bitcoin::PubkeyHash;
use bitcoin::PublicKey;
use thiserror::Error;

/// Length of a serialized compact recoverable signature.
pub const COMPACT_SIGNATURE_SIZE: usize = 65;

static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

#[derive(Error, Debug)]
pub enum SignError {
    #[error("signing produced an unverifiable signature")]
    SelfVerification,

    #[error("signature is not a well-formed compact recoverable signature")]
    Malformed,
}

/// Signs a raw hash, returning the 65-byte compact recoverable signature.
///
/// The header byte is `27 + recovery_id`, plus 4 if the signing key's
/// public key is compressed.
pub fn sign_hash(hash: sha256d::Hash, key: &PrivateKey) -> Result<Vec<u8>, SignError> {
    let msg = Message::from_digest(hash.to_byte_array());
    let signature = SECP.sign_ecdsa_recoverable(&msg, &key.inner);
    let (rec_id, data) = signature.serialize_compact();

    let mut out = Vec::with_capacity(COMPACT_SIGNATURE_SIZE);
    out.push(27 + rec_id.to_i32() as u8 + if key.compressed { 4 } else { 0 });
    out.extend_from_slice(&data);

    // A signature we cannot recover our own key from is useless to every
    // verifier; catch that before it leaves the node.
    if recover_signer_id(hash, &out) != Some(key_id(key)) {
        return Err(SignError::SelfVerification);
    }

    Ok(out)
}

/// Recovers the signer's key id (hash160 of the recovered public key) from
/// a compact recoverable signature, or `None` if the signature is malformed
/// or recovery fails.
pub fn recover_signer_id(hash: sha256d::Hash, signature: &[u8]) -> Option<PubkeyHash> {
    if signature.len() != COMPACT_SIGNATURE_SIZE {
        return None;
    }

    let header = signature[0].checked_sub(27)?;
    let compressed = header & 4 != 0;
    let rec_id = RecoveryId::from_i32((header & 3) as i32).ok()?;
    let signature = RecoverableSignature::from_compact(&signature[1..], rec_id).ok()?;

    let msg = Message::from_digest(hash.to_byte_array());
    let recovered = SECP.recover_ecdsa(&msg, &signature).ok()?;

    // The key id depends on the serialized form, so honor the header's
    // compression flag when hashing.
    let recovered = PublicKey {
        compressed,
        inner: recovered,
    };
    Some(recovered.pubkey_hash())
}

/// Checks a compact recoverable signature against an expected signer id.
pub fn verify_hash(hash: sha256d::Hash, signer: &PubkeyHash, signature: &[u8]) -> bool {
    recover_signer_id(hash, signature).is_some_and(|recovered| recovered == *signer)
}

/// The key id (hash160 of the public key) a private key signs as.
pub fn key_id(key: &PrivateKey) -> PubkeyHash {
    key.public_key(&SECP).pubkey_hash()
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::Network;

    use super::*;

    fn test_key(byte: u8) -> PrivateKey {
        let secret = SecretKey::from_slice(&[byte; 32]).expect("32 non-zero bytes");
        PrivateKey::new(secret, Network::Bitcoin)
    }

    fn test_hash(data: &[u8]) -> sha256d::Hash {
        sha256d::Hash::hash(data)
    }

    #[test]
    fn test_sign_and_recover() {
        let key = test_key(1);
        let hash = test_hash(b"some signed payload");

        let signature = sign_hash(hash, &key).expect("signing succeeds");
        assert_eq!(signature.len(), COMPACT_SIGNATURE_SIZE);

        assert_eq!(recover_signer_id(hash, &signature), Some(key_id(&key)));
        assert!(verify_hash(hash, &key_id(&key), &signature));
    }

    #[test]
    fn test_verify_rejects_other_signer() {
        let key = test_key(1);
        let other = test_key(2);
        let hash = test_hash(b"some signed payload");

        let signature = sign_hash(hash, &key).expect("signing succeeds");
        assert!(!verify_hash(hash, &key_id(&other), &signature));
    }

    #[test]
    fn test_verify_rejects_other_hash() {
        let key = test_key(1);
        let hash = test_hash(b"some signed payload");
        let tampered = test_hash(b"some other payload");

        let signature = sign_hash(hash, &key).expect("signing succeeds");
        // Recovery yields *a* key for the tampered hash, but not ours.
        assert!(!verify_hash(tampered, &key_id(&key), &signature));
    }

    #[test]
    fn test_recover_rejects_malformed() {
        let key = test_key(1);
        let hash = test_hash(b"some signed payload");
        let mut signature = sign_hash(hash, &key).expect("signing succeeds");

        assert_eq!(recover_signer_id(hash, &signature[..64]), None);
        assert_eq!(recover_signer_id(hash, &[]), None);

        // header byte below the compact range
        signature[0] = 3;
        assert_eq!(recover_signer_id(hash, &signature), None);
    }

    #[test]
    fn test_uncompressed_key_header() {
        let mut key = test_key(3);
        key.compressed = false;
        let hash = test_hash(b"some signed payload");

        let signature = sign_hash(hash, &key).expect("signing succeeds");
        assert_eq!((signature[0] - 27) & 4, 0);
        assert!(verify_hash(hash, &key_id(&key), &signature));

        // The same signature must not verify as the compressed identity.
        let compressed = test_key(3);
        assert_ne!(key_id(&key), key_id(&compressed));
        assert!(!verify_hash(hash, &key_id(&compressed), &signature));
    }
}
