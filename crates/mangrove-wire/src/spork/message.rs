//! The spork wire message.

use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::io;
use bitcoin::PrivateKey;
use bitcoin::PubkeyHash;
use mangrove_common::hashsigner;
use mangrove_common::hashsigner::SignError;

/// One signed parameter update.
///
/// The message carries no public key; the signer's identity is recovered
/// from the compact signature and checked against the authorized committee
/// on intake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SporkMessage {
    /// Which parameter slot this message updates.
    pub spork_id: i32,

    /// The parameter payload. The encoding is slot-specific; most slots
    /// carry an activation timestamp.
    pub value: i64,

    /// Signer-asserted unix time of signing. For one signer and slot, only
    /// strictly newer messages replace stored ones.
    pub time_signed: i64,

    /// Compact recoverable ECDSA signature over [`Self::signature_hash`],
    /// 65 bytes when well-formed.
    pub signature: Vec<u8>,
}

impl SporkMessage {
    /// A message with the given payload and an empty signature.
    pub fn new(spork_id: i32, value: i64, time_signed: i64) -> Self {
        Self {
            spork_id,
            value,
            time_signed,
            signature: Vec::new(),
        }
    }

    /// Hash of the full serialized message, signature included. This is the
    /// gossip inventory identifier.
    pub fn hash(&self) -> sha256d::Hash {
        let mut engine = sha256d::Hash::engine();
        self.consensus_encode(&mut engine)
            .expect("engines don't error");
        sha256d::Hash::from_engine(engine)
    }

    /// The hash the signature commits to: the payload fields only.
    pub fn signature_hash(&self) -> sha256d::Hash {
        let mut engine = sha256d::Hash::engine();
        self.spork_id
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        self.value
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        self.time_signed
            .consensus_encode(&mut engine)
            .expect("engines don't error");
        sha256d::Hash::from_engine(engine)
    }

    /// Signs the message in place. The signing helper verifies its own
    /// output, so success means any peer can recover the signer.
    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), SignError> {
        self.signature = hashsigner::sign_hash(self.signature_hash(), key)?;
        Ok(())
    }

    /// Whether the signature recovers to `signer`.
    pub fn check_signature(&self, signer: &PubkeyHash) -> bool {
        hashsigner::verify_hash(self.signature_hash(), signer, &self.signature)
    }

    /// The key id this message's signature recovers to, if any.
    pub fn signer_key_id(&self) -> Option<PubkeyHash> {
        hashsigner::recover_signer_id(self.signature_hash(), &self.signature)
    }
}

impl Encodable for SporkMessage {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.spork_id.consensus_encode(writer)?;
        len += self.value.consensus_encode(writer)?;
        len += self.time_signed.consensus_encode(writer)?;
        len += self.signature.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for SporkMessage {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        Ok(Self {
            spork_id: Decodable::consensus_decode(reader)?,
            value: Decodable::consensus_decode(reader)?,
            time_signed: Decodable::consensus_decode(reader)?,
            signature: Decodable::consensus_decode(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::consensus;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::Network;

    use super::*;

    fn test_key(byte: u8) -> PrivateKey {
        let secret = SecretKey::from_slice(&[byte; 32]).expect("32 non-zero bytes");
        PrivateKey::new(secret, Network::Bitcoin)
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut spork = SporkMessage::new(10001, 1_600_000_000, 1_650_000_000);
        spork.sign(&test_key(1)).expect("signing succeeds");

        let bytes = consensus::serialize(&spork);
        // i32 + i64 + i64 + varint length prefix + 65-byte signature
        assert_eq!(bytes.len(), 4 + 8 + 8 + 1 + 65);

        let decoded: SporkMessage = consensus::deserialize(&bytes).expect("valid encoding");
        assert_eq!(decoded, spork);
        assert_eq!(decoded.hash(), spork.hash());
    }

    #[test]
    fn test_truncated_message_rejected() {
        let mut spork = SporkMessage::new(10001, 0, 0);
        spork.sign(&test_key(1)).expect("signing succeeds");

        let bytes = consensus::serialize(&spork);
        assert!(consensus::deserialize::<SporkMessage>(&bytes[..bytes.len() - 1]).is_err());
        assert!(consensus::deserialize::<SporkMessage>(&bytes[..10]).is_err());
    }

    #[test]
    fn test_signature_hash_excludes_signature() {
        let mut spork = SporkMessage::new(10001, 7, 1_650_000_000);
        let unsigned_hash = spork.hash();
        let payload_hash = spork.signature_hash();

        spork.sign(&test_key(1)).expect("signing succeeds");
        // Signing changes the gossip hash but not the committed payload.
        assert_ne!(spork.hash(), unsigned_hash);
        assert_eq!(spork.signature_hash(), payload_hash);

        // Any payload field change moves the signature hash.
        let other = SporkMessage::new(10001, 8, 1_650_000_000);
        assert_ne!(other.signature_hash(), payload_hash);
    }

    #[test]
    fn test_sign_and_verify() {
        let key = test_key(1);
        let other = test_key(2);

        let mut spork = SporkMessage::new(10001, 1_600_000_000, 1_650_000_000);
        assert_eq!(spork.signer_key_id(), None);

        spork.sign(&key).expect("signing succeeds");
        assert_eq!(spork.signer_key_id(), Some(hashsigner::key_id(&key)));
        assert!(spork.check_signature(&hashsigner::key_id(&key)));
        assert!(!spork.check_signature(&hashsigner::key_id(&other)));

        // Tampering with the payload breaks the signature binding.
        let mut tampered = spork.clone();
        tampered.value += 1;
        assert!(!tampered.check_signature(&hashsigner::key_id(&key)));
    }
}
