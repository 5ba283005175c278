//! # Node Identity and Cryptographic Primitives
//!
//! This module defines the identity types used throughout the engine:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`NodeId`]: 32-byte public key serving as the node's unique identifier
//! - [`PowProof`]: proof-of-work nonce bound to a [`NodeId`]
//!
//! ## Identity Model
//!
//! The engine uses a simple identity model: **NodeId = Ed25519 Public Key**.
//! This provides:
//!
//! - **Self-certifying ids**: possession of the private key proves identity
//! - **Per-message authentication**: heartbeats, leaves, and global chat are
//!   signed; the verifying key is recovered from the id itself
//!
//! ## Proof-of-Work
//!
//! Admission into a peer table requires a crypto puzzle:
//! `SHA-256(public_key || nonce)` must have [`POW_DIFFICULTY`] leading zero
//! bits. This makes bulk identity churn computationally expensive while
//! keeping verification O(1). See [`PowProof`] and [`Keypair::generate_with_pow`].
//!
//! ## Security Invariants
//!
//! - `NodeId::from_bytes(bytes).as_bytes() == bytes` (round-trip preservation)
//! - Only valid Ed25519 points verify signatures
//! - A PoW nonce is bound to exactly one public key

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of leading zero bits required in the PoW hash.
///
/// At difficulty 12 a fresh identity needs ~4096 hash attempts (a few
/// milliseconds on a modern CPU); validating a received nonce is a single
/// hash. Tests with the `test-pow` feature use difficulty 8 to exercise the
/// full validation code path quickly.
#[cfg(not(any(test, feature = "test-pow")))]
pub const POW_DIFFICULTY: u32 = 12;

#[cfg(any(test, feature = "test-pow"))]
pub const POW_DIFFICULTY: u32 = 8;

/// Maximum nonce value tried per keypair before regenerating the key.
const POW_MAX_NONCE: u64 = 1 << 32;

/// Maximum keypair regeneration attempts before reporting failure.
/// Exhausting this bound requires a broken CSPRNG.
const POW_MAX_KEYPAIR_ATTEMPTS: u32 = 16;

/// Error type for proof-of-work generation failures.
///
/// In practice this never occurs with a functioning CSPRNG and a reasonable
/// difficulty setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowError {
    /// Number of keypairs attempted before giving up.
    pub keypairs_tried: u32,
    /// Number of nonces tried per keypair.
    pub nonces_per_keypair: u64,
    /// The difficulty level that was requested.
    pub difficulty: u32,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PoW generation failed after {} keypairs with {} nonces each (difficulty={})",
            self.keypairs_tried, self.nonces_per_keypair, self.difficulty
        )
    }
}

impl std::error::Error for PowError {}

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Returns current time as milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new keypair WITHOUT proof-of-work.
    ///
    /// Heartbeats from an identity without a valid PoW nonce are rejected by
    /// every conforming node; use [`generate_with_pow`](Self::generate_with_pow)
    /// for anything that touches the network.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Generate a new keypair together with a valid [`PowProof`].
    ///
    /// Iterates nonces until `SHA-256(public_key || nonce)` has
    /// [`POW_DIFFICULTY`] leading zero bits.
    ///
    /// # Errors
    /// Returns `Err(PowError)` if no valid nonce is found within the bounded
    /// attempts, which is astronomically unlikely.
    pub fn generate_with_pow() -> Result<(Self, PowProof), PowError> {
        Self::generate_with_pow_difficulty(POW_DIFFICULTY)
    }

    /// Generate a keypair with a custom PoW difficulty.
    ///
    /// Useful for tests (low difficulty) or hardened deployments.
    pub fn generate_with_pow_difficulty(difficulty: u32) -> Result<(Self, PowProof), PowError> {
        if difficulty == 0 {
            return Ok((Self::generate(), PowProof::new(0)));
        }

        for _ in 0..POW_MAX_KEYPAIR_ATTEMPTS {
            let signing_key = SigningKey::generate(&mut OsRng);
            let public_key = signing_key.verifying_key().to_bytes();

            for nonce in 0..POW_MAX_NONCE {
                if verify_pow_hash(&public_key, nonce, difficulty) {
                    return Ok((Self { signing_key }, PowProof::new(nonce)));
                }
            }
        }
        Err(PowError {
            keypairs_tried: POW_MAX_KEYPAIR_ATTEMPTS,
            nonces_per_keypair: POW_MAX_NONCE,
            difficulty,
        })
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id().to_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Abbreviated hex prefix for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Verify that a proof-of-work nonce is valid for this id at the
    /// given difficulty. O(1).
    #[inline]
    pub fn verify_pow(&self, nonce: u64, difficulty: u32) -> bool {
        verify_pow_hash(&self.0, nonce, difficulty)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// On the wire a node id is a lowercase hex string.
impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Proof-of-work nonce for identity admission.
///
/// Carried in every heartbeat so receivers can validate the sender's
/// identity cost before admitting it into the peer table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PowProof {
    pub nonce: u64,
}

impl PowProof {
    pub fn new(nonce: u64) -> Self {
        Self { nonce }
    }

    /// Compute a PoW nonce for an existing id.
    ///
    /// Test helper for deterministic identities.
    ///
    /// # Panics
    /// Panics if no valid nonce is found within `POW_MAX_NONCE` attempts.
    pub fn compute_for(id: &NodeId, difficulty: u32) -> Self {
        for nonce in 0..POW_MAX_NONCE {
            if verify_pow_hash(id.as_bytes(), nonce, difficulty) {
                return Self { nonce };
            }
        }
        panic!("PoW computation failed within {} attempts", POW_MAX_NONCE);
    }
}

/// Verify that `SHA-256(public_key || nonce_le)` has `difficulty` leading zeros.
#[inline]
fn verify_pow_hash(public_key: &[u8; 32], nonce: u64, difficulty: u32) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hasher.update(nonce.to_le_bytes());
    let hash: [u8; 32] = hasher.finalize().into();
    count_leading_zeros(&hash) >= difficulty
}

/// Count leading zero bits in a hash.
#[inline]
fn count_leading_zeros(hash: &[u8; 32]) -> u32 {
    let mut zeros = 0u32;
    for byte in hash {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

/// Verify an Ed25519 signature made by the holder of `id`'s secret key.
///
/// The verifying key is recovered from the id bytes; ids that are not valid
/// curve points fail with [`SignatureError::InvalidPublicKey`].
pub fn verify_signature(
    id: &NodeId,
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), SignatureError> {
    let verifying_key = VerifyingKey::try_from(id.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);
    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_generation_is_unique() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.node_id(), kp2.node_id());
        assert_ne!(kp1.public_key_bytes(), kp2.public_key_bytes());
    }

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let message = b"seq:42";

        let signature = kp.sign(message);
        assert!(kp.verify(message, &signature));
        assert!(!kp.verify(b"seq:43", &signature));
    }

    #[test]
    fn verify_signature_by_id() {
        let kp = Keypair::generate();
        let id = kp.node_id();
        let message = b"type:LEAVE:abcdef";
        let sig = kp.sign(message).to_bytes();

        assert!(verify_signature(&id, message, &sig).is_ok());
        assert_eq!(
            verify_signature(&id, b"other message", &sig),
            Err(SignatureError::VerificationFailed)
        );

        let other = Keypair::generate().node_id();
        assert_eq!(
            verify_signature(&other, message, &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn tampered_signature_rejected() {
        let kp = Keypair::generate();
        let message = b"chat:0011";
        let mut sig = kp.sign(message).to_bytes();
        sig[0] ^= 0x01;

        assert!(verify_signature(&kp.node_id(), message, &sig).is_err());
    }

    #[test]
    fn node_id_hex_roundtrip() {
        for _ in 0..50 {
            let id = Keypair::generate().node_id();
            let hex = id.to_hex();
            let recovered = NodeId::from_hex(&hex).expect("hex decode failed");

            assert_eq!(id, recovered);
            assert_eq!(hex.len(), 64);
        }
    }

    #[test]
    fn node_id_hex_rejects_invalid() {
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_hex(&"a".repeat(70)).is_err());
        assert!(NodeId::from_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn keypair_reconstruction_preserves_identity() {
        let original = Keypair::generate();
        let secret = original.secret_key_bytes();

        let reconstructed = Keypair::from_secret_key_bytes(&secret);

        assert_eq!(original.node_id(), reconstructed.node_id());

        let message = b"test message";
        assert_eq!(
            original.sign(message).to_bytes(),
            reconstructed.sign(message).to_bytes()
        );
    }

    #[test]
    fn pow_generation_produces_valid_proof() {
        let (keypair, proof) =
            Keypair::generate_with_pow_difficulty(8).expect("PoW generation failed");

        assert!(keypair.node_id().verify_pow(proof.nonce, 8));
    }

    #[test]
    fn pow_rejects_invalid_nonce() {
        let (keypair, proof) =
            Keypair::generate_with_pow_difficulty(8).expect("PoW generation failed");
        let id = keypair.node_id();

        assert!(id.verify_pow(proof.nonce, 8));
        assert!(!id.verify_pow(proof.nonce.wrapping_add(1), 8));
    }

    #[test]
    fn pow_is_bound_to_identity() {
        let (kp1, proof1) =
            Keypair::generate_with_pow_difficulty(8).expect("PoW generation failed");
        let kp2 = Keypair::generate();

        assert!(kp1.node_id().verify_pow(proof1.nonce, 8));
        assert!(!kp2.node_id().verify_pow(proof1.nonce, 8));
    }

    #[test]
    fn pow_difficulty_zero_always_passes() {
        let keypair = Keypair::generate();
        assert!(keypair.node_id().verify_pow(0, 0));
    }

    #[test]
    fn pow_compute_for_existing_identity() {
        let id = Keypair::generate().node_id();
        let proof = PowProof::compute_for(&id, 8);
        assert!(id.verify_pow(proof.nonce, 8));
    }

    #[test]
    fn count_leading_zeros_boundaries() {
        assert_eq!(count_leading_zeros(&[0x00; 32]), 256);
        assert_eq!(count_leading_zeros(&[0xFF; 32]), 0);

        let mut hash = [0u8; 32];
        hash[2] = 0x01;
        assert_eq!(count_leading_zeros(&hash), 23);

        let mut hash = [0u8; 32];
        hash[1] = 0x80;
        assert_eq!(count_leading_zeros(&hash), 8);
    }

    #[test]
    fn node_id_json_is_hex_string() {
        let id = NodeId::from_bytes([0xAB; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));

        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
