//! Crypto surface consumed by the signalling and media layers (spec §6, §3).
//!
//! Asymmetric key-wrap and symmetric encryption both sit on the same
//! primitives the rest of the example pack already reaches for X3DH and
//! the Double Ratchet: X25519 for key agreement, HKDF-SHA256 to derive a
//! wrap key, and AES-256-GCM for the AEAD itself. Wrapping a symmetric key
//! under a recipient's public key is ECIES: generate an ephemeral X25519
//! keypair, DH with the recipient's static public key, derive a one-time
//! AES key from the DH output, and seal the payload under it. The
//! ephemeral public key travels alongside the ciphertext so the recipient
//! can redo the DH.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

/// A user's long-term asymmetric identity (spec §3 "Identity").
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(AeadOsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }
}

/// Serialize a public key to the base64 form carried in `public_key`,
/// `sender_public_key`, etc. (spec §4.4).
pub fn serialize_public_key(key: &PublicKey) -> String {
    B64.encode(key.as_bytes())
}

/// Inverse of [`serialize_public_key`].
pub fn deserialize_public_key(encoded: &str) -> Result<PublicKey, CryptoError> {
    let bytes = B64.decode(encoded).map_err(|_| CryptoError::InvalidKey)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
    Ok(PublicKey::from(arr))
}

/// A 32-byte symmetric key (call key or packet key).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SymmetricKey(pub [u8; 32]);

impl SymmetricKey {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// Wrap `key` under `recipient_public` (ECIES). Returns a base64 blob:
/// `ephemeral_public(32) || nonce(12) || ciphertext(32+16)`.
pub fn wrap_symmetric_key(
    recipient_public: &PublicKey,
    key: &SymmetricKey,
) -> Result<String, CryptoError> {
    let ephemeral_secret = StaticSecret::random_from_rng(AeadOsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(recipient_public);

    let wrap_key = derive_wrap_key(shared.as_bytes(), ephemeral_public.as_bytes())?;
    let cipher = Aes256Gcm::new_from_slice(&wrap_key).map_err(|_| CryptoError::InvalidKey)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, key.0.as_slice())
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut blob = Vec::with_capacity(32 + 12 + ciphertext.len());
    blob.extend_from_slice(ephemeral_public.as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(B64.encode(blob))
}

/// Unwrap a blob produced by [`wrap_symmetric_key`] using our secret key.
pub fn unwrap_symmetric_key(
    our_secret: &KeyPair,
    wrapped: &str,
) -> Result<SymmetricKey, CryptoError> {
    let blob = B64.decode(wrapped).map_err(|_| CryptoError::InvalidKey)?;
    if blob.len() < 32 + 12 {
        return Err(CryptoError::InvalidKey);
    }
    let (ephemeral_bytes, rest) = blob.split_at(32);
    let (nonce_bytes, ciphertext) = rest.split_at(12);

    let ephemeral_public = PublicKey::from(
        <[u8; 32]>::try_from(ephemeral_bytes).map_err(|_| CryptoError::InvalidKey)?,
    );
    let shared = our_secret.secret.diffie_hellman(&ephemeral_public);
    let wrap_key = derive_wrap_key(shared.as_bytes(), ephemeral_bytes)?;

    let cipher = Aes256Gcm::new_from_slice(&wrap_key).map_err(|_| CryptoError::InvalidKey)?;
    let nonce = Nonce::from_slice(nonce_bytes);
    let plain = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)?;
    let arr: [u8; 32] = plain.try_into().map_err(|_| CryptoError::InvalidKey)?;
    Ok(SymmetricKey(arr))
}

fn derive_wrap_key(dh_output: &[u8], salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), dh_output);
    let mut out = [0u8; 32];
    hk.expand(b"meshcall-keywrap-v1", &mut out)
        .map_err(|_| CryptoError::KdfFailed)?;
    Ok(out)
}

/// Encrypt an opaque payload (media frame, or nickname) under a symmetric
/// key. Wire form: `nonce(12) || ciphertext`, base64-encoded when the
/// payload travels inside a JSON packet body, raw when it travels as a
/// media datagram payload.
pub fn encrypt_symmetric(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CryptoError::InvalidKey)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptFailed)?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_symmetric(key: &SymmetricKey, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wire.len() < 12 {
        return Err(CryptoError::DecryptFailed);
    }
    let (nonce_bytes, ciphertext) = wire.split_at(12);
    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CryptoError::InvalidKey)?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Encrypt a string (used for `sender_encrypted_nickname`) and base64 it
/// for JSON transport.
pub fn encrypt_symmetric_str(key: &SymmetricKey, plain: &str) -> Result<String, CryptoError> {
    Ok(B64.encode(encrypt_symmetric(key, plain.as_bytes())?))
}

pub fn decrypt_symmetric_str(key: &SymmetricKey, wire_b64: &str) -> Result<String, CryptoError> {
    let wire = B64.decode(wire_b64).map_err(|_| CryptoError::DecryptFailed)?;
    let plain = decrypt_symmetric(key, &wire)?;
    String::from_utf8(plain).map_err(|_| CryptoError::DecryptFailed)
}

/// Fixed-width hex digest used as a routing key for a nickname (spec §3).
pub fn hash_nickname(nickname: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nickname.as_bytes());
    hex_encode(&hasher.finalize())
}

/// A random hex identifier: used for request uids, session tokens, and
/// media `packetId`s where a human-readable value is convenient.
pub fn generate_uid() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

/// Session token minted by the server on authorization (spec §3).
pub fn generate_token() -> String {
    generate_uid()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let recipient = KeyPair::generate();
        let key = SymmetricKey::generate();
        let wrapped = wrap_symmetric_key(&recipient.public_key(), &key).unwrap();
        let unwrapped = unwrap_symmetric_key(&recipient, &wrapped).unwrap();
        assert_eq!(key.0, unwrapped.0);
    }

    #[test]
    fn wrap_unwrap_wrong_recipient_fails() {
        let recipient = KeyPair::generate();
        let attacker = KeyPair::generate();
        let key = SymmetricKey::generate();
        let wrapped = wrap_symmetric_key(&recipient.public_key(), &key).unwrap();
        assert!(unwrap_symmetric_key(&attacker, &wrapped).is_err());
    }

    #[test]
    fn symmetric_encrypt_decrypt_roundtrip() {
        let key = SymmetricKey::generate();
        let plaintext = b"opaque encoded media frame";
        let wire = encrypt_symmetric(&key, plaintext).unwrap();
        assert_eq!(decrypt_symmetric(&key, &wire).unwrap(), plaintext);
    }

    #[test]
    fn symmetric_decrypt_tamper_detected() {
        let key = SymmetricKey::generate();
        let mut wire = encrypt_symmetric(&key, b"hello").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(decrypt_symmetric(&key, &wire).is_err());
    }

    #[test]
    fn nickname_hash_is_stable_and_hex() {
        let h1 = hash_nickname("alice");
        let h2 = hash_nickname("alice");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(h1, hash_nickname("bob"));
    }

    #[test]
    fn public_key_serialization_roundtrip() {
        let kp = KeyPair::generate();
        let encoded = serialize_public_key(&kp.public_key());
        let decoded = deserialize_public_key(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), kp.public_key().as_bytes());
    }
}
