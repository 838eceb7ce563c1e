//! Cryptographic primitives for device pairing and relay traffic.
//!
//! This module provides:
//! - Ephemeral secp256k1 key pairs for pairing ([`EphemeralKeyPair`])
//! - Shared key derivation: SHA-256 of the raw ECDH x coordinate
//! - AES-256-CBC encryption authenticated with HMAC-SHA-256
//!
//! # Wire layout
//!
//! `base64(IV[16] ‖ HMAC[32] ‖ ciphertext)`. The HMAC covers the ciphertext
//! only and uses the same key as the cipher. Decryption verifies the HMAC in
//! constant time before touching the cipher.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use k256::ecdh::EphemeralSecret;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key size (AES-256 and HMAC-SHA-256 key).
pub const KEY_SIZE: usize = 32;

/// CBC initialization vector size.
pub const IV_SIZE: usize = 16;

/// HMAC-SHA-256 tag size.
pub const MAC_SIZE: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Crypto errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The HMAC did not match; the payload was tampered with or the key is wrong.
    #[error("error on message integrity")]
    Integrity,

    /// The payload is too short or not valid base64.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Padding or UTF-8 was invalid after a successful integrity check.
    #[error("error on message decryption")]
    Decryption,

    /// A key or public point could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// A symmetric key shared with one device.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Decode the transport (base64) form stored in a device record.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_SIZE] = raw.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {KEY_SIZE} bytes, got {}", raw.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Transport (base64) form.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Generate a random key (for testing).
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Encrypt `plaintext` into the transport form.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        getrandom::getrandom(&mut iv).map_err(|e| CryptoError::Malformed(e.to_string()))?;

        let cipher = Aes256CbcEnc::new_from_slices(&self.0, &iv)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut mac = self.mac()?;
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::with_capacity(IV_SIZE + MAC_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Encrypt a UTF-8 string.
    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Verify and decrypt the transport form.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        if raw.len() < IV_SIZE + MAC_SIZE {
            return Err(CryptoError::Malformed(format!(
                "payload of {} bytes is shorter than the {} byte header",
                raw.len(),
                IV_SIZE + MAC_SIZE
            )));
        }
        let (iv, rest) = raw.split_at(IV_SIZE);
        let (tag, ciphertext) = rest.split_at(MAC_SIZE);

        let mut mac = self.mac()?;
        mac.update(ciphertext);
        mac.verify_slice(tag).map_err(|_| CryptoError::Integrity)?;

        let cipher = Aes256CbcDec::new_from_slices(&self.0, iv)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }

    /// Verify and decrypt into a UTF-8 string.
    pub fn decrypt_str(&self, encoded: &str) -> Result<String, CryptoError> {
        String::from_utf8(self.decrypt(encoded)?).map_err(|_| CryptoError::Decryption)
    }

    fn mac(&self) -> Result<HmacSha256, CryptoError> {
        <HmacSha256 as Mac>::new_from_slice(&self.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

// Don't leak key material in debug output
impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// Our half of a pairing key agreement.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Base64 of the public point's x coordinate, as shown to the peer.
    pub fn encoded_x(&self) -> String {
        let point = self.public.to_encoded_point(false);
        // Uncompressed points always carry x.
        let x = point.x().map(|x| x.to_vec()).unwrap_or_default();
        STANDARD.encode(x)
    }

    /// Base64 of the public point as `x ‖ y`.
    pub fn encoded_xy(&self) -> String {
        let point = self.public.to_encoded_point(false);
        STANDARD.encode(&point.as_bytes()[1..])
    }

    /// Derive the shared key from the peer's base64 `x ‖ y` point.
    ///
    /// A SEC1 point with its leading tag byte is accepted as well.
    pub fn derive_shared_key(&self, peer_encoded_xy: &str) -> Result<SymmetricKey, CryptoError> {
        let peer = decode_point(peer_encoded_xy)?;
        let shared = self.secret.diffie_hellman(&peer);
        let digest = Sha256::digest(shared.raw_secret_bytes());
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&digest);
        Ok(SymmetricKey(bytes))
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("encoded_x", &self.encoded_x())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn decode_point(encoded: &str) -> Result<PublicKey, CryptoError> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sec1 = if raw.len() == 64 {
        let mut tagged = Vec::with_capacity(65);
        tagged.push(0x04);
        tagged.extend_from_slice(&raw);
        tagged
    } else {
        raw
    };
    PublicKey::from_sec1_bytes(&sec1).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // Key agreement
    // ===========================================

    #[test]
    fn both_sides_derive_the_same_key() {
        let ours = EphemeralKeyPair::generate();
        let theirs = EphemeralKeyPair::generate();

        let k1 = ours.derive_shared_key(&theirs.encoded_xy()).unwrap();
        let k2 = theirs.derive_shared_key(&ours.encoded_xy()).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn encoded_x_is_32_bytes() {
        let kp = EphemeralKeyPair::generate();
        assert_eq!(STANDARD.decode(kp.encoded_x()).unwrap().len(), 32);
        assert_eq!(STANDARD.decode(kp.encoded_xy()).unwrap().len(), 64);
    }

    #[test]
    fn rejects_point_off_curve() {
        let kp = EphemeralKeyPair::generate();
        let bogus = STANDARD.encode([7u8; 64]);
        assert!(matches!(
            kp.derive_shared_key(&bogus),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    // ===========================================
    // Authenticated encryption
    // ===========================================

    #[test]
    fn decrypts_what_it_encrypts() {
        let key = SymmetricKey::random().unwrap();
        for len in [0usize, 1, 15, 16, 17, 255, 4096] {
            let msg: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let enc = key.encrypt(&msg).unwrap();
            assert_eq!(key.decrypt(&enc).unwrap(), msg);
        }
    }

    #[test]
    fn fresh_iv_per_message() {
        let key = SymmetricKey::random().unwrap();
        assert_ne!(key.encrypt(b"same").unwrap(), key.encrypt(b"same").unwrap());
    }

    #[test]
    fn any_flipped_bit_in_mac_or_ciphertext_is_integrity_error() {
        let key = SymmetricKey::random().unwrap();
        let enc = STANDARD
            .decode(key.encrypt(b"sign this hash please").unwrap())
            .unwrap();

        for byte in IV_SIZE..enc.len() {
            for bit in 0..8 {
                let mut tampered = enc.clone();
                tampered[byte] ^= 1 << bit;
                let err = key.decrypt(&STANDARD.encode(&tampered)).unwrap_err();
                assert_eq!(err, CryptoError::Integrity, "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn wrong_key_is_integrity_error() {
        let a = SymmetricKey::random().unwrap();
        let b = SymmetricKey::random().unwrap();
        let enc = a.encrypt(b"hello").unwrap();
        assert_eq!(b.decrypt(&enc).unwrap_err(), CryptoError::Integrity);
    }

    #[test]
    fn short_payload_is_malformed() {
        let key = SymmetricKey::random().unwrap();
        let short = STANDARD.encode([0u8; 40]);
        assert!(matches!(key.decrypt(&short), Err(CryptoError::Malformed(_))));
        assert!(matches!(key.decrypt("%%%"), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn key_base64_round_trip_and_redacted_debug() {
        let key = SymmetricKey::random().unwrap();
        let back = SymmetricKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, back);
        assert_eq!(format!("{key:?}"), "SymmetricKey([REDACTED])");
        assert!(SymmetricKey::from_base64("AAAA").is_err());
    }
}
