//! Cryptographic utilities: digests, HKDF, Diffie-Hellman derived HMAC keys and randomness.

use p256::{
    ecdh,
    ecdsa::{SigningKey, VerifyingKey},
};
use rand_core::{OsRng, RngCore};
use ring::hmac;
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};

use crate::{
    iso::mdocs::DigestAlgorithm,
    utils::serialization::{cbor_serialize, CborError},
};

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("HKDF failed")]
    Hkdf,
    #[error("missing coordinate")]
    KeyMissingCoordinate,
    #[error("wrong key type")]
    KeyWrongType,
    #[error("unexpected COSE key label")]
    KeyUnexpectedCoseLabel,
    #[error("coordinate parse failed")]
    KeyCoordinateParseFailed,
    #[error("key parse failed: {0}")]
    KeyParseFailed(#[from] p256::ecdsa::Error),
    #[error("CBOR error: {0}")]
    Cbor(#[from] CborError),
}

pub fn sha256(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

pub fn sha512(bytes: &[u8]) -> Vec<u8> {
    Sha512::digest(bytes).to_vec()
}

/// Generate `len` bytes from the OS random number generator.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Compute the digest of the CBOR encoding of the argument, under the given algorithm.
pub fn cbor_digest<T: Serialize>(val: &T, alg: DigestAlgorithm) -> Result<Vec<u8>, CborError> {
    let bytes = cbor_serialize(val)?;
    Ok(alg.digest(&bytes))
}

struct HkdfLen(usize);
impl ring::hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// The HKDF from RFC 5869 with SHA-256.
pub fn hkdf(input_key_material: &[u8], salt: &[u8], info: &str, len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut bytes = vec![0u8; len];
    ring::hkdf::Salt::new(ring::hkdf::HKDF_SHA256, salt)
        .extract(input_key_material)
        .expand(&[info.as_bytes()], HkdfLen(len))
        .map_err(|_| CryptoError::Hkdf)?
        .fill(&mut bytes)
        .map_err(|_| CryptoError::Hkdf)?;
    Ok(bytes)
}

/// Using the HKDF from RFC 5869, compute a HMAC key. The salt is hashed before use.
pub fn hmac_key(input_key_material: &[u8], salt: &[u8], info: &str, len: usize) -> Result<hmac::Key, CryptoError> {
    let bytes = hkdf(input_key_material, sha256(salt).as_slice(), info, len)?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, &bytes);
    Ok(key)
}

/// Using Diffie-Hellman and the HKDF from RFC 5869, compute a HMAC key.
///
/// With `info = "EMacKey"` and the session transcript bytes as salt, this is the key
/// derivation for MAC-mode device authentication: the private key is the party's own key
/// (the mdoc key on the holder side, the ephemeral reader key on the reader side) and the
/// public key is the other party's.
pub fn dh_hmac_key(
    privkey: &SigningKey,
    pubkey: &VerifyingKey,
    salt: &[u8],
    info: &str,
    len: usize,
) -> Result<hmac::Key, CryptoError> {
    let dh = ecdh::diffie_hellman(privkey.as_nonzero_scalar(), pubkey.as_affine());
    hmac_key(dh.raw_secret_bytes().as_ref(), salt, info, len)
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::SigningKey;
    use rand_core::OsRng;

    use super::*;

    #[test]
    fn hkdf_expands_to_requested_length() {
        let okm = hkdf(b"input", b"salt", "info", 32).unwrap();
        assert_eq!(okm.len(), 32);

        // Same inputs, same output.
        assert_eq!(okm, hkdf(b"input", b"salt", "info", 32).unwrap());

        // Different info, different output.
        assert_ne!(okm, hkdf(b"input", b"salt", "other", 32).unwrap());
    }

    #[test]
    fn dh_hmac_key_agrees_between_parties() {
        let device_key = SigningKey::random(&mut OsRng);
        let reader_key = SigningKey::random(&mut OsRng);

        let device_side =
            dh_hmac_key(&device_key, reader_key.verifying_key(), b"transcript", "EMacKey", 32).unwrap();
        let reader_side =
            dh_hmac_key(&reader_key, device_key.verifying_key(), b"transcript", "EMacKey", 32).unwrap();

        let tag = ring::hmac::sign(&device_side, b"message");
        ring::hmac::verify(&reader_side, b"message", tag.as_ref()).unwrap();
    }

    #[test]
    fn cbor_digest_depends_on_algorithm() {
        let sha256_digest = cbor_digest(&"value", DigestAlgorithm::Sha256).unwrap();
        let sha512_digest = cbor_digest(&"value", DigestAlgorithm::Sha512).unwrap();
        assert_eq!(sha256_digest.len(), 32);
        assert_eq!(sha512_digest.len(), 64);
    }
}
