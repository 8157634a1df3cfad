//! Key material for parties that sign with a certified key: the issuer's Document Signer
//! and the reader's authentication key.

use p256::ecdsa::SigningKey;

use crate::utils::x509::{CertPublicKey, Certificate, CertificateError};

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("signing key does not match the certificate public key")]
    KeyMismatch,
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// A private key together with its certificate and any intermediates (leaf first).
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    chain: Vec<Certificate>,
}

impl KeyPair {
    /// Construct a key pair, verifying that the key matches the leaf certificate.
    pub fn new(signing_key: SigningKey, certificate: Certificate) -> Result<Self, KeyError> {
        Self::with_chain(signing_key, vec![certificate])
    }

    /// Construct a key pair with intermediates (leaf first), verifying that the key
    /// matches the leaf certificate.
    pub fn with_chain(signing_key: SigningKey, chain: Vec<Certificate>) -> Result<Self, KeyError> {
        let leaf = chain.first().ok_or(KeyError::KeyMismatch)?;
        match leaf.public_key()? {
            CertPublicKey::P256(public_key) if &public_key == signing_key.verifying_key() => {}
            _ => return Err(KeyError::KeyMismatch),
        }
        Ok(KeyPair { signing_key, chain })
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.chain[0]
    }

    /// The certificate chain, leaf first.
    pub fn certificate_chain(&self) -> &[Certificate] {
        &self.chain
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use p256::ecdsa::SigningKey;
    use rand_core::OsRng;

    use crate::utils::x509::CertificateUsage;

    use super::*;

    #[test]
    fn key_pair_requires_matching_certificate() {
        let (ca, ca_key) = Certificate::new_ca("ca.example.com").unwrap();
        let (cert, key) = Certificate::new(&ca, &ca_key, "ds.example.com", CertificateUsage::Mdl).unwrap();

        KeyPair::new(key, cert.clone()).unwrap();

        let other_key = SigningKey::random(&mut OsRng);
        assert_matches!(KeyPair::new(other_key, cert), Err(KeyError::KeyMismatch));
    }
}
