//! X.509 certificate handling: a thin wrapper around DER bytes that parses on demand,
//! the ISO 18013-5 extended key usages, and certificate generation for IACA roots and
//! their leaf certificates.

use p256::{
    ecdsa::{SigningKey, VerifyingKey},
    pkcs8::EncodePrivateKey,
};
use rand_core::OsRng;
use rcgen::{BasicConstraints, CertificateParams, CustomExtension, DnType, IsCa, KeyUsagePurpose, SerialNumber};
use rustls_pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};
use x509_parser::{certificate::X509Certificate, extensions::ParsedExtension, prelude::FromDer};

use crate::utils::crypto::{random_bytes, sha256};

#[derive(thiserror::Error, Debug)]
pub enum CertificateError {
    #[error("certificate parsing failed: {0}")]
    Parse(String),
    #[error("issuer not trusted")]
    UntrustedIssuer,
    #[error("certificate expired")]
    Expired,
    #[error("certificate not yet valid")]
    NotYetValid,
    #[error("certificate chain invalid: {0}")]
    ChainInvalid(String),
    #[error("certificate lacks digital signature key usage")]
    MissingKeyUsage,
    #[error("certificate lacks the {0:?} extended key usage")]
    MissingExtendedKeyUsage(CertificateUsage),
    #[error("certificate revoked")]
    Revoked,
    #[error("trust evaluator denied the chain: {0}")]
    DeniedByEvaluator(String),
    #[error("unsupported public key algorithm: {0}")]
    UnsupportedPublicKey(String),
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("key encoding failed: {0}")]
    KeyEncoding(#[from] p256::pkcs8::Error),
}

/// The roles a certificate can attest in ISO 18013-5, identified by extended key usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateUsage {
    /// Document Signer certificates (EKU 1.0.18013.5.1.2).
    Mdl,
    /// Reader authentication certificates (EKU 1.0.18013.5.1.6).
    ReaderAuth,
}

impl CertificateUsage {
    /// The DER value bytes of the EKU OID, as required by webpki.
    pub(crate) fn eku_oid(&self) -> &'static [u8] {
        match self {
            CertificateUsage::Mdl => &[40, 129, 140, 93, 5, 1, 2],
            CertificateUsage::ReaderAuth => &[40, 129, 140, 93, 5, 1, 6],
        }
    }

    fn oid_string(&self) -> &'static str {
        match self {
            CertificateUsage::Mdl => "1.0.18013.5.1.2",
            CertificateUsage::ReaderAuth => "1.0.18013.5.1.6",
        }
    }
}

/// The public key of a certificate, in one of the supported algorithms.
#[derive(Debug, Clone, PartialEq)]
pub enum CertPublicKey {
    P256(VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

/// An X.509 certificate as DER bytes, parsed on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate(CertificateDer<'static>);

impl From<Vec<u8>> for Certificate {
    fn from(der: Vec<u8>) -> Self {
        Certificate(CertificateDer::from(der))
    }
}

impl Certificate {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn as_der(&self) -> &CertificateDer<'static> {
        &self.0
    }

    pub fn from_pem(pem: &str) -> Result<Self, CertificateError> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        Ok(pem.contents.into())
    }

    pub(crate) fn parse(&self) -> Result<X509Certificate, CertificateError> {
        let (_, cert) = X509Certificate::from_der(self.as_bytes())
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        Ok(cert)
    }

    /// The common names in the certificate subject.
    pub fn common_names(&self) -> Result<Vec<String>, CertificateError> {
        let cert = self.parse()?;
        Ok(cert
            .subject()
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok().map(str::to_string))
            .collect())
    }

    /// The common names in the certificate issuer.
    pub fn issuer_common_names(&self) -> Result<Vec<String>, CertificateError> {
        let cert = self.parse()?;
        Ok(cert
            .issuer()
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok().map(str::to_string))
            .collect())
    }

    /// The subject key identifier from the corresponding extension, or, when that extension
    /// is absent, a synthetic identifier derived from the subject public key.
    pub fn subject_key_identifier(&self) -> Result<Vec<u8>, CertificateError> {
        let cert = self.parse()?;
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectKeyIdentifier(ski) = ext.parsed_extension() {
                return Ok(ski.0.to_vec());
            }
        }
        Ok(sha256(cert.public_key().raw))
    }

    /// Parse the subject public key into one of the supported key types.
    pub fn public_key(&self) -> Result<CertPublicKey, CertificateError> {
        let cert = self.parse()?;
        let spki = cert.public_key();
        let alg_oid = spki.algorithm.algorithm.to_id_string();
        let key_bytes = spki.subject_public_key.data.as_ref();

        match alg_oid.as_str() {
            // id-ecPublicKey; the curve is in the algorithm parameters.
            "1.2.840.10045.2.1" => {
                let curve_oid = spki
                    .algorithm
                    .parameters
                    .as_ref()
                    .and_then(|params| params.as_oid().ok())
                    .map(|oid| oid.to_id_string())
                    .ok_or_else(|| CertificateError::UnsupportedPublicKey("missing curve".to_string()))?;
                match curve_oid.as_str() {
                    "1.2.840.10045.3.1.7" => VerifyingKey::from_sec1_bytes(key_bytes)
                        .map(CertPublicKey::P256)
                        .map_err(|e| CertificateError::Parse(e.to_string())),
                    "1.3.132.0.34" => p384::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                        .map(CertPublicKey::P384)
                        .map_err(|e| CertificateError::Parse(e.to_string())),
                    other => Err(CertificateError::UnsupportedPublicKey(other.to_string())),
                }
            }
            // id-Ed25519
            "1.3.101.112" => {
                let bytes: [u8; 32] = key_bytes
                    .try_into()
                    .map_err(|_| CertificateError::Parse("bad Ed25519 key length".to_string()))?;
                ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                    .map(CertPublicKey::Ed25519)
                    .map_err(|e| CertificateError::Parse(e.to_string()))
            }
            other => Err(CertificateError::UnsupportedPublicKey(other.to_string())),
        }
    }

    /// Whether the certificate has the digital signature key usage bit.
    pub fn has_digital_signature_usage(&self) -> Result<bool, CertificateError> {
        let cert = self.parse()?;
        for ext in cert.extensions() {
            if let ParsedExtension::KeyUsage(usage) = ext.parsed_extension() {
                return Ok(usage.digital_signature());
            }
        }
        Ok(false)
    }

    /// Whether the certificate carries the extended key usage for the given role.
    pub fn has_extended_key_usage(&self, usage: CertificateUsage) -> Result<bool, CertificateError> {
        let cert = self.parse()?;
        for ext in cert.extensions() {
            if let ParsedExtension::ExtendedKeyUsage(eku) = ext.parsed_extension() {
                return Ok(eku.other.iter().any(|oid| oid.to_id_string() == usage.oid_string()));
            }
        }
        Ok(false)
    }

    /// The certificate validity window as UNIX timestamps `(not_before, not_after)`.
    pub fn validity_timestamps(&self) -> Result<(i64, i64), CertificateError> {
        let cert = self.parse()?;
        let validity = cert.validity();
        Ok((validity.not_before.timestamp(), validity.not_after.timestamp()))
    }
}

fn rcgen_keypair(key: &SigningKey) -> Result<rcgen::KeyPair, CertificateError> {
    let pkcs8 = key.to_pkcs8_der()?;
    let keypair = rcgen::KeyPair::try_from(pkcs8.as_bytes())?;
    Ok(keypair)
}

impl Certificate {
    /// Generate a new self-signed CA certificate (an IACA root) and its signing key.
    pub fn new_ca(common_name: &str) -> Result<(Certificate, SigningKey), CertificateError> {
        let signing_key = SigningKey::random(&mut OsRng);
        let keypair = rcgen_keypair(&signing_key)?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(SerialNumber::from(random_bytes(16)));
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365 * 10);

        let certificate = params.self_signed(&keypair)?;
        Ok((certificate.der().to_vec().into(), signing_key))
    }

    /// Generate a new certificate signed by the given CA, with the digital signature key
    /// usage and the extended key usage of the given role.
    pub fn new(
        ca: &Certificate,
        ca_key: &SigningKey,
        common_name: &str,
        usage: CertificateUsage,
    ) -> Result<(Certificate, SigningKey), CertificateError> {
        let signing_key = SigningKey::random(&mut OsRng);
        let keypair = rcgen_keypair(&signing_key)?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.serial_number = Some(SerialNumber::from(random_bytes(16)));
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365 * 5);
        params.custom_extensions.push(eku_extension(usage));

        let ca_keypair = rcgen_keypair(ca_key)?;
        let ca_params = CertificateParams::from_ca_cert_der(ca.as_der())?;
        let issuer = ca_params.self_signed(&ca_keypair)?;

        let certificate = params.signed_by(&keypair, &issuer, &ca_keypair)?;
        Ok((certificate.der().to_vec().into(), signing_key))
    }
}

/// Build the extKeyUsage (2.5.29.37) extension carrying a single ISO mdoc EKU.
fn eku_extension(usage: CertificateUsage) -> CustomExtension {
    let oid = usage.eku_oid();
    // SEQUENCE { OBJECT IDENTIFIER }
    let mut content = Vec::with_capacity(oid.len() + 4);
    content.push(0x30);
    content.push((oid.len() + 2) as u8);
    content.push(0x06);
    content.push(oid.len() as u8);
    content.extend_from_slice(oid);
    CustomExtension::from_oid_content(&[2, 5, 29, 37], content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ca_has_subject_and_key() {
        let (ca, ca_key) = Certificate::new_ca("test-ca.example.com").unwrap();

        assert_eq!(ca.common_names().unwrap(), vec!["test-ca.example.com"]);
        assert!(!ca.subject_key_identifier().unwrap().is_empty());

        let CertPublicKey::P256(public_key) = ca.public_key().unwrap() else {
            panic!("expected P-256 CA key");
        };
        assert_eq!(&public_key, ca_key.verifying_key());
    }

    #[test]
    fn generated_leaf_carries_usage() {
        let (ca, ca_key) = Certificate::new_ca("test-ca.example.com").unwrap();
        let (cert, key) = Certificate::new(&ca, &ca_key, "ds.example.com", CertificateUsage::Mdl).unwrap();

        assert_eq!(cert.common_names().unwrap(), vec!["ds.example.com"]);
        assert_eq!(cert.issuer_common_names().unwrap(), vec!["test-ca.example.com"]);
        assert!(cert.has_digital_signature_usage().unwrap());
        assert!(cert.has_extended_key_usage(CertificateUsage::Mdl).unwrap());
        assert!(!cert.has_extended_key_usage(CertificateUsage::ReaderAuth).unwrap());

        let CertPublicKey::P256(public_key) = cert.public_key().unwrap() else {
            panic!("expected P-256 leaf key");
        };
        assert_eq!(&public_key, key.verifying_key());
    }
}
