//! COSE envelopes: single-signer signatures (COSE_Sign1, tag 18) and MACs (COSE_Mac0,
//! tag 17) over CBOR payloads, plus the COSE_Key public key envelope.
//!
//! [`MdocCose`] wraps the `coset` structures and tracks the payload type at the type level,
//! so that e.g. an issuer authentication envelope cannot be confused with a device
//! signature. The structured signature input (`Sig_structure` / `MAC_structure`) is
//! computed by `coset` over the protected header bytes exactly as received, which keeps
//! signatures stable across re-encoding of the surrounding structure.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use ciborium::value::Value;
use coset::{
    iana, AsCborValue, CoseKeyBuilder, CoseMac0, CoseMac0Builder, CoseSign1, CoseSign1Builder, HeaderBuilder,
    Label, RegisteredLabel, RegisteredLabelWithPrivate,
};
use p256::ecdsa::{signature::Signer, signature::Verifier, SigningKey, VerifyingKey};
use ring::hmac;
use serde::{de, de::DeserializeOwned, ser, Deserialize, Serialize};

use crate::{
    trust::{TrustConfig, TrustList},
    utils::{
        crypto::CryptoError,
        serialization::{cbor_deserialize, cbor_serialize, CborError},
        time::Generator,
        x509::{CertPublicKey, Certificate, CertificateError, CertificateUsage},
    },
};

/// Header label under which the certificate chain is carried (RFC 9360 `x5chain`).
pub const HEADER_LABEL_X5CHAIN: i64 = 33;
/// Pre-registration label for `x5chain`, accepted on input only.
pub const HEADER_LABEL_X5CHAIN_COMPAT: i64 = 34;

#[derive(thiserror::Error, Debug)]
pub enum CoseError {
    #[error("missing algorithm in protected header")]
    MissingAlgorithm,
    #[error("algorithm in header does not match the key")]
    AlgorithmMismatch,
    #[error("unsupported algorithm: {0:?}")]
    UnsupportedAlgorithm(Label),
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("MAC verification failed")]
    MacInvalid,
    #[error("malformed key: {0}")]
    MalformedKey(#[from] CryptoError),
    #[error("missing payload")]
    MissingPayload,
    #[error("missing certificate chain in headers")]
    MissingCertificateChain,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("COSE structure error: {0}")]
    Structure(String),
    #[error("CBOR error: {0}")]
    Cbor(#[from] CborError),
}

/// Signing algorithms accepted in protected headers.
fn signature_algorithm(label: &RegisteredLabelWithPrivate<iana::Algorithm>) -> Result<iana::Algorithm, CoseError> {
    match label {
        RegisteredLabelWithPrivate::Assigned(alg)
            if matches!(
                alg,
                iana::Algorithm::ES256 | iana::Algorithm::ES384 | iana::Algorithm::EdDSA
            ) =>
        {
            Ok(*alg)
        }
        RegisteredLabelWithPrivate::Assigned(iana::Algorithm::ES512) => {
            Err(CoseError::UnsupportedAlgorithm(Label::Int(iana::Algorithm::ES512 as i64)))
        }
        RegisteredLabelWithPrivate::Assigned(alg) => Err(CoseError::UnsupportedAlgorithm(Label::Int(*alg as i64))),
        RegisteredLabelWithPrivate::Text(text) => Err(CoseError::UnsupportedAlgorithm(Label::Text(text.clone()))),
        RegisteredLabelWithPrivate::PrivateUse(int) => Err(CoseError::UnsupportedAlgorithm(Label::Int(*int))),
    }
}

/// A key that can produce a COSE signature: ECDSA emits fixed-width `r || s`, EdDSA signs
/// the raw signature input without prehashing.
pub trait CoseSigner {
    fn algorithm(&self) -> iana::Algorithm;
    fn sign_data(&self, data: &[u8]) -> Result<Vec<u8>, CoseError>;
}

impl CoseSigner for SigningKey {
    fn algorithm(&self) -> iana::Algorithm {
        iana::Algorithm::ES256
    }

    fn sign_data(&self, data: &[u8]) -> Result<Vec<u8>, CoseError> {
        let signature: p256::ecdsa::Signature =
            self.try_sign(data).map_err(|e| CoseError::Signing(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}

impl CoseSigner for p384::ecdsa::SigningKey {
    fn algorithm(&self) -> iana::Algorithm {
        iana::Algorithm::ES384
    }

    fn sign_data(&self, data: &[u8]) -> Result<Vec<u8>, CoseError> {
        let signature: p384::ecdsa::Signature =
            self.try_sign(data).map_err(|e| CoseError::Signing(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}

impl CoseSigner for ed25519_dalek::SigningKey {
    fn algorithm(&self) -> iana::Algorithm {
        iana::Algorithm::EdDSA
    }

    fn sign_data(&self, data: &[u8]) -> Result<Vec<u8>, CoseError> {
        let signature = ed25519_dalek::Signer::try_sign(self, data).map_err(|e| CoseError::Signing(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}

impl CertPublicKey {
    /// Verify a fixed-width signature under the given algorithm; the algorithm must match
    /// the key type.
    pub(crate) fn verify_signature(
        &self,
        algorithm: iana::Algorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), CoseError> {
        match (self, algorithm) {
            (CertPublicKey::P256(key), iana::Algorithm::ES256) => {
                let signature =
                    p256::ecdsa::Signature::from_slice(signature).map_err(|_| CoseError::SignatureInvalid)?;
                key.verify(data, &signature).map_err(|_| CoseError::SignatureInvalid)
            }
            (CertPublicKey::P384(key), iana::Algorithm::ES384) => {
                let signature =
                    p384::ecdsa::Signature::from_slice(signature).map_err(|_| CoseError::SignatureInvalid)?;
                key.verify(data, &signature).map_err(|_| CoseError::SignatureInvalid)
            }
            (CertPublicKey::Ed25519(key), iana::Algorithm::EdDSA) => {
                let signature =
                    ed25519_dalek::Signature::from_slice(signature).map_err(|_| CoseError::SignatureInvalid)?;
                ed25519_dalek::Verifier::verify(key, data, &signature).map_err(|_| CoseError::SignatureInvalid)
            }
            _ => Err(CoseError::AlgorithmMismatch),
        }
    }
}

/// Clone a COSE structure, adding or removing the payload. Used for detached payloads:
/// emitted with `payload = nil`, reattached by the verifier before verification.
pub trait ClonePayload {
    fn clone_with_payload(&self, bytes: Vec<u8>) -> Self;
    fn clone_without_payload(&self) -> Self;
}

/// Wrapper around a COSE structure `C` (COSE_Sign1 or COSE_Mac0), with the payload type
/// `T` tracked at the type level.
#[derive(Debug, Clone, PartialEq)]
pub struct MdocCose<C, T>(pub C, PhantomData<T>);

impl<C, T> MdocCose<C, T> {
    pub fn new(cose: C) -> Self {
        MdocCose(cose, PhantomData)
    }
}

impl<C, T> From<C> for MdocCose<C, T> {
    fn from(cose: C) -> Self {
        MdocCose::new(cose)
    }
}

impl<C: AsCborValue + Clone, T> Serialize for MdocCose<C, T> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0
            .clone()
            .to_cbor_value()
            .map_err(ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de, C: AsCborValue, T> Deserialize<'de> for MdocCose<C, T> {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let cose = C::from_cbor_value(value).map_err(de::Error::custom)?;
        Ok(MdocCose::new(cose))
    }
}

impl<T> ClonePayload for MdocCose<CoseSign1, T> {
    fn clone_with_payload(&self, bytes: Vec<u8>) -> Self {
        let mut cose = self.0.clone();
        cose.payload = Some(bytes);
        cose.into()
    }

    fn clone_without_payload(&self) -> Self {
        let mut cose = self.0.clone();
        cose.payload = None;
        cose.into()
    }
}

impl<T> ClonePayload for MdocCose<CoseMac0, T> {
    fn clone_with_payload(&self, bytes: Vec<u8>) -> Self {
        let mut cose = self.0.clone();
        cose.payload = Some(bytes);
        cose.into()
    }

    fn clone_without_payload(&self) -> Self {
        let mut cose = self.0.clone();
        cose.payload = None;
        cose.into()
    }
}

fn x5chain_value(certificates: &[Certificate]) -> Value {
    if certificates.len() == 1 {
        Value::Bytes(certificates[0].as_bytes().to_vec())
    } else {
        Value::Array(
            certificates
                .iter()
                .map(|cert| Value::Bytes(cert.as_bytes().to_vec()))
                .collect(),
        )
    }
}

fn certificates_from_value(value: &Value) -> Result<Vec<Certificate>, CoseError> {
    match value {
        Value::Bytes(der) => Ok(vec![der.clone().into()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_bytes()
                    .map(|der| Certificate::from(der.clone()))
                    .ok_or_else(|| CoseError::Structure("x5chain entry is not a byte string".to_string()))
            })
            .collect(),
        _ => Err(CoseError::Structure("x5chain is not bytes or array".to_string())),
    }
}

impl<T> MdocCose<CoseSign1, T> {
    /// Sign a payload, with the algorithm and the certificate chain (leaf first) in the
    /// protected header. With `detached`, the payload is omitted from the envelope and the
    /// verifier must reattach it.
    ///
    /// The payload parameter is separate from `T` so that borrowing payload types can be
    /// signed into envelopes whose phantom type is the owned alias.
    pub fn sign<P: Serialize>(
        payload: &P,
        key: &impl CoseSigner,
        certificates: &[Certificate],
        detached: bool,
    ) -> Result<Self, CoseError> {
        let payload_bytes = cbor_serialize(payload)?;

        let mut header = HeaderBuilder::new().algorithm(key.algorithm());
        if !certificates.is_empty() {
            header = header.value(HEADER_LABEL_X5CHAIN, x5chain_value(certificates));
        }

        let mut cose = CoseSign1Builder::new()
            .protected(header.build())
            .payload(payload_bytes)
            .try_create_signature(&[], |data| key.sign_data(data))?
            .build();

        // The signature input includes the payload either way; detached mode just does not
        // transmit it.
        if detached {
            cose.payload = None;
        }

        Ok(cose.into())
    }
}

impl<T> MdocCose<CoseSign1, T> {
    /// The signing algorithm from the protected header.
    pub fn algorithm(&self) -> Result<iana::Algorithm, CoseError> {
        let alg = self.0.protected.header.alg.as_ref().ok_or(CoseError::MissingAlgorithm)?;
        signature_algorithm(alg)
    }

    /// The certificate chain (leaf first) from the protected header, falling back to the
    /// compat label and the unprotected header on input.
    pub fn certificate_chain(&self) -> Result<Vec<Certificate>, CoseError> {
        let headers = [&self.0.protected.header.rest, &self.0.unprotected.rest];
        for rest in headers {
            for label in [HEADER_LABEL_X5CHAIN, HEADER_LABEL_X5CHAIN_COMPAT] {
                if let Some((_, value)) = rest.iter().find(|(l, _)| *l == Label::Int(label)) {
                    return certificates_from_value(value);
                }
            }
        }
        Err(CoseError::MissingCertificateChain)
    }

    /// The leaf certificate of the chain carried in the headers.
    pub fn signing_cert(&self) -> Result<Certificate, CoseError> {
        let mut chain = self.certificate_chain()?;
        if chain.is_empty() {
            return Err(CoseError::MissingCertificateChain);
        }
        Ok(chain.swap_remove(0))
    }

    /// Verify the signature with the given public key; the payload must be attached.
    pub fn verify(&self, key: &CertPublicKey) -> Result<(), CoseError> {
        let algorithm = self.algorithm()?;
        self.0
            .verify_signature(&[], |signature, data| key.verify_signature(algorithm, data, signature))
    }
}

impl<T> MdocCose<CoseSign1, T>
where
    T: DeserializeOwned,
{
    /// Decode the payload without verifying the signature. Only for reading data out of an
    /// envelope whose authenticity is established elsewhere, or not yet relevant.
    pub fn dangerous_parse_unverified(&self) -> Result<T, CoseError> {
        let payload = self.0.payload.as_ref().ok_or(CoseError::MissingPayload)?;
        let parsed = cbor_deserialize(payload.as_slice())?;
        Ok(parsed)
    }

    /// Verify the envelope against trust anchors: extract the certificate chain, evaluate
    /// trust for `usage` at the generated time, verify the signature with the leaf key, and
    /// decode the payload. Returns the payload and the leaf certificate.
    pub fn verify_against_trust_anchors(
        &self,
        usage: CertificateUsage,
        time: &impl Generator<DateTime<Utc>>,
        trust_list: &TrustList,
        config: &TrustConfig,
    ) -> Result<(T, Certificate), crate::Error> {
        let chain = self.certificate_chain()?;
        trust_list.verify_chain(&chain, usage, time.generate(), config, None)?;

        let leaf = chain.into_iter().next().ok_or(CoseError::MissingCertificateChain)?;
        let key = leaf.public_key()?;
        self.verify(&key)?;

        let payload = self.dangerous_parse_unverified()?;
        Ok((payload, leaf))
    }
}

impl<T> MdocCose<CoseMac0, T> {
    /// Compute a COSE_Mac0 with HMAC-SHA-256 over the payload.
    pub fn generate<P: Serialize>(payload: &P, key: &hmac::Key, detached: bool) -> Result<Self, CoseError> {
        let payload_bytes = cbor_serialize(payload)?;
        let header = HeaderBuilder::new().algorithm(iana::Algorithm::HMAC_256_256).build();

        let mut mac = CoseMac0Builder::new()
            .protected(header)
            .payload(payload_bytes)
            .create_tag(&[], |data| hmac::sign(key, data).as_ref().to_vec())
            .build();

        if detached {
            mac.payload = None;
        }

        Ok(mac.into())
    }
}

impl<T> MdocCose<CoseMac0, T> {
    /// Verify the MAC with the given key; the payload must be attached.
    pub fn verify(&self, key: &hmac::Key) -> Result<(), CoseError> {
        match self.0.protected.header.alg.as_ref() {
            Some(RegisteredLabelWithPrivate::Assigned(iana::Algorithm::HMAC_256_256)) => {}
            Some(_) => return Err(CoseError::AlgorithmMismatch),
            None => return Err(CoseError::MissingAlgorithm),
        }
        self.0
            .verify_tag(&[], |tag, data| hmac::verify(key, data, tag).map_err(|_| CoseError::MacInvalid))
    }
}

/// COSE_Key public key envelope: an integer-keyed map carrying the key type, curve and
/// coordinates. EC2 keys carry `(x, y)` padded to the curve length, OKP keys only `x`.
#[derive(Debug, Clone, PartialEq)]
pub struct CoseKey(pub coset::CoseKey);

impl From<coset::CoseKey> for CoseKey {
    fn from(key: coset::CoseKey) -> Self {
        CoseKey(key)
    }
}

impl Serialize for CoseKey {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0
            .clone()
            .to_cbor_value()
            .map_err(ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CoseKey {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let key = coset::CoseKey::from_cbor_value(value).map_err(de::Error::custom)?;
        Ok(CoseKey(key))
    }
}

impl TryFrom<&VerifyingKey> for CoseKey {
    type Error = CryptoError;

    fn try_from(key: &VerifyingKey) -> Result<Self, Self::Error> {
        let encoded_point = key.to_encoded_point(false);
        let x = encoded_point.x().ok_or(CryptoError::KeyMissingCoordinate)?.to_vec();
        let y = encoded_point.y().ok_or(CryptoError::KeyMissingCoordinate)?.to_vec();

        let key = CoseKey(CoseKeyBuilder::new_ec2_pub_key(iana::EllipticCurve::P_256, x, y).build());
        Ok(key)
    }
}

impl TryFrom<&CoseKey> for VerifyingKey {
    type Error = CryptoError;

    fn try_from(key: &CoseKey) -> Result<Self, Self::Error> {
        if key.0.kty != RegisteredLabel::Assigned(iana::KeyType::EC2) {
            return Err(CryptoError::KeyWrongType);
        }

        let curve = key.0.params.first().ok_or(CryptoError::KeyWrongType)?;
        if *curve != (Label::Int(-1), Value::Integer(1.into())) {
            return Err(CryptoError::KeyWrongType);
        }

        let x = key.0.params.get(1).ok_or(CryptoError::KeyMissingCoordinate)?;
        if x.0 != Label::Int(-2) {
            return Err(CryptoError::KeyUnexpectedCoseLabel);
        }
        let y = key.0.params.get(2).ok_or(CryptoError::KeyMissingCoordinate)?;
        if y.0 != Label::Int(-3) {
            return Err(CryptoError::KeyUnexpectedCoseLabel);
        }

        let x = x.1.as_bytes().ok_or(CryptoError::KeyCoordinateParseFailed)?;
        let y = y.1.as_bytes().ok_or(CryptoError::KeyCoordinateParseFailed)?;
        if x.len() != 32 || y.len() != 32 {
            return Err(CryptoError::KeyCoordinateParseFailed);
        }

        let key = VerifyingKey::from_encoded_point(&p256::EncodedPoint::from_affine_coordinates(
            x.as_slice().into(),
            y.as_slice().into(),
            false,
        ))
        .map_err(CryptoError::KeyParseFailed)?;
        Ok(key)
    }
}

impl From<&ed25519_dalek::VerifyingKey> for CoseKey {
    fn from(key: &ed25519_dalek::VerifyingKey) -> Self {
        CoseKey(coset::CoseKey {
            kty: RegisteredLabel::Assigned(iana::KeyType::OKP),
            params: vec![
                (Label::Int(-1), Value::Integer((iana::EllipticCurve::Ed25519 as i64).into())),
                (Label::Int(-2), Value::Bytes(key.to_bytes().to_vec())),
            ],
            ..Default::default()
        })
    }
}

impl TryFrom<&CoseKey> for p256::PublicKey {
    type Error = CryptoError;

    fn try_from(key: &CoseKey) -> Result<Self, Self::Error> {
        let verifying_key = VerifyingKey::try_from(key)?;
        Ok(verifying_key.into())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use p256::ecdsa::SigningKey;
    use rand_core::OsRng;

    use crate::utils::x509::CertificateUsage;

    use super::*;

    fn signing_setup() -> (SigningKey, Vec<Certificate>) {
        let (ca, ca_key) = Certificate::new_ca("ca.example.com").unwrap();
        let (cert, key) = Certificate::new(&ca, &ca_key, "signer.example.com", CertificateUsage::Mdl).unwrap();
        (key, vec![cert])
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let (key, chain) = signing_setup();
        let payload = "some payload".to_string();

        let cose = MdocCose::<CoseSign1, String>::sign(&payload, &key, &chain, false).unwrap();

        let leaf_key = cose.signing_cert().unwrap().public_key().unwrap();
        cose.verify(&leaf_key).unwrap();
        assert_eq!(cose.dangerous_parse_unverified().unwrap(), payload);

        // Tampering with the payload invalidates the signature.
        let tampered = cose.clone_with_payload(cbor_serialize(&"other payload").unwrap());
        assert_matches!(tampered.verify(&leaf_key), Err(CoseError::SignatureInvalid));

        // Tampering with the signature invalidates it too.
        let mut bad_signature = cose.clone();
        bad_signature.0.signature[0] ^= 0x01;
        assert_matches!(bad_signature.verify(&leaf_key), Err(CoseError::SignatureInvalid));
    }

    #[test]
    fn ecdsa_signature_is_fixed_width() {
        let (key, chain) = signing_setup();
        let cose = MdocCose::<CoseSign1, String>::sign(&"payload".to_string(), &key, &chain, false).unwrap();
        assert_eq!(cose.0.signature.len(), 64);
    }

    #[test]
    fn detached_signature_requires_payload() {
        let (key, chain) = signing_setup();
        let payload = "detached payload".to_string();

        let cose = MdocCose::<CoseSign1, String>::sign(&payload, &key, &chain, true).unwrap();
        assert!(cose.0.payload.is_none());

        let leaf_key = cose.signing_cert().unwrap().public_key().unwrap();
        assert_matches!(cose.verify(&leaf_key), Err(CoseError::SignatureInvalid));

        cose.clone_with_payload(cbor_serialize(&payload).unwrap())
            .verify(&leaf_key)
            .unwrap();
    }

    #[test]
    fn eddsa_sign_and_verify() {
        let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let payload = "ed25519 payload".to_string();

        let cose = MdocCose::<CoseSign1, String>::sign(&payload, &key, &[], false).unwrap();
        assert_eq!(cose.algorithm().unwrap(), iana::Algorithm::EdDSA);

        let public_key = CertPublicKey::Ed25519(key.verifying_key());
        cose.verify(&public_key).unwrap();
    }

    #[test]
    fn mac0_roundtrip() {
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"0123456789abcdef0123456789abcdef");
        let payload = "mac payload".to_string();

        let mac = MdocCose::<CoseMac0, String>::generate(&payload, &key, false).unwrap();
        mac.verify(&key).unwrap();

        let other_key = hmac::Key::new(hmac::HMAC_SHA256, b"another key value for the mac...");
        assert_matches!(mac.verify(&other_key), Err(CoseError::MacInvalid));
    }

    #[test]
    fn cose_serialization_roundtrip() {
        let (key, chain) = signing_setup();
        let cose = MdocCose::<CoseSign1, String>::sign(&"payload".to_string(), &key, &chain, false).unwrap();

        let bytes = cbor_serialize(&cose).unwrap();
        let decoded: MdocCose<CoseSign1, String> = cbor_deserialize(&bytes).unwrap();

        let leaf_key = decoded.signing_cert().unwrap().public_key().unwrap();
        decoded.verify(&leaf_key).unwrap();
        assert_eq!(decoded.certificate_chain().unwrap(), cose.certificate_chain().unwrap());
    }

    #[test]
    fn cose_key_conversion_roundtrip() {
        let key = SigningKey::random(&mut OsRng);
        let cose_key: CoseKey = key.verifying_key().try_into().unwrap();
        let recovered: VerifyingKey = (&cose_key).try_into().unwrap();
        assert_eq!(&recovered, key.verifying_key());

        let bytes = cbor_serialize(&cose_key).unwrap();
        let decoded: CoseKey = cbor_deserialize(&bytes).unwrap();
        assert_eq!(decoded, cose_key);
    }

    #[test]
    fn okp_key_is_rejected_as_ec2() {
        let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let cose_key: CoseKey = (&key.verifying_key()).into();
        assert_matches!(VerifyingKey::try_from(&cose_key), Err(CryptoError::KeyWrongType));
    }
}
