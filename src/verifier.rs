//! RP software, for verifying mdoc disclosures: see [`Verifier::verify`].
//!
//! Verification of a [`DeviceResponse`] walks, per document: issuer envelope → certificate
//! chain trust → issuer signature → MSO checks → per-element digests → device
//! authentication → (optionally) revocation status. Problems are collected per document
//! rather than short-circuiting, so a caller sees every independent failure; any error
//! marks the document invalid.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use p256::{ecdsa::SigningKey, SecretKey};
use tracing::{debug, warn};
use url::Url;

use crate::{
    errors::Error,
    identifiers::{AttributeIdentifier, AttributeIdentifierHolder},
    iso::{
        device_retrieval::ItemsRequest,
        disclosure::{DeviceAuth, DeviceResponse, Document, DocumentError, IssuerSigned},
        engagement::{DeviceAuthenticationKeyed, SessionTranscript},
        mdl::{MdlAttributes, MDL_NAMESPACE},
        mdocs::{
            DataElementIdentifier, DataElementValue, DigestId, DocType, MobileSecurityObject,
            MobileSecurityObjectVersion, NameSpace, ValidityInfo,
        },
    },
    status::{CredentialStatus, StatusClient, StatusTokenFetcher},
    trust::{TrustConfig, TrustList},
    utils::{
        cose::ClonePayload,
        crypto::{cbor_digest, dh_hmac_key},
        serialization::{cbor_serialize, CborSeq, RequiredValue, TaggedBytes},
        time::Generator,
        x509::{CertPublicKey, Certificate, CertificateUsage},
    },
};

#[derive(thiserror::Error, Debug)]
pub enum VerificationError {
    #[error("errors in device response: {0:#?}")]
    DeviceResponseErrors(Vec<DocumentError>),
    #[error("unexpected status: {0}")]
    UnexpectedStatus(u64),
    #[error("unsupported MSO version")]
    UnsupportedVersion,
    #[error("no documents found in device response")]
    NoDocuments,
    #[error("inconsistent doctypes: document contained {document}, mso contained {mso}")]
    WrongDocType { document: DocType, mso: DocType },
    #[error("namespace {0} not found in mso")]
    MissingNamespace(NameSpace),
    #[error("digest ID {0} not found in mso")]
    MissingDigestId(DigestId),
    #[error("digest of element {namespace}/{element} did not match the value in the MSO")]
    DigestMismatch { namespace: NameSpace, element: DataElementIdentifier },
    #[error("missing device authentication")]
    DeviceAuthMissing,
    #[error("missing ephemeral reader key for MAC device authentication")]
    EphemeralKeyMissing,
    #[error("validity error: {0}")]
    Validity(#[from] ValidityError),
    #[error("attributes mismatch: {0:?}")]
    MissingAttributes(Vec<AttributeIdentifier>),
    #[error("credential status is {0:?}")]
    CredentialStatus(CredentialStatus),
    #[error("unexpected amount of CA Common Names in issuer certificate: expected 1, found {0}")]
    UnexpectedCaCommonNameCount(usize),
    #[error("unexpected amount of Common Names in issuer certificate: expected 1, found {0}")]
    UnexpectedIssuerCommonNameCount(usize),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidityError {
    #[error("validity parsing failed: {0}")]
    ParsingFailed(#[from] chrono::ParseError),
    #[error("not yet valid: valid from {0}")]
    NotYetValid(String),
    #[error("expired at {0}")]
    Expired(String),
}

/// Indicate how a [`ValidityInfo`] should be verified against the current date.
#[derive(Debug, Clone, Copy)]
pub enum ValidityRequirement {
    /// The [`ValidityInfo`] must not be expired, but it is allowed to be not yet valid.
    AllowNotYetValid,
    /// The [`ValidityInfo`] must be valid now and not be expired.
    Valid,
}

impl ValidityInfo {
    pub fn verify_is_valid_at(
        &self,
        time: DateTime<Utc>,
        validity: ValidityRequirement,
    ) -> Result<(), ValidityError> {
        if matches!(validity, ValidityRequirement::Valid) && time < DateTime::<Utc>::try_from(&self.valid_from)? {
            Err(ValidityError::NotYetValid(self.valid_from.0 .0.clone()))
        } else if time > DateTime::<Utc>::try_from(&self.valid_until)? {
            Err(ValidityError::Expired(self.valid_until.0 .0.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemsRequests(pub Vec<ItemsRequest>);

impl From<Vec<ItemsRequest>> for ItemsRequests {
    fn from(value: Vec<ItemsRequest>) -> Self {
        Self(value)
    }
}

impl ItemsRequests {
    /// Checks that all requested attributes are disclosed in the [`DeviceResponse`].
    pub fn match_against_response(&self, device_response: &DeviceResponse) -> Result<(), Error> {
        let not_found: Vec<_> = self
            .0
            .iter()
            .flat_map(|items_request| {
                device_response
                    .documents
                    .as_ref()
                    .and_then(|docs| docs.iter().find(|doc| doc.doc_type == items_request.doc_type))
                    .map_or_else(
                        // If the entire document is missing then all requested attributes are missing.
                        || items_request.attribute_identifiers().into_iter().collect(),
                        |doc| doc.missing_attributes(items_request),
                    )
            })
            .collect();

        if not_found.is_empty() {
            Ok(())
        } else {
            Err(VerificationError::MissingAttributes(not_found).into())
        }
    }
}

/// The verified attributes of one document, with the problems encountered while
/// verifying it. `valid` is false iff `errors` is non-empty.
#[derive(Debug)]
pub struct DocumentResult {
    pub valid: bool,
    pub doc_type: DocType,
    pub attributes: IndexMap<NameSpace, IndexMap<DataElementIdentifier, DataElementValue>>,
    pub issuer: Option<String>,
    pub ca: Option<String>,
    pub issuer_certificate: Option<Certificate>,
    pub mso: Option<MobileSecurityObject>,
    pub status: Option<CredentialStatus>,
    pub errors: Vec<Error>,
}

impl DocumentResult {
    fn invalid(doc_type: DocType, errors: Vec<Error>) -> Self {
        DocumentResult {
            valid: false,
            doc_type,
            attributes: IndexMap::new(),
            issuer: None,
            ca: None,
            issuer_certificate: None,
            mso: None,
            status: None,
            errors,
        }
    }

    /// The verified value of an element, if disclosed.
    pub fn get(&self, namespace: &str, element: &str) -> Option<&DataElementValue> {
        self.attributes.get(namespace)?.get(element)
    }

    /// Whether the holder is attested to be over the age threshold: `(value, attested)`.
    /// `attested` is false when the document carries no verified attestation for the
    /// threshold.
    pub fn verify_age_over(&self, threshold: u8) -> (bool, bool) {
        match self.get(MDL_NAMESPACE, &MdlAttributes::age_over_element(threshold)) {
            Some(DataElementValue::Bool(over)) => (*over, true),
            _ => (false, false),
        }
    }
}

/// The outcome of verifying a [`DeviceResponse`]: valid iff the top-level checks passed
/// and every document is valid.
#[derive(Debug)]
pub struct VerificationResult {
    pub valid: bool,
    pub documents: Vec<DocumentResult>,
    pub errors: Vec<Error>,
}

/// Verifies device responses against a trust list of IACA anchors.
pub struct Verifier {
    trust_list: TrustList,
    trust_config: TrustConfig,
}

impl Verifier {
    pub fn new(trust_list: TrustList) -> Self {
        Verifier {
            trust_list,
            trust_config: TrustConfig::default(),
        }
    }

    pub fn with_trust_config(mut self, trust_config: TrustConfig) -> Self {
        self.trust_config = trust_config;
        self
    }

    pub fn skip_revocation(mut self, skip: bool) -> Self {
        self.trust_config.skip_revocation = skip;
        self
    }

    /// Verify a [`DeviceResponse`] against the session transcript it was produced under.
    ///
    /// `eph_reader_key` is required when a document authenticates with a MAC. Problems are
    /// collected per document; the result is valid only if everything checked out.
    pub fn verify(
        &self,
        device_response: &DeviceResponse,
        session_transcript: &SessionTranscript,
        eph_reader_key: Option<&SecretKey>,
        time: &impl Generator<DateTime<Utc>>,
    ) -> VerificationResult {
        let mut errors: Vec<Error> = Vec::new();

        if device_response.status != 0 {
            errors.push(VerificationError::UnexpectedStatus(device_response.status).into());
        }
        if let Some(document_errors) = &device_response.document_errors {
            errors.push(VerificationError::DeviceResponseErrors(document_errors.clone()).into());
        }

        let documents = match &device_response.documents {
            Some(documents) if !documents.is_empty() => documents
                .iter()
                .map(|document| {
                    debug!("verifying document with doc_type {}", document.doc_type);
                    let result = self.verify_document(document, session_transcript, eph_reader_key, time);
                    if !result.valid {
                        warn!("document {} failed verification", document.doc_type);
                    }
                    result
                })
                .collect(),
            _ => {
                errors.push(VerificationError::NoDocuments.into());
                Vec::new()
            }
        };

        VerificationResult {
            valid: errors.is_empty() && documents.iter().all(|document| document.valid),
            documents,
            errors,
        }
    }

    /// Like [`Verifier::verify`], additionally resolving the revocation status of every
    /// document whose MSO carries a status reference. A status other than valid, or a
    /// failure to determine it, marks the document invalid.
    pub async fn verify_with_status<F: StatusTokenFetcher>(
        &self,
        device_response: &DeviceResponse,
        session_transcript: &SessionTranscript,
        eph_reader_key: Option<&SecretKey>,
        time: &impl Generator<DateTime<Utc>>,
        status_client: &StatusClient<F>,
    ) -> VerificationResult {
        let mut result = self.verify(device_response, session_transcript, eph_reader_key, time);

        for document in &mut result.documents {
            let Some(reference) = document.mso.as_ref().and_then(|mso| mso.status.as_ref()) else {
                continue;
            };

            let checked = Url::parse(&reference.status_list.uri)
                .map_err(|e| crate::status::StatusError::Parse(e.to_string()));
            let checked = match checked {
                Ok(uri) => status_client.check(&uri, reference.status_list.idx).await,
                Err(e) => Err(e),
            };

            match checked {
                Ok(CredentialStatus::Valid) => document.status = Some(CredentialStatus::Valid),
                Ok(status) => {
                    document.status = Some(status);
                    document.valid = false;
                    document.errors.push(VerificationError::CredentialStatus(status).into());
                }
                Err(e) => {
                    document.valid = false;
                    document.errors.push(e.into());
                }
            }
        }

        result.valid = result.errors.is_empty() && result.documents.iter().all(|document| document.valid);
        result
    }

    fn verify_document(
        &self,
        document: &Document,
        session_transcript: &SessionTranscript,
        eph_reader_key: Option<&SecretKey>,
        time: &impl Generator<DateTime<Utc>>,
    ) -> DocumentResult {
        // Issuer envelope: chain extraction, trust evaluation, signature, MSO decoding.
        let (mso, issuer_certificate) = match document.issuer_signed.issuer_auth.verify_against_trust_anchors(
            CertificateUsage::Mdl,
            time,
            &self.trust_list,
            &self.trust_config,
        ) {
            Ok((TaggedBytes(mso), certificate)) => (mso, certificate),
            Err(e) => {
                warn!("issuer authentication failed: {e}");
                return DocumentResult::invalid(document.doc_type.clone(), vec![e]);
            }
        };

        let mut errors: Vec<Error> = Vec::new();

        if mso.version != MobileSecurityObjectVersion::V1_0 {
            errors.push(VerificationError::UnsupportedVersion.into());
        }
        if document.doc_type != mso.doc_type {
            errors.push(
                VerificationError::WrongDocType {
                    document: document.doc_type.clone(),
                    mso: mso.doc_type.clone(),
                }
                .into(),
            );
        }
        if let Err(e) = mso.validity_info.verify_is_valid_at(time.generate(), ValidityRequirement::Valid) {
            errors.push(Error::from(VerificationError::from(e)));
        }

        // Per-element digest verification; a mismatch is fatal to the document but the
        // remaining elements are still checked so every problem is reported.
        let mut attributes = IndexMap::new();
        if let Some(name_spaces) = &document.issuer_signed.name_spaces {
            for (namespace, items) in name_spaces {
                let mut verified = IndexMap::new();
                for item in &items.0 {
                    match mso.verify_attr_digest(namespace, item) {
                        Ok(()) => {
                            verified.insert(item.0.element_identifier.clone(), item.0.element_value.clone());
                        }
                        Err(e) => errors.push(e),
                    }
                }
                if !verified.is_empty() {
                    attributes.insert(namespace.clone(), verified);
                }
            }
        }

        if let Err(e) = self.verify_device_auth(document, &mso, session_transcript, eph_reader_key) {
            errors.push(e);
        }

        // The common names, for display to the relying party.
        let (issuer, ca) = match (issuer_certificate.common_names(), issuer_certificate.issuer_common_names()) {
            (Ok(mut issuer_cns), Ok(mut ca_cns)) => {
                let issuer = (issuer_cns.len() == 1).then(|| issuer_cns.pop().unwrap());
                if issuer.is_none() {
                    errors.push(VerificationError::UnexpectedIssuerCommonNameCount(issuer_cns.len()).into());
                }
                let ca = (ca_cns.len() == 1).then(|| ca_cns.pop().unwrap());
                if ca.is_none() {
                    errors.push(VerificationError::UnexpectedCaCommonNameCount(ca_cns.len()).into());
                }
                (issuer, ca)
            }
            (Err(e), _) | (_, Err(e)) => {
                errors.push(e.into());
                (None, None)
            }
        };

        DocumentResult {
            valid: errors.is_empty(),
            doc_type: document.doc_type.clone(),
            attributes,
            issuer,
            ca,
            issuer_certificate: Some(issuer_certificate),
            mso: Some(mso),
            status: None,
            errors,
        }
    }

    /// Verify device authentication: reconstruct the signed structure from the transcript
    /// and the response, take the device key from the MSO, and check the signature or MAC.
    fn verify_device_auth(
        &self,
        document: &Document,
        mso: &MobileSecurityObject,
        session_transcript: &SessionTranscript,
        eph_reader_key: Option<&SecretKey>,
    ) -> Result<(), Error> {
        let device_signed = document
            .device_signed
            .as_ref()
            .ok_or(VerificationError::DeviceAuthMissing)?;

        let device_authentication = DeviceAuthenticationKeyed {
            device_authentication: RequiredValue::default(),
            session_transcript: Cow::Borrowed(session_transcript),
            doc_type: Cow::Borrowed(&document.doc_type),
            device_name_spaces_bytes: device_signed.name_spaces.clone(),
        };
        let device_authentication_bts = cbor_serialize(&TaggedBytes(CborSeq(device_authentication)))
            .map_err(crate::utils::cose::CoseError::from)?;

        let device_key: p256::ecdsa::VerifyingKey = (&mso.device_key_info.device_key)
            .try_into()
            .map_err(crate::utils::crypto::CryptoError::from)?;

        match &device_signed.device_auth {
            DeviceAuth::DeviceSignature(signature) => {
                debug!("verifying device signature");
                signature
                    .clone_with_payload(device_authentication_bts)
                    .verify(&CertPublicKey::P256(device_key))?;
            }
            DeviceAuth::DeviceMac(mac) => {
                debug!("verifying device MAC");
                let eph_reader_key = eph_reader_key.ok_or(VerificationError::EphemeralKeyMissing)?;
                let session_transcript_bts = session_transcript.bytes()?;
                let mac_key = dh_hmac_key(
                    &SigningKey::from(eph_reader_key.clone()),
                    &device_key,
                    &session_transcript_bts,
                    "EMacKey",
                    32,
                )?;
                mac.clone_with_payload(device_authentication_bts).verify(&mac_key)?;
            }
        }

        Ok(())
    }
}

impl MobileSecurityObject {
    /// Given an issuer-signed item, verify that its digest is correctly included in the
    /// MSO, under the digest algorithm the MSO declares. The comparison is constant-time.
    fn verify_attr_digest(
        &self,
        namespace: &NameSpace,
        item: &crate::iso::mdocs::IssuerSignedItemBytes,
    ) -> Result<(), Error> {
        let digest_id = item.0.digest_id;
        let expected = self
            .value_digests
            .0
            .get(namespace)
            .ok_or_else(|| VerificationError::MissingNamespace(namespace.clone()))?
            .0
            .get(&digest_id)
            .ok_or(VerificationError::MissingDigestId(digest_id))?;

        let computed = cbor_digest(item, self.digest_algorithm)?;
        ring::constant_time::verify_slices_are_equal(expected, &computed).map_err(|_| {
            VerificationError::DigestMismatch {
                namespace: namespace.clone(),
                element: item.0.element_identifier.clone(),
            }
        })?;
        Ok(())
    }
}

/// Verify the issuer-signed half of a document on its own, without device authentication.
/// Used by holders accepting an issued document and by verifiers of intermediate states.
impl IssuerSigned {
    pub fn verify(
        &self,
        validity: ValidityRequirement,
        time: &impl Generator<DateTime<Utc>>,
        trust_list: &TrustList,
        trust_config: &TrustConfig,
    ) -> Result<(MobileSecurityObject, Certificate), Error> {
        let (TaggedBytes(mso), certificate) =
            self.issuer_auth
                .verify_against_trust_anchors(CertificateUsage::Mdl, time, trust_list, trust_config)?;

        mso.validity_info
            .verify_is_valid_at(time.generate(), validity)
            .map_err(VerificationError::from)?;

        for (namespace, items) in self.name_spaces.iter().flatten() {
            for item in &items.0 {
                mso.verify_attr_digest(namespace, item)?;
            }
        }

        Ok((mso, certificate))
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Add;

    use chrono::Duration;
    use rstest::rstest;

    use super::*;

    fn new_validity_info(add_from_days: i64, add_until_days: i64) -> ValidityInfo {
        let now = Utc::now();
        ValidityInfo {
            signed: now.into(),
            valid_from: now.add(Duration::days(add_from_days)).into(),
            valid_until: now.add(Duration::days(add_until_days)).into(),
            expected_update: None,
        }
    }

    #[test]
    fn validity_info() {
        let now = Utc::now();

        let validity = new_validity_info(-1, 1);
        validity.verify_is_valid_at(now, ValidityRequirement::Valid).unwrap();
        validity
            .verify_is_valid_at(now, ValidityRequirement::AllowNotYetValid)
            .unwrap();

        let validity = new_validity_info(-2, -1);
        assert!(matches!(
            validity.verify_is_valid_at(now, ValidityRequirement::Valid),
            Err(ValidityError::Expired(_))
        ));
        assert!(matches!(
            validity.verify_is_valid_at(now, ValidityRequirement::AllowNotYetValid),
            Err(ValidityError::Expired(_))
        ));

        let validity = new_validity_info(1, 2);
        assert!(matches!(
            validity.verify_is_valid_at(now, ValidityRequirement::Valid),
            Err(ValidityError::NotYetValid(_))
        ));
        validity
            .verify_is_valid_at(now, ValidityRequirement::AllowNotYetValid)
            .unwrap();
    }

    #[rstest]
    #[case(0, true)]
    #[case(10, false)]
    fn device_response_status_check(#[case] status: u64, #[case] expected_valid: bool) {
        let response = DeviceResponse {
            version: crate::iso::disclosure::DeviceResponseVersion::V1_0,
            documents: None,
            document_errors: None,
            status,
        };

        let verifier = Verifier::new(TrustList::new());
        let transcript = test_transcript();
        let result = verifier.verify(&response, &transcript, None, &crate::utils::time::TimeGenerator);

        // No documents is always an error; a non-zero status must add a second one.
        assert!(!result.valid);
        assert_eq!(result.errors.len(), if expected_valid { 1 } else { 2 });
    }

    fn test_transcript() -> SessionTranscript {
        let (engagement, _) = crate::iso::engagement::Engagement::new_device_engagement(None, vec![]).unwrap();
        let reader_key = SigningKey::random(&mut rand_core::OsRng);
        let reader_cose_key: crate::utils::cose::CoseKey = reader_key.verifying_key().try_into().unwrap();
        SessionTranscript::new(&engagement, &reader_cose_key, crate::iso::engagement::Handover::Qr)
    }
}
