//! Issuing documents: turning an attribute record into issuer-signed items, building the
//! MSO digest table over them, and signing it with the Document Signer key.

use chrono::Utc;
use indexmap::IndexMap;
use serde_bytes::ByteBuf;
use tracing::debug;

use crate::{
    iso::{
        disclosure::{Document, IssuerSigned},
        mdl::MdlAttributes,
        mdocs::{
            DeviceKeyInfo, DigestAlgorithm, DigestId, DigestIds, IssuerAuth, IssuerNameSpaces, IssuerSignedItem,
            MobileSecurityObject, MobileSecurityObjectVersion, NameSpace, StatusClaim, ValidityInfo, ValueDigests,
        },
        unsigned::{Entry, UnsignedDocument},
    },
    utils::{
        cose::{CoseError, CoseKey, MdocCose},
        crypto::{cbor_digest, random_bytes},
        keys::{KeyError, KeyPair},
        serialization::{CborError, TaggedBytes},
        x509::CertificateUsage,
    },
};

/// Byte length of the random salt in each issuer-signed item.
const ATTRIBUTE_RANDOM_LENGTH: usize = 32;

#[derive(thiserror::Error, Debug)]
pub enum IssuerError {
    #[error("signing key does not match the Document Signer certificate")]
    KeyMismatch,
    #[error("Document Signer certificate lacks the mdoc authentication extended key usage")]
    MissingUsage,
    #[error("duplicate digest ID {digest_id} in namespace {namespace}")]
    DuplicateDigestId { namespace: NameSpace, digest_id: DigestId },
    #[error("invalid validity window: signed, valid_from and valid_until must be non-decreasing")]
    InvalidValidity,
    #[error("document contains no attributes")]
    NoAttributes,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Cose(#[from] CoseError),
    #[error(transparent)]
    Cbor(#[from] CborError),
}

/// The output of issuance: the document as it will be stored by the holder, and the MSO
/// envelope separately for inspection.
#[derive(Debug, Clone)]
pub struct IssuedDocument {
    pub document: Document,
    pub issuer_auth: IssuerAuth,
}

/// Issues documents with a Document Signer key pair.
#[derive(Debug)]
pub struct Issuer {
    key_pair: KeyPair,
    digest_algorithm: DigestAlgorithm,
}

impl Issuer {
    /// Construct an issuer. The key pair's leaf certificate must be a Document Signer
    /// certificate matching the signing key.
    pub fn new(key_pair: KeyPair) -> Result<Self, IssuerError> {
        if !key_pair
            .certificate()
            .has_extended_key_usage(CertificateUsage::Mdl)
            .map_err(KeyError::Certificate)?
        {
            return Err(IssuerError::MissingUsage);
        }

        Ok(Issuer {
            key_pair,
            digest_algorithm: DigestAlgorithm::Sha256,
        })
    }

    pub fn with_digest_algorithm(mut self, digest_algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = digest_algorithm;
        self
    }

    /// Issue a document over the given attributes, bound to the holder's device key.
    pub fn issue(
        &self,
        unsigned: UnsignedDocument,
        device_key: CoseKey,
        status: Option<StatusClaim>,
    ) -> Result<IssuedDocument, IssuerError> {
        if unsigned.attributes.is_empty() || unsigned.attributes.values().all(Vec::is_empty) {
            return Err(IssuerError::NoAttributes);
        }

        let validity = ValidityInfo {
            signed: Utc::now().into(),
            valid_from: unsigned.valid_from,
            valid_until: unsigned.valid_until,
            expected_update: None,
        };
        validate_validity(&validity)?;

        let (name_spaces, value_digests) = self.digest_namespaces(&unsigned.attributes)?;

        let mso = MobileSecurityObject {
            version: MobileSecurityObjectVersion::V1_0,
            digest_algorithm: self.digest_algorithm,
            value_digests,
            device_key_info: DeviceKeyInfo::from(device_key),
            doc_type: unsigned.doc_type.clone(),
            validity_info: validity,
            status,
        };

        debug!("signing MSO for doc_type {}", unsigned.doc_type);
        let issuer_auth: IssuerAuth = MdocCose::sign(
            &TaggedBytes(mso),
            self.key_pair.signing_key(),
            self.key_pair.certificate_chain(),
            false,
        )?;

        let document = Document {
            doc_type: unsigned.doc_type,
            issuer_signed: IssuerSigned {
                name_spaces: Some(name_spaces),
                issuer_auth: issuer_auth.clone(),
            },
            device_signed: None,
            errors: None,
        };

        Ok(IssuedDocument { document, issuer_auth })
    }

    /// Issue an mDL document from the canonical attribute record, with the default
    /// one-year validity window.
    pub fn issue_mdl(&self, attributes: &MdlAttributes, device_key: CoseKey) -> Result<IssuedDocument, IssuerError> {
        self.issue(attributes.to_unsigned(None)?, device_key, None)
    }

    /// For each attribute: generate a fresh salt, assign the next free digest ID within
    /// its namespace, and insert the digest of the tag-24 wrapped item into the table.
    fn digest_namespaces(
        &self,
        attributes: &IndexMap<NameSpace, Vec<Entry>>,
    ) -> Result<(IssuerNameSpaces, ValueDigests), IssuerError> {
        let mut name_spaces = IssuerNameSpaces::new();
        let mut value_digests = ValueDigests(IndexMap::new());

        for (namespace, entries) in attributes {
            if entries.is_empty() {
                continue;
            }

            let mut items = Vec::with_capacity(entries.len());
            let mut digests = DigestIds(IndexMap::with_capacity(entries.len()));

            for (index, entry) in entries.iter().enumerate() {
                let digest_id = index as DigestId;
                let item = TaggedBytes(IssuerSignedItem {
                    digest_id,
                    random: ByteBuf::from(random_bytes(ATTRIBUTE_RANDOM_LENGTH)),
                    element_identifier: entry.name.clone(),
                    element_value: entry.value.clone(),
                });

                let digest = cbor_digest(&item, self.digest_algorithm)?;
                if digests.0.insert(digest_id, ByteBuf::from(digest)).is_some() {
                    return Err(IssuerError::DuplicateDigestId {
                        namespace: namespace.clone(),
                        digest_id,
                    });
                }
                items.push(item);
            }

            name_spaces.insert(namespace.clone(), items.into());
            value_digests.0.insert(namespace.clone(), digests);
        }

        Ok((name_spaces, value_digests))
    }
}

fn validate_validity(validity: &ValidityInfo) -> Result<(), IssuerError> {
    let signed: chrono::DateTime<Utc> = (&validity.signed).try_into().map_err(|_| IssuerError::InvalidValidity)?;
    let valid_from: chrono::DateTime<Utc> =
        (&validity.valid_from).try_into().map_err(|_| IssuerError::InvalidValidity)?;
    let valid_until: chrono::DateTime<Utc> =
        (&validity.valid_until).try_into().map_err(|_| IssuerError::InvalidValidity)?;

    // Issuing slightly before the validity start is fine; issuing after the end is not.
    if valid_from > valid_until || signed > valid_until {
        return Err(IssuerError::InvalidValidity);
    }
    Ok(())
}

/// Convenience constructor for tests and provisioning tools: a fresh Document Signer
/// under a fresh CA.
pub fn generate_issuer_key_pair(
    ca_common_name: &str,
    ds_common_name: &str,
) -> Result<(crate::utils::x509::Certificate, KeyPair), IssuerError> {
    let (ca, ca_key) = crate::utils::x509::Certificate::new_ca(ca_common_name).map_err(KeyError::Certificate)?;
    let (cert, key) = crate::utils::x509::Certificate::new(&ca, &ca_key, ds_common_name, CertificateUsage::Mdl)
        .map_err(KeyError::Certificate)?;
    let key_pair = KeyPair::new(key, cert)?;
    Ok((ca, key_pair))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ciborium::value::Value;
    use p256::ecdsa::SigningKey;
    use rand_core::OsRng;

    use crate::{
        iso::mdocs::Tdate,
        utils::serialization::cbor_serialize,
    };

    use super::*;

    fn example_unsigned() -> UnsignedDocument {
        UnsignedDocument {
            doc_type: "example_doctype".to_string(),
            valid_from: Utc::now().into(),
            valid_until: (Utc::now() + chrono::Duration::days(365)).into(),
            attributes: IndexMap::from([(
                "example_namespace".to_string(),
                vec![
                    Entry {
                        name: "first_name".to_string(),
                        value: Value::Text("John".to_string()),
                    },
                    Entry {
                        name: "family_name".to_string(),
                        value: Value::Text("Doe".to_string()),
                    },
                ],
            )]),
        }
    }

    fn example_issuer() -> Issuer {
        let (_, key_pair) = generate_issuer_key_pair("ca.issuer.example.com", "cert.issuer.example.com").unwrap();
        Issuer::new(key_pair).unwrap()
    }

    fn example_device_key() -> CoseKey {
        let key = SigningKey::random(&mut OsRng);
        key.verifying_key().try_into().unwrap()
    }

    #[test]
    fn issued_document_binds_digests() {
        let issuer = example_issuer();
        let issued = issuer.issue(example_unsigned(), example_device_key(), None).unwrap();

        let mso: TaggedBytes<MobileSecurityObject> = issued.issuer_auth.dangerous_parse_unverified().unwrap();
        let mso = mso.0;

        assert_eq!(mso.doc_type, "example_doctype");
        assert_eq!(mso.version, MobileSecurityObjectVersion::V1_0);

        // Every item's digest is in the table under its namespace and digest ID.
        let name_spaces = issued.document.issuer_signed.name_spaces.as_ref().unwrap();
        for (namespace, attributes) in name_spaces {
            let digests = mso.value_digests.0.get(namespace).unwrap();
            for item in &attributes.0 {
                let expected = cbor_digest(item, mso.digest_algorithm).unwrap();
                assert_eq!(digests.0[&item.0.digest_id].as_ref(), expected.as_slice());
            }
        }
    }

    #[test]
    fn digest_ids_are_unique_and_salts_fresh() {
        let issuer = example_issuer();
        let issued = issuer.issue(example_unsigned(), example_device_key(), None).unwrap();

        let name_spaces = issued.document.issuer_signed.name_spaces.unwrap();
        let attributes = &name_spaces["example_namespace"];

        let ids: Vec<_> = attributes.0.iter().map(|item| item.0.digest_id).collect();
        assert_eq!(ids, vec![0, 1]);

        let randoms: Vec<_> = attributes.0.iter().map(|item| item.0.random.clone()).collect();
        assert_eq!(randoms[0].len(), 32);
        assert_ne!(randoms[0], randoms[1]);
    }

    #[test]
    fn mutating_an_element_breaks_its_digest() {
        let issuer = example_issuer();
        let issued = issuer.issue(example_unsigned(), example_device_key(), None).unwrap();

        let mso: TaggedBytes<MobileSecurityObject> = issued.issuer_auth.dangerous_parse_unverified().unwrap();
        let mso = mso.0;

        let mut name_spaces = issued.document.issuer_signed.name_spaces.unwrap();
        let item = &mut name_spaces.get_mut("example_namespace").unwrap().0[0];
        item.0.element_value = Value::Text("Mallory".to_string());

        let digest = cbor_digest(&item, mso.digest_algorithm).unwrap();
        assert_ne!(
            mso.value_digests.0["example_namespace"].0[&item.0.digest_id].as_ref(),
            digest.as_slice()
        );
    }

    #[test]
    fn issuance_rejects_bad_validity() {
        let issuer = example_issuer();
        let mut unsigned = example_unsigned();
        unsigned.valid_until = (Utc::now() - chrono::Duration::days(1)).into();
        unsigned.valid_from = Utc::now().into();

        assert_matches!(
            issuer.issue(unsigned, example_device_key(), None),
            Err(IssuerError::InvalidValidity)
        );
    }

    #[test]
    fn issuance_rejects_empty_documents() {
        let issuer = example_issuer();
        let mut unsigned = example_unsigned();
        unsigned.attributes = IndexMap::new();

        assert_matches!(
            issuer.issue(unsigned, example_device_key(), None),
            Err(IssuerError::NoAttributes)
        );
    }

    #[test]
    fn issuer_requires_document_signer_certificate() {
        // A reader auth certificate is not acceptable as a Document Signer.
        let (ca, ca_key) = crate::utils::x509::Certificate::new_ca("ca.example.com").unwrap();
        let (cert, key) =
            crate::utils::x509::Certificate::new(&ca, &ca_key, "reader.example.com", CertificateUsage::ReaderAuth)
                .unwrap();
        let key_pair = KeyPair::new(key, cert).unwrap();

        assert_matches!(Issuer::new(key_pair), Err(IssuerError::MissingUsage));
    }

    #[test]
    fn tdate_in_validity_is_parseable() {
        let validity = ValidityInfo {
            signed: Tdate::now(),
            valid_from: Tdate::now(),
            valid_until: (Utc::now() + chrono::Duration::days(1)).into(),
            expected_update: None,
        };
        validate_validity(&validity).unwrap();

        // Wire form uses camelCase keys.
        let bytes = cbor_serialize(&validity).unwrap();
        let value: Value = ciborium::de::from_reader(bytes.as_slice()).unwrap();
        let Value::Map(entries) = value else {
            panic!("expected map");
        };
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_text().unwrap()).collect();
        assert_eq!(keys, ["signed", "validFrom", "validUntil"]);
    }
}
