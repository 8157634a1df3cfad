//! Disclosure: projecting the issuer-signed items of a stored [`Mdoc`] down to the
//! elements a reader requested, and proving possession of the device key over the session
//! transcript.

use indexmap::IndexMap;
use p256::ecdsa::{SigningKey, VerifyingKey};
use tracing::debug;

use crate::{
    holder::{DisclosurePolicy, HolderError, Mdoc, PolicyDecision},
    iso::{
        device_retrieval::{DeviceRequest, ItemsRequest},
        disclosure::{
            DeviceAuth, DeviceNameSpacesBytes, DeviceResponse, DeviceSigned, Document, ErrorCode, Errors,
            IssuerSigned,
        },
        engagement::{DeviceAuthenticationKeyed, SessionTranscript},
        mdocs::{DataElementIdentifier, NameSpace},
    },
    utils::{
        cose::MdocCose,
        crypto::dh_hmac_key,
        serialization::{CborSeq, TaggedBytes},
    },
};

/// How the holder proves possession of the device key: by signature, or by a MAC keyed to
/// the reader's ephemeral key. The two are mutually exclusive.
#[derive(Clone, Copy)]
pub enum DeviceAuthMode<'a> {
    /// Sign the device authentication structure with the device private key.
    Signature(&'a SigningKey),
    /// MAC the device authentication structure with a key derived from ECDH between the
    /// device private key and the reader's ephemeral public key.
    Mac {
        device_key: &'a SigningKey,
        e_reader_key: &'a VerifyingKey,
    },
}

impl IssuerSigned {
    /// Project this `IssuerSigned` onto the requested elements. The issuer authentication
    /// is shared unchanged, so the remaining items still verify against it. Requested
    /// elements that are absent are reported with error code 10, elements the policy
    /// refuses with code 11; namespaces left empty after filtering are removed.
    pub fn filter(
        &self,
        requested: &IndexMap<NameSpace, Vec<DataElementIdentifier>>,
        policy: &DisclosurePolicy,
    ) -> (IssuerSigned, Option<Errors>) {
        let mut errors = Errors::new();
        let mut name_spaces = IndexMap::new();

        for (namespace, elements) in requested {
            let present = self.name_spaces.as_ref().and_then(|ns| ns.get(namespace));

            let mut disclosed = Vec::new();
            for element in elements {
                match policy.decision(namespace, element) {
                    PolicyDecision::Never => {
                        debug!("policy blocks {namespace}/{element}");
                        errors
                            .entry(namespace.clone())
                            .or_default()
                            .insert(element.clone(), ErrorCode::NotReleasable);
                        continue;
                    }
                    PolicyDecision::Always | PolicyDecision::RequiresConfirmation => {}
                }

                match present.and_then(|attributes| {
                    attributes.0.iter().find(|item| &item.0.element_identifier == element)
                }) {
                    Some(item) => disclosed.push(item.clone()),
                    None => {
                        errors
                            .entry(namespace.clone())
                            .or_default()
                            .insert(element.clone(), ErrorCode::NotAvailable);
                    }
                }
            }

            if !disclosed.is_empty() {
                name_spaces.insert(namespace.clone(), disclosed.into());
            }
        }

        let filtered = IssuerSigned {
            name_spaces: (!name_spaces.is_empty()).then_some(name_spaces),
            issuer_auth: self.issuer_auth.clone(),
        };
        (filtered, (!errors.is_empty()).then_some(errors))
    }
}

impl DeviceSigned {
    /// Produce device authentication by signing
    /// `["DeviceAuthentication", transcript, doc_type, device_namespaces]` with the device
    /// private key, as a detached payload.
    pub fn new_signature(
        device_key: &SigningKey,
        doc_type: &str,
        session_transcript: &SessionTranscript,
    ) -> Result<DeviceSigned, HolderError> {
        let name_spaces = DeviceNameSpacesBytes::default();
        let auth = DeviceAuthenticationKeyed::new(doc_type, session_transcript);
        let cose = MdocCose::sign(&TaggedBytes(CborSeq(auth)), device_key, &[], true)?;

        Ok(DeviceSigned {
            name_spaces,
            device_auth: DeviceAuth::DeviceSignature(cose),
        })
    }

    /// Produce device authentication as a COSE_Mac0 under the `EMacKey` derived from ECDH
    /// between the device key and the reader's ephemeral key, salted with the transcript.
    pub fn new_mac(
        device_key: &SigningKey,
        e_reader_key: &VerifyingKey,
        doc_type: &str,
        session_transcript: &SessionTranscript,
    ) -> Result<DeviceSigned, HolderError> {
        let transcript_bytes = session_transcript.bytes()?;
        let mac_key = dh_hmac_key(device_key, e_reader_key, &transcript_bytes, "EMacKey", 32)?;

        let name_spaces = DeviceNameSpacesBytes::default();
        let auth = DeviceAuthenticationKeyed::new(doc_type, session_transcript);
        let mac = MdocCose::generate(&TaggedBytes(CborSeq(auth)), &mac_key, true)?;

        Ok(DeviceSigned {
            name_spaces,
            device_auth: DeviceAuth::DeviceMac(mac),
        })
    }
}

impl Mdoc {
    /// Disclose the requested elements of this mdoc: filter the issuer-signed items, apply
    /// the policy, and attach device authentication over the session transcript.
    pub fn disclose(
        &self,
        request: &ItemsRequest,
        policy: &DisclosurePolicy,
        session_transcript: &SessionTranscript,
        auth: DeviceAuthMode,
    ) -> Result<Document, HolderError> {
        if request.doc_type != self.doc_type {
            return Err(HolderError::DocTypeMismatch {
                requested: request.doc_type.clone(),
                actual: self.doc_type.clone(),
            });
        }

        let (issuer_signed, errors) = self.issuer_signed.filter(&request.requested_elements(), policy);

        let device_signed = match auth {
            DeviceAuthMode::Signature(device_key) => {
                DeviceSigned::new_signature(device_key, &self.doc_type, session_transcript)?
            }
            DeviceAuthMode::Mac {
                device_key,
                e_reader_key,
            } => DeviceSigned::new_mac(device_key, e_reader_key, &self.doc_type, session_transcript)?,
        };

        Ok(Document {
            doc_type: self.doc_type.clone(),
            issuer_signed,
            device_signed: Some(device_signed),
            errors,
        })
    }

    /// Answer a full [`DeviceRequest`], disclosing from this mdoc for every matching doc
    /// request.
    pub fn disclose_for_request(
        &self,
        request: &DeviceRequest,
        policy: &DisclosurePolicy,
        session_transcript: &SessionTranscript,
        auth: DeviceAuthMode,
    ) -> Result<DeviceResponse, HolderError> {
        let mut documents = Vec::new();
        for doc_request in &request.doc_requests {
            let items_request = &doc_request.items_request.0;
            if items_request.doc_type != self.doc_type {
                continue;
            }
            documents.push(self.disclose(items_request, policy, session_transcript, auth)?);
        }

        Ok(DeviceResponse::new(documents))
    }
}

#[cfg(test)]
mod tests {
    use ciborium::value::Value;
    use p256::ecdsa::SigningKey;
    use rand_core::OsRng;

    use crate::{
        issuer::{generate_issuer_key_pair, Issuer},
        iso::{
            engagement::{Engagement, Handover},
            unsigned::{Entry, UnsignedDocument},
        },
        utils::{
            cose::{ClonePayload, CoseKey},
            serialization::cbor_serialize,
        },
    };

    use super::*;

    const DOC_TYPE: &str = "example_doctype";
    const NAMESPACE: &str = "example_namespace";

    /// Check that a produced device signature verifies against the mdoc's own public key,
    /// reconstructing the authentication bytes the way a verifier would.
    fn verify_device_signature(
        document: &Document,
        public_key: &VerifyingKey,
        session_transcript: &SessionTranscript,
    ) -> bool {
        let auth_bytes = DeviceAuthenticationKeyed::encode(&document.doc_type, session_transcript).unwrap();
        match &document.device_signed.as_ref().unwrap().device_auth {
            DeviceAuth::DeviceSignature(signature) => signature
                .clone_with_payload(auth_bytes)
                .verify(&crate::utils::x509::CertPublicKey::P256(*public_key))
                .is_ok(),
            DeviceAuth::DeviceMac(_) => false,
        }
    }

    fn example_mdoc(device_key: &SigningKey) -> Mdoc {
        let (_, key_pair) = generate_issuer_key_pair("ca.example.com", "ds.example.com").unwrap();
        let issuer = Issuer::new(key_pair).unwrap();

        let entries = [
            ("family_name", "Smith"),
            ("given_name", "John"),
            ("portrait", ""),
        ];
        let mut attributes: Vec<Entry> = entries[..2]
            .iter()
            .map(|(name, value)| Entry {
                name: name.to_string(),
                value: Value::Text(value.to_string()),
            })
            .collect();
        attributes.push(Entry {
            name: "portrait".to_string(),
            value: Value::Bytes(vec![1, 2, 3]),
        });
        attributes.push(Entry {
            name: "age_over_18".to_string(),
            value: Value::Bool(true),
        });

        issuer
            .issue(
                UnsignedDocument {
                    doc_type: DOC_TYPE.to_string(),
                    valid_from: chrono::Utc::now().into(),
                    valid_until: (chrono::Utc::now() + chrono::Duration::days(365)).into(),
                    attributes: IndexMap::from([(NAMESPACE.to_string(), attributes)]),
                },
                device_key.verifying_key().try_into().unwrap(),
                None,
            )
            .unwrap()
            .into()
    }

    fn example_transcript() -> SessionTranscript {
        let (engagement, _) = Engagement::new_device_engagement(None, vec![]).unwrap();
        let reader_key = SigningKey::random(&mut OsRng);
        let reader_cose_key: CoseKey = reader_key.verifying_key().try_into().unwrap();
        SessionTranscript::new(&engagement, &reader_cose_key, Handover::Qr)
    }

    fn element_names(document: &Document) -> Vec<String> {
        document
            .issuer_signed
            .name_spaces
            .as_ref()
            .map(|ns| {
                ns[NAMESPACE]
                    .0
                    .iter()
                    .map(|item| item.0.element_identifier.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn filter_projects_requested_elements() {
        let device_key = SigningKey::random(&mut OsRng);
        let mdoc = example_mdoc(&device_key);
        let transcript = example_transcript();

        let request = ItemsRequest::new(DOC_TYPE, NAMESPACE, ["family_name", "age_over_18"]);
        let document = mdoc
            .disclose(
                &request,
                &DisclosurePolicy::default(),
                &transcript,
                DeviceAuthMode::Signature(&device_key),
            )
            .unwrap();

        assert_eq!(element_names(&document), vec!["family_name", "age_over_18"]);
        assert!(document.errors.is_none());

        // The issuer auth envelope is byte-identical to the stored one.
        assert_eq!(
            cbor_serialize(&document.issuer_signed.issuer_auth).unwrap(),
            cbor_serialize(&mdoc.issuer_signed.issuer_auth).unwrap(),
        );
    }

    #[test]
    fn missing_elements_get_error_code_10() {
        let device_key = SigningKey::random(&mut OsRng);
        let mdoc = example_mdoc(&device_key);
        let transcript = example_transcript();

        let request = ItemsRequest::new(DOC_TYPE, NAMESPACE, ["family_name", "nonexistent"]);
        let document = mdoc
            .disclose(
                &request,
                &DisclosurePolicy::default(),
                &transcript,
                DeviceAuthMode::Signature(&device_key),
            )
            .unwrap();

        assert_eq!(element_names(&document), vec!["family_name"]);
        let errors = document.errors.unwrap();
        assert_eq!(errors[NAMESPACE]["nonexistent"], ErrorCode::NotAvailable);
    }

    #[test]
    fn policy_blocked_elements_get_error_code_11() {
        let device_key = SigningKey::random(&mut OsRng);
        let mdoc = example_mdoc(&device_key);
        let transcript = example_transcript();

        let mut policy = DisclosurePolicy::default();
        policy.set_never(NAMESPACE, "portrait");

        let request = ItemsRequest::new(DOC_TYPE, NAMESPACE, ["family_name", "portrait"]);
        let document = mdoc
            .disclose(&request, &policy, &transcript, DeviceAuthMode::Signature(&device_key))
            .unwrap();

        assert_eq!(element_names(&document), vec!["family_name"]);
        let errors = document.errors.unwrap();
        assert_eq!(errors[NAMESPACE]["portrait"], ErrorCode::NotReleasable);
    }

    #[test]
    fn fully_filtered_namespace_is_removed() {
        let device_key = SigningKey::random(&mut OsRng);
        let mdoc = example_mdoc(&device_key);

        let (filtered, errors) = mdoc.issuer_signed.filter(
            &IndexMap::from([(NAMESPACE.to_string(), vec!["nonexistent".to_string()])]),
            &DisclosurePolicy::default(),
        );

        assert!(filtered.name_spaces.is_none());
        assert!(errors.is_some());
    }

    #[test]
    fn device_signature_binds_to_transcript() {
        let device_key = SigningKey::random(&mut OsRng);
        let mdoc = example_mdoc(&device_key);
        let transcript = example_transcript();

        let request = ItemsRequest::new(DOC_TYPE, NAMESPACE, ["family_name"]);
        let document = mdoc
            .disclose(
                &request,
                &DisclosurePolicy::default(),
                &transcript,
                DeviceAuthMode::Signature(&device_key),
            )
            .unwrap();

        assert!(verify_device_signature(&document, device_key.verifying_key(), &transcript));

        // A different transcript must not verify.
        let other_transcript = example_transcript();
        assert!(!verify_device_signature(&document, device_key.verifying_key(), &other_transcript));
    }

    #[test]
    fn doc_type_mismatch_is_refused() {
        let device_key = SigningKey::random(&mut OsRng);
        let mdoc = example_mdoc(&device_key);
        let transcript = example_transcript();

        let request = ItemsRequest::new("other_doctype", NAMESPACE, ["family_name"]);
        let result = mdoc.disclose(
            &request,
            &DisclosurePolicy::default(),
            &transcript,
            DeviceAuthMode::Signature(&device_key),
        );
        assert!(matches!(result, Err(HolderError::DocTypeMismatch { .. })));
    }
}
