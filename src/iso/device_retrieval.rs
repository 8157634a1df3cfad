//! Data structures of the reader's request: which elements of which document types it
//! wants, and the optional reader authentication over the request.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{
    iso::{
        engagement::SessionTranscript,
        mdocs::{DataElementIdentifier, DataElementValue, DocType, NameSpace},
    },
    trust::ReaderTrustList,
    utils::{
        cose::{ClonePayload, CoseError, MdocCose},
        keys::KeyPair,
        serialization::{CborSeq, KeyedCborFields, ReaderAuthenticationString, RequiredValue, TaggedBytes},
        x509::Certificate,
    },
};

#[derive(thiserror::Error, Debug)]
pub enum ReaderAuthError {
    #[error("reader authentication missing from request")]
    Missing,
    #[error("reader not trusted: {0}")]
    Untrusted(#[from] crate::utils::x509::CertificateError),
    #[error(transparent)]
    Cose(#[from] CoseError),
}

/// The reader's request: one [`ItemsRequest`] per document type.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub version: DeviceRequestVersion,
    pub doc_requests: Vec<DocRequest>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequestVersion {
    #[serde(rename = "1.0")]
    V1_0,
}

impl DeviceRequest {
    pub fn new(items_requests: Vec<ItemsRequest>) -> Self {
        DeviceRequest {
            version: DeviceRequestVersion::V1_0,
            doc_requests: items_requests
                .into_iter()
                .map(|items_request| DocRequest {
                    items_request: items_request.into(),
                    reader_auth: None,
                })
                .collect(),
        }
    }

    /// Build a request whose [`DocRequest`]s carry reader authentication over the given
    /// session transcript.
    pub fn new_signed(
        items_requests: Vec<ItemsRequest>,
        session_transcript: &SessionTranscript,
        key_pair: &KeyPair,
    ) -> Result<Self, CoseError> {
        let doc_requests = items_requests
            .into_iter()
            .map(|items_request| DocRequest::new_signed(items_request, session_transcript, key_pair))
            .collect::<Result<_, _>>()?;
        Ok(DeviceRequest {
            version: DeviceRequestVersion::V1_0,
            doc_requests,
        })
    }
}

/// Request for elements of a single document type, with the optional reader signature.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DocRequest {
    pub items_request: ItemsRequestBytes,
    pub reader_auth: Option<ReaderAuth>,
}

impl DocRequest {
    pub fn new_signed(
        items_request: ItemsRequest,
        session_transcript: &SessionTranscript,
        key_pair: &KeyPair,
    ) -> Result<Self, CoseError> {
        let items_request: ItemsRequestBytes = items_request.into();
        let reader_auth = ReaderAuthenticationKeyed {
            reader_auth_string: RequiredValue::default(),
            session_transcript: Cow::Borrowed(session_transcript),
            items_request_bytes: Cow::Borrowed(&items_request),
        };

        let cose = MdocCose::sign(
            &TaggedBytes(CborSeq(reader_auth)),
            key_pair.signing_key(),
            key_pair.certificate_chain(),
            true,
        )?;

        Ok(DocRequest {
            items_request,
            reader_auth: Some(cose),
        })
    }

    /// Verify the reader authentication against the holder's reader trust list,
    /// reconstructing the signed payload from the session transcript. Returns the verified
    /// request, restricted to the namespaces the reader is authorized to request, and the
    /// reader certificate.
    pub fn verify_reader_auth(
        &self,
        session_transcript: &SessionTranscript,
        reader_trust: &ReaderTrustList,
        time: DateTime<Utc>,
    ) -> Result<(ItemsRequest, Certificate), ReaderAuthError> {
        let reader_auth = self.reader_auth.as_ref().ok_or(ReaderAuthError::Missing)?;

        let chain = reader_auth.certificate_chain()?;
        reader_trust.verify_chain(&chain, time)?;

        let reader_cert = chain.into_iter().next().ok_or(CoseError::MissingCertificateChain)?;
        let key = reader_cert.public_key()?;

        let payload = ReaderAuthenticationKeyed {
            reader_auth_string: RequiredValue::default(),
            session_transcript: Cow::Borrowed(session_transcript),
            items_request_bytes: Cow::Borrowed(&self.items_request),
        };
        let payload_bytes = crate::utils::serialization::cbor_serialize(&TaggedBytes(CborSeq(payload)))
            .map_err(CoseError::from)?;

        reader_auth.clone_with_payload(payload_bytes).verify(&key)?;

        let mut items_request = self.items_request.0.clone();
        if let Some(authorized) = reader_trust.authorized_namespaces(&reader_cert)? {
            items_request.name_spaces.retain(|namespace, elements| {
                let Some(authorized_elements) = authorized.get(namespace) else {
                    return false;
                };
                elements.retain(|element, _| authorized_elements.contains(element));
                !elements.is_empty()
            });
        }

        Ok((items_request, reader_cert))
    }
}

pub type ItemsRequestBytes = TaggedBytes<ItemsRequest>;

/// The elements requested of one document type. The boolean per element is the reader's
/// intent to retain the value after the transaction.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemsRequest {
    pub doc_type: DocType,
    pub name_spaces: IndexMap<NameSpace, IndexMap<DataElementIdentifier, bool>>,
    pub request_info: Option<IndexMap<String, DataElementValue>>,
}

impl ItemsRequest {
    /// Request the given elements of one namespace, without intent to retain.
    pub fn new(
        doc_type: impl Into<DocType>,
        name_space: impl Into<NameSpace>,
        elements: impl IntoIterator<Item = impl Into<DataElementIdentifier>>,
    ) -> Self {
        ItemsRequest {
            doc_type: doc_type.into(),
            name_spaces: IndexMap::from([(
                name_space.into(),
                elements.into_iter().map(|element| (element.into(), false)).collect(),
            )]),
            request_info: None,
        }
    }

    /// The requested elements as a plain `namespace → [element]` map.
    pub fn requested_elements(&self) -> IndexMap<NameSpace, Vec<DataElementIdentifier>> {
        self.name_spaces
            .iter()
            .map(|(namespace, elements)| (namespace.clone(), elements.keys().cloned().collect()))
            .collect()
    }
}

/// The structure over which reader authentication is computed:
/// `["ReaderAuthentication", session_transcript, items_request_bytes]`.
#[derive(Serialize, Debug, Clone)]
pub struct ReaderAuthenticationKeyed<'a> {
    pub reader_auth_string: RequiredValue<ReaderAuthenticationString>,
    pub session_transcript: Cow<'a, SessionTranscript>,
    pub items_request_bytes: Cow<'a, ItemsRequestBytes>,
}

impl KeyedCborFields for ReaderAuthenticationKeyed<'_> {
    const FIELD_NAMES: &'static [&'static str] =
        &["reader_auth_string", "session_transcript", "items_request_bytes"];
}

pub type ReaderAuthentication<'a> = CborSeq<ReaderAuthenticationKeyed<'a>>;
pub type ReaderAuthenticationBytes<'a> = TaggedBytes<ReaderAuthentication<'a>>;
pub type ReaderAuth = MdocCose<coset::CoseSign1, ReaderAuthenticationBytes<'static>>;
