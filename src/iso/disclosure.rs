//! Data structures of the disclosure protocol: the device's response with its documents,
//! the issuer-signed and device-signed halves of a document, and the encrypted session
//! messages.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};
use serde_with::skip_serializing_none;

use crate::{
    iso::{
        engagement::DeviceAuthenticationBytes,
        mdocs::{DataElementIdentifier, DataElementValue, DocType, IssuerAuth, IssuerNameSpaces, NameSpace},
    },
    utils::{cose::MdocCose, serialization::TaggedBytes},
};

/// The holder's response to a [`DeviceRequest`](super::device_retrieval::DeviceRequest):
/// the disclosed documents, or per-document errors.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub version: DeviceResponseVersion,
    pub documents: Option<Vec<Document>>,
    pub document_errors: Option<Vec<DocumentError>>,
    pub status: u64,
}

impl DeviceResponse {
    pub fn new(documents: Vec<Document>) -> Self {
        DeviceResponse {
            version: DeviceResponseVersion::V1_0,
            documents: Some(documents),
            document_errors: None,
            status: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DeviceResponseVersion {
    #[serde(rename = "1.0")]
    V1_0,
}

pub type DocumentError = IndexMap<DocType, ErrorCode>;

/// Per-element error codes.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ErrorCode {
    General = 0,
    /// The requested element is not present in the document.
    NotAvailable = 10,
    /// The holder's policy does not release the requested element.
    NotReleasable = 11,
}

pub type ErrorItems = IndexMap<DataElementIdentifier, ErrorCode>;
pub type Errors = IndexMap<NameSpace, ErrorItems>;

/// A disclosed document: the issuer-signed items that survived filtering, the device's
/// proof of possession, and error codes for requested elements that were not disclosed.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub doc_type: DocType,
    pub issuer_signed: IssuerSigned,
    pub device_signed: Option<DeviceSigned>,
    pub errors: Option<Errors>,
}

/// The issuer-signed half of a document. Disclosure projects `name_spaces` while
/// `issuer_auth` is shared unmodified, which is what keeps the issuer signature valid on a
/// filtered document.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSigned {
    pub name_spaces: Option<IssuerNameSpaces>,
    pub issuer_auth: IssuerAuth,
}

/// The device-signed half of a document: self-asserted namespaces (normally empty) and the
/// device authentication over them.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSigned {
    pub name_spaces: DeviceNameSpacesBytes,
    pub device_auth: DeviceAuth,
}

pub type DeviceNameSpaces = IndexMap<NameSpace, IndexMap<DataElementIdentifier, DataElementValue>>;
pub type DeviceNameSpacesBytes = TaggedBytes<DeviceNameSpaces>;

/// Device authentication: a signature with the device key bound in the MSO, or a MAC with
/// the session-derived key. Exactly one of the two; the enum makes carrying both
/// unrepresentable.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub enum DeviceAuth {
    DeviceSignature(DeviceSignature),
    DeviceMac(DeviceMac),
}

pub type DeviceSignature = MdocCose<coset::CoseSign1, DeviceAuthenticationBytes<'static>>;
pub type DeviceMac = MdocCose<coset::CoseMac0, DeviceAuthenticationBytes<'static>>;

/// First message of an encrypted session: the reader's ephemeral key and the first
/// ciphertext.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionEstablishment {
    pub e_reader_key: super::engagement::ESenderKeyBytes,
    pub data: ByteBuf,
}

/// An encrypted session message, or a status signal, or both.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionData {
    pub data: Option<ByteBuf>,
    pub status: Option<SessionStatus>,
}

#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SessionStatus {
    DecryptionError = 10,
    DecodingError = 11,
    Terminated = 20,
}

impl SessionData {
    pub fn new_termination() -> Self {
        SessionData {
            data: None,
            status: Some(SessionStatus::Terminated),
        }
    }

    pub fn new_status(status: SessionStatus) -> Self {
        SessionData {
            data: None,
            status: Some(status),
        }
    }
}
