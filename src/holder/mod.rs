//! Holder software: the stored credential and selective disclosure of its attributes.

mod disclosure;
mod policy;

pub use disclosure::DeviceAuthMode;
pub use policy::{DisclosurePolicy, PolicyDecision};

use p256::ecdsa::VerifyingKey;

use crate::{
    identifiers::AttributeIdentifier,
    iso::{
        disclosure::IssuerSigned,
        mdocs::{DocType, MobileSecurityObject},
    },
    utils::{cose::CoseError, serialization::TaggedBytes},
};

#[derive(thiserror::Error, Debug)]
pub enum HolderError {
    #[error("requested element not available: {0}")]
    ElementNotAvailable(AttributeIdentifier),
    #[error("requested element not releasable under the disclosure policy: {0}")]
    ElementNotReleasable(AttributeIdentifier),
    #[error("request is for doc type {requested}, mdoc contains {actual}")]
    DocTypeMismatch { requested: DocType, actual: DocType },
    #[error(transparent)]
    Cose(#[from] CoseError),
    #[error(transparent)]
    Cbor(#[from] crate::utils::serialization::CborError),
    #[error(transparent)]
    Crypto(#[from] crate::utils::crypto::CryptoError),
}

/// A stored credential: the issuer-signed half of a document. The private key bound in the
/// MSO lives with the caller (ideally in secure hardware); the holder only needs it at
/// disclosure time.
#[derive(Debug, Clone)]
pub struct Mdoc {
    pub doc_type: DocType,
    pub issuer_signed: IssuerSigned,
}

impl Mdoc {
    pub fn new(doc_type: DocType, issuer_signed: IssuerSigned) -> Self {
        Mdoc { doc_type, issuer_signed }
    }

    /// The MSO, parsed but not verified. The holder received the document over an
    /// authenticated issuance channel; verifying parties must use the verifier instead.
    pub fn mso(&self) -> Result<MobileSecurityObject, HolderError> {
        let TaggedBytes(mso) = self.issuer_signed.issuer_auth.dangerous_parse_unverified()?;
        Ok(mso)
    }

    /// The device public key bound into the MSO by the issuer.
    pub fn public_key(&self) -> Result<VerifyingKey, HolderError> {
        let key = (&self.mso()?.device_key_info.device_key).try_into()?;
        Ok(key)
    }
}

impl From<crate::issuer::IssuedDocument> for Mdoc {
    fn from(issued: crate::issuer::IssuedDocument) -> Self {
        Mdoc {
            doc_type: issued.document.doc_type.clone(),
            issuer_signed: issued.document.issuer_signed,
        }
    }
}
