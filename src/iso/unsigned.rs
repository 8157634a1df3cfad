//! A not-yet-signed document: the plain attributes that the issuer turns into
//! issuer-signed items.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::iso::mdocs::{Attributes, DataElementIdentifier, DataElementValue, DocType, NameSpace, Tdate};

/// An attribute name and value.
///
/// See also [`IssuerSignedItem`](super::mdocs::IssuerSignedItem), which additionally
/// contains the attribute's `random` and `digestID`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: DataElementIdentifier,
    pub value: DataElementValue,
}

/// The input to issuance: a document type, a validity window and the attributes per
/// namespace, before salts and digest IDs are assigned.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedDocument {
    pub doc_type: DocType,
    pub valid_from: Tdate,
    pub valid_until: Tdate,
    pub attributes: IndexMap<NameSpace, Vec<Entry>>,
}

impl From<&Attributes> for Vec<Entry> {
    fn from(attrs: &Attributes) -> Self {
        attrs
            .0
            .iter()
            .map(|issuer_signed| Entry {
                name: issuer_signed.0.element_identifier.clone(),
                value: issuer_signed.0.element_value.clone(),
            })
            .collect()
    }
}
