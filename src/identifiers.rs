//! Identifiers for attributes across documents, used to match requests against responses.

use std::fmt::Display;

use indexmap::IndexSet;

use crate::iso::{device_retrieval::DeviceRequest, device_retrieval::ItemsRequest, disclosure::Document};

/// Globally unique identifier of an attribute: document type, namespace and element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeIdentifier {
    pub doc_type: String,
    pub namespace: String,
    pub attribute: String,
}

impl Display for AttributeIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.doc_type, self.namespace, self.attribute)
    }
}

/// Anything that contains a set of attributes, identified by [`AttributeIdentifier`].
pub trait AttributeIdentifierHolder {
    fn attribute_identifiers(&self) -> IndexSet<AttributeIdentifier>;

    /// The identifiers in `other` that this holder does not contain.
    fn missing_attributes(&self, other: &impl AttributeIdentifierHolder) -> Vec<AttributeIdentifier> {
        let own = self.attribute_identifiers();
        other
            .attribute_identifiers()
            .into_iter()
            .filter(|identifier| !own.contains(identifier))
            .collect()
    }
}

impl AttributeIdentifierHolder for ItemsRequest {
    fn attribute_identifiers(&self) -> IndexSet<AttributeIdentifier> {
        self.name_spaces
            .iter()
            .flat_map(|(namespace, attributes)| {
                attributes.keys().map(|attribute| AttributeIdentifier {
                    doc_type: self.doc_type.clone(),
                    namespace: namespace.clone(),
                    attribute: attribute.clone(),
                })
            })
            .collect()
    }
}

impl AttributeIdentifierHolder for DeviceRequest {
    fn attribute_identifiers(&self) -> IndexSet<AttributeIdentifier> {
        self.doc_requests
            .iter()
            .flat_map(|doc_request| doc_request.items_request.0.attribute_identifiers())
            .collect()
    }
}

impl AttributeIdentifierHolder for Document {
    fn attribute_identifiers(&self) -> IndexSet<AttributeIdentifier> {
        self.issuer_signed
            .name_spaces
            .iter()
            .flatten()
            .flat_map(|(namespace, attributes)| {
                attributes.0.iter().map(|item| AttributeIdentifier {
                    doc_type: self.doc_type.clone(),
                    namespace: namespace.clone(),
                    attribute: item.0.element_identifier.clone(),
                })
            })
            .collect()
    }
}
