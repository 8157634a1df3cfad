//! Per-element disclosure policy: which attributes are released automatically, which are
//! never released, and which require the holder's confirmation first.

use std::collections::HashSet;

use crate::{
    identifiers::{AttributeIdentifier, AttributeIdentifierHolder},
    iso::{
        device_retrieval::ItemsRequest,
        mdl::{MDL_NAMESPACE},
        mdocs::{DataElementIdentifier, NameSpace},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Always,
    Never,
    RequiresConfirmation,
}

/// Three disjoint sets of `(namespace, element)` pairs. Elements in none of the sets
/// follow the default decision.
#[derive(Debug, Clone)]
pub struct DisclosurePolicy {
    always: HashSet<(NameSpace, DataElementIdentifier)>,
    never: HashSet<(NameSpace, DataElementIdentifier)>,
    requires_confirmation: HashSet<(NameSpace, DataElementIdentifier)>,
    default: PolicyDecision,
}

impl Default for DisclosurePolicy {
    /// An empty policy that releases everything.
    fn default() -> Self {
        DisclosurePolicy {
            always: HashSet::new(),
            never: HashSet::new(),
            requires_confirmation: HashSet::new(),
            default: PolicyDecision::Always,
        }
    }
}

impl DisclosurePolicy {
    pub fn new(default: PolicyDecision) -> Self {
        DisclosurePolicy {
            default,
            ..Default::default()
        }
    }

    /// The default policy for mDL documents: age attestations are released automatically,
    /// biometric templates never, and everything else (the PII of the namespace) requires
    /// the holder's confirmation.
    pub fn mdl_default() -> Self {
        let mut policy = DisclosurePolicy::new(PolicyDecision::RequiresConfirmation);
        for threshold in crate::iso::mdl::AGE_OVER_THRESHOLDS {
            policy.set_always(MDL_NAMESPACE, crate::iso::mdl::MdlAttributes::age_over_element(threshold));
        }
        for element in [
            "biometric_template_face",
            "biometric_template_finger",
            "biometric_template_signature_sign",
            "biometric_template_iris",
        ] {
            policy.set_never(MDL_NAMESPACE, element);
        }
        policy
    }

    pub fn set_always(&mut self, namespace: impl Into<NameSpace>, element: impl Into<DataElementIdentifier>) {
        let key = (namespace.into(), element.into());
        self.never.remove(&key);
        self.requires_confirmation.remove(&key);
        self.always.insert(key);
    }

    pub fn set_never(&mut self, namespace: impl Into<NameSpace>, element: impl Into<DataElementIdentifier>) {
        let key = (namespace.into(), element.into());
        self.always.remove(&key);
        self.requires_confirmation.remove(&key);
        self.never.insert(key);
    }

    pub fn set_requires_confirmation(
        &mut self,
        namespace: impl Into<NameSpace>,
        element: impl Into<DataElementIdentifier>,
    ) {
        let key = (namespace.into(), element.into());
        self.always.remove(&key);
        self.never.remove(&key);
        self.requires_confirmation.insert(key);
    }

    pub fn decision(&self, namespace: &str, element: &str) -> PolicyDecision {
        let key = (namespace.to_string(), element.to_string());
        if self.always.contains(&key) {
            PolicyDecision::Always
        } else if self.never.contains(&key) {
            PolicyDecision::Never
        } else if self.requires_confirmation.contains(&key) {
            PolicyDecision::RequiresConfirmation
        } else {
            self.default
        }
    }

    /// Whether every element of the request may be released without asking the holder.
    pub fn can_auto_disclose(&self, request: &ItemsRequest) -> bool {
        request
            .attribute_identifiers()
            .iter()
            .all(|id| self.decision(&id.namespace, &id.attribute) == PolicyDecision::Always)
    }

    /// The subset of the request that needs the holder's confirmation before release.
    pub fn confirmation_required(&self, request: &ItemsRequest) -> Vec<AttributeIdentifier> {
        request
            .attribute_identifiers()
            .into_iter()
            .filter(|id| self.decision(&id.namespace, &id.attribute) == PolicyDecision::RequiresConfirmation)
            .collect()
    }

    /// The subset of the request that the policy blocks outright.
    pub fn blocked(&self, request: &ItemsRequest) -> Vec<AttributeIdentifier> {
        request
            .attribute_identifiers()
            .into_iter()
            .filter(|id| self.decision(&id.namespace, &id.attribute) == PolicyDecision::Never)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::iso::mdl::MDL_DOC_TYPE;

    use super::*;

    #[test]
    fn mdl_default_policy_decisions() {
        let policy = DisclosurePolicy::mdl_default();

        assert_eq!(policy.decision(MDL_NAMESPACE, "age_over_18"), PolicyDecision::Always);
        assert_eq!(
            policy.decision(MDL_NAMESPACE, "biometric_template_face"),
            PolicyDecision::Never
        );
        assert_eq!(
            policy.decision(MDL_NAMESPACE, "family_name"),
            PolicyDecision::RequiresConfirmation
        );
    }

    #[test]
    fn auto_disclosure_requires_all_elements_always() {
        let policy = DisclosurePolicy::mdl_default();

        let age_only = ItemsRequest::new(MDL_DOC_TYPE, MDL_NAMESPACE, ["age_over_18", "age_over_21"]);
        assert!(policy.can_auto_disclose(&age_only));

        let with_name = ItemsRequest::new(MDL_DOC_TYPE, MDL_NAMESPACE, ["age_over_18", "family_name"]);
        assert!(!policy.can_auto_disclose(&with_name));

        let confirmations = policy.confirmation_required(&with_name);
        assert_eq!(confirmations.len(), 1);
        assert_eq!(confirmations[0].attribute, "family_name");
    }

    #[test]
    fn blocked_elements_are_reported() {
        let policy = DisclosurePolicy::mdl_default();
        let request = ItemsRequest::new(
            MDL_DOC_TYPE,
            MDL_NAMESPACE,
            ["age_over_18", "biometric_template_face"],
        );

        let blocked = policy.blocked(&request);
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].attribute, "biometric_template_face");
    }

    #[test]
    fn set_operations_keep_sets_disjoint() {
        let mut policy = DisclosurePolicy::default();
        policy.set_never("ns", "x");
        policy.set_always("ns", "x");
        assert_eq!(policy.decision("ns", "x"), PolicyDecision::Always);
    }
}
