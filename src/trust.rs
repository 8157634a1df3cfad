//! Trust evaluation of certificate chains against a list of trust anchors.
//!
//! A [`TrustList`] holds root certificates (IACAs for issuer verification, reader CAs for
//! reader authentication) keyed by subject key identifier. Chains are evaluated leaf-first
//! against a reference time; revocation and external policy remain pluggable.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustls_pki_types::{CertificateDer, UnixTime};
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage};

use crate::utils::x509::{Certificate, CertificateError, CertificateUsage};

static SUPPORTED_SIG_ALGS: &[&dyn rustls_pki_types::SignatureVerificationAlgorithm] = &[
    webpki::ring::ECDSA_P256_SHA256,
    webpki::ring::ECDSA_P256_SHA384,
    webpki::ring::ECDSA_P384_SHA256,
    webpki::ring::ECDSA_P384_SHA384,
    webpki::ring::ED25519,
];

/// Decision of an external [`TrustEvaluator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    Trusted,
    Denied(String),
    /// The evaluator has no opinion; static trust list evaluation decides.
    Abstain,
}

/// External policy hook consulted during chain evaluation.
pub trait TrustEvaluator {
    fn evaluate(
        &self,
        subject_key_id: &[u8],
        chain: &[Certificate],
        usage: CertificateUsage,
        doc_type: Option<&str>,
    ) -> TrustDecision;
}

/// Pluggable revocation check, consulted only when revocation is not skipped.
pub trait RevocationChecker {
    fn check(&self, chain: &[Certificate]) -> Result<(), CertificateError>;
}

/// How an external evaluator's `Trusted` decision interacts with the static trust list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvaluatorMode {
    /// A `Trusted` decision is accepted only when the static evaluation fails on an
    /// unknown issuer, i.e. the evaluator supplements the anchor list.
    #[default]
    Supplement,
    /// A non-`Abstain` decision is final and the static anchor list is not consulted.
    Override,
}

pub struct TrustConfig {
    pub skip_revocation: bool,
    pub evaluator_mode: EvaluatorMode,
    pub evaluator: Option<Box<dyn TrustEvaluator + Send + Sync>>,
    pub revocation_checker: Option<Box<dyn RevocationChecker + Send + Sync>>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        TrustConfig {
            skip_revocation: false,
            evaluator_mode: EvaluatorMode::default(),
            evaluator: None,
            revocation_checker: None,
        }
    }
}

impl std::fmt::Debug for TrustConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustConfig")
            .field("skip_revocation", &self.skip_revocation)
            .field("evaluator_mode", &self.evaluator_mode)
            .field("evaluator", &self.evaluator.is_some())
            .field("revocation_checker", &self.revocation_checker.is_some())
            .finish()
    }
}

/// Trust anchors keyed by subject key identifier.
#[derive(Debug, Clone, Default)]
pub struct TrustList {
    anchors: IndexMap<Vec<u8>, Certificate>,
}

impl TrustList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, anchor: Certificate) -> Result<(), CertificateError> {
        let ski = anchor.subject_key_identifier()?;
        self.anchors.insert(ski, anchor);
        Ok(())
    }

    pub fn remove(&mut self, subject_key_id: &[u8]) -> Option<Certificate> {
        self.anchors.shift_remove(subject_key_id)
    }

    pub fn get(&self, subject_key_id: &[u8]) -> Option<&Certificate> {
        self.anchors.get(subject_key_id)
    }

    pub fn anchors(&self) -> impl Iterator<Item = &Certificate> {
        self.anchors.values()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn try_from_certificates<I: IntoIterator<Item = Certificate>>(
        certificates: I,
    ) -> Result<Self, CertificateError> {
        let mut list = TrustList::new();
        for certificate in certificates {
            list.add(certificate)?;
        }
        Ok(list)
    }

    /// Verify an ordered certificate chain (leaf first) at the given reference time.
    ///
    /// The leaf must be within its validity window, have the digital signature key usage
    /// and the EKU of `usage`; every certificate must be signed by the next, and the last
    /// by an anchor in this list. An external evaluator and a revocation checker are
    /// consulted per the configuration.
    pub fn verify_chain(
        &self,
        chain: &[Certificate],
        usage: CertificateUsage,
        time: DateTime<Utc>,
        config: &TrustConfig,
        doc_type: Option<&str>,
    ) -> Result<(), CertificateError> {
        let leaf = chain
            .first()
            .ok_or_else(|| CertificateError::ChainInvalid("empty certificate chain".to_string()))?;

        let (not_before, not_after) = leaf.validity_timestamps()?;
        let now = time.timestamp();
        if now < not_before {
            return Err(CertificateError::NotYetValid);
        }
        if now > not_after {
            return Err(CertificateError::Expired);
        }
        if !leaf.has_digital_signature_usage()? {
            return Err(CertificateError::MissingKeyUsage);
        }

        let evaluation = config.evaluator.as_ref().map(|evaluator| {
            evaluator.evaluate(&leaf.subject_key_identifier().unwrap_or_default(), chain, usage, doc_type)
        });
        if let Some(TrustDecision::Denied(reason)) = &evaluation {
            return Err(CertificateError::DeniedByEvaluator(reason.clone()));
        }
        if config.evaluator_mode == EvaluatorMode::Override && evaluation == Some(TrustDecision::Trusted) {
            self.check_revocation(chain, config)?;
            return Ok(());
        }

        let static_result = self.verify_chain_static(chain, usage, time);
        match static_result {
            Err(CertificateError::UntrustedIssuer)
                if config.evaluator_mode == EvaluatorMode::Supplement
                    && evaluation == Some(TrustDecision::Trusted) => {}
            other => other?,
        }

        self.check_revocation(chain, config)
    }

    fn check_revocation(&self, chain: &[Certificate], config: &TrustConfig) -> Result<(), CertificateError> {
        if config.skip_revocation {
            return Ok(());
        }
        match &config.revocation_checker {
            Some(checker) => checker.check(chain),
            None => Ok(()),
        }
    }

    fn verify_chain_static(
        &self,
        chain: &[Certificate],
        usage: CertificateUsage,
        time: DateTime<Utc>,
    ) -> Result<(), CertificateError> {
        let leaf_der = chain[0].as_der();
        let end_entity = EndEntityCert::try_from(leaf_der)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        let intermediates: Vec<CertificateDer> = chain[1..].iter().map(|c| c.as_der().clone()).collect();
        let anchors = self
            .anchors
            .values()
            .map(|anchor| anchor_from_trusted_cert(anchor.as_der()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        let unix_time =
            UnixTime::since_unix_epoch(std::time::Duration::from_secs(time.timestamp().max(0) as u64));

        end_entity
            .verify_for_usage(
                SUPPORTED_SIG_ALGS,
                &anchors,
                &intermediates,
                unix_time,
                KeyUsage::required(usage.eku_oid()),
                None,
                None,
            )
            .map_err(|e| match e {
                webpki::Error::UnknownIssuer => CertificateError::UntrustedIssuer,
                webpki::Error::CertExpired => CertificateError::Expired,
                webpki::Error::CertNotValidYet => CertificateError::NotYetValid,
                webpki::Error::RequiredEkuNotFound => CertificateError::MissingExtendedKeyUsage(usage),
                other => CertificateError::ChainInvalid(other.to_string()),
            })?;

        Ok(())
    }
}

/// Trust settings for reader authentication: pinned leaf certificates, trusted CAs, and
/// the namespaces each reader subject is authorized to request.
#[derive(Debug, Default)]
pub struct ReaderTrustList {
    trusted_certificates: Vec<Certificate>,
    trust_list: TrustList,
    /// Authorized namespaces and data elements per subject key identifier.
    intents: IndexMap<Vec<u8>, IndexMap<String, Vec<String>>>,
}

impl ReaderTrustList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin an individual reader certificate as trusted.
    pub fn add_trusted_certificate(&mut self, certificate: Certificate) {
        self.trusted_certificates.push(certificate);
    }

    /// Trust every reader certified by this CA.
    pub fn add_trusted_ca(&mut self, ca: Certificate) -> Result<(), CertificateError> {
        self.trust_list.add(ca)
    }

    /// Restrict the namespaces (and data elements per namespace) a reader may request.
    pub fn set_intent(
        &mut self,
        certificate: &Certificate,
        namespaces: IndexMap<String, Vec<String>>,
    ) -> Result<(), CertificateError> {
        self.intents.insert(certificate.subject_key_identifier()?, namespaces);
        Ok(())
    }

    pub fn authorized_namespaces(
        &self,
        certificate: &Certificate,
    ) -> Result<Option<&IndexMap<String, Vec<String>>>, CertificateError> {
        Ok(self.intents.get(&certificate.subject_key_identifier()?))
    }

    /// Verify a reader certificate chain: accepted when the leaf is pinned, or when the
    /// chain verifies against a trusted CA with the reader authentication EKU.
    pub fn verify_chain(
        &self,
        chain: &[Certificate],
        time: DateTime<Utc>,
    ) -> Result<(), CertificateError> {
        let leaf = chain
            .first()
            .ok_or_else(|| CertificateError::ChainInvalid("empty certificate chain".to_string()))?;
        if self.trusted_certificates.contains(leaf) {
            return Ok(());
        }
        self.trust_list.verify_chain(
            chain,
            CertificateUsage::ReaderAuth,
            time,
            &TrustConfig {
                skip_revocation: true,
                ..Default::default()
            },
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_with_ca() -> (Vec<Certificate>, Certificate) {
        let (ca, ca_key) = Certificate::new_ca("ca.example.com").unwrap();
        let (leaf, _) = Certificate::new(&ca, &ca_key, "ds.example.com", CertificateUsage::Mdl).unwrap();
        (vec![leaf], ca)
    }

    #[test]
    fn chain_verifies_against_its_ca() {
        let (chain, ca) = chain_with_ca();
        let trust_list = TrustList::try_from_certificates([ca]).unwrap();

        trust_list
            .verify_chain(&chain, CertificateUsage::Mdl, Utc::now(), &TrustConfig::default(), None)
            .unwrap();
    }

    #[test]
    fn chain_fails_against_other_ca() {
        let (chain, _) = chain_with_ca();
        let (other_ca, _) = Certificate::new_ca("other-ca.example.com").unwrap();
        let trust_list = TrustList::try_from_certificates([other_ca]).unwrap();

        let result =
            trust_list.verify_chain(&chain, CertificateUsage::Mdl, Utc::now(), &TrustConfig::default(), None);
        assert!(matches!(result, Err(CertificateError::UntrustedIssuer)));
    }

    #[test]
    fn chain_fails_when_expired() {
        let (chain, ca) = chain_with_ca();
        let trust_list = TrustList::try_from_certificates([ca]).unwrap();

        let future = Utc::now() + chrono::Duration::days(365 * 50);
        let result =
            trust_list.verify_chain(&chain, CertificateUsage::Mdl, future, &TrustConfig::default(), None);
        assert!(matches!(result, Err(CertificateError::Expired)));
    }

    #[test]
    fn chain_fails_for_wrong_usage() {
        let (chain, ca) = chain_with_ca();
        let trust_list = TrustList::try_from_certificates([ca]).unwrap();

        let result = trust_list.verify_chain(
            &chain,
            CertificateUsage::ReaderAuth,
            Utc::now(),
            &TrustConfig::default(),
            None,
        );
        assert!(result.is_err());
    }

    struct DenyAll;
    impl TrustEvaluator for DenyAll {
        fn evaluate(&self, _: &[u8], _: &[Certificate], _: CertificateUsage, _: Option<&str>) -> TrustDecision {
            TrustDecision::Denied("policy says no".to_string())
        }
    }

    #[test]
    fn evaluator_denial_overrides_static_trust() {
        let (chain, ca) = chain_with_ca();
        let trust_list = TrustList::try_from_certificates([ca]).unwrap();

        let config = TrustConfig {
            evaluator: Some(Box::new(DenyAll)),
            ..Default::default()
        };
        let result = trust_list.verify_chain(&chain, CertificateUsage::Mdl, Utc::now(), &config, None);
        assert!(matches!(result, Err(CertificateError::DeniedByEvaluator(_))));
    }

    struct TrustAll;
    impl TrustEvaluator for TrustAll {
        fn evaluate(&self, _: &[u8], _: &[Certificate], _: CertificateUsage, _: Option<&str>) -> TrustDecision {
            TrustDecision::Trusted
        }
    }

    #[test]
    fn evaluator_supplements_unknown_issuer() {
        let (chain, _) = chain_with_ca();
        let trust_list = TrustList::new();

        let config = TrustConfig {
            evaluator: Some(Box::new(TrustAll)),
            ..Default::default()
        };
        trust_list
            .verify_chain(&chain, CertificateUsage::Mdl, Utc::now(), &config, None)
            .unwrap();
    }

    struct AlwaysRevoked;
    impl RevocationChecker for AlwaysRevoked {
        fn check(&self, _: &[Certificate]) -> Result<(), CertificateError> {
            Err(CertificateError::Revoked)
        }
    }

    #[test]
    fn revocation_checker_is_skippable() {
        let (chain, ca) = chain_with_ca();
        let trust_list = TrustList::try_from_certificates([ca]).unwrap();

        let mut config = TrustConfig {
            revocation_checker: Some(Box::new(AlwaysRevoked)),
            ..Default::default()
        };
        let result = trust_list.verify_chain(&chain, CertificateUsage::Mdl, Utc::now(), &config, None);
        assert!(matches!(result, Err(CertificateError::Revoked)));

        config.skip_revocation = true;
        trust_list
            .verify_chain(&chain, CertificateUsage::Mdl, Utc::now(), &config, None)
            .unwrap();
    }
}
