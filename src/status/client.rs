//! Verifier-side status retrieval: fetch the status list token over HTTP, parse either
//! envelope format, and cache the decompressed list per URI.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use base64::prelude::*;
use chrono::{DateTime, Utc};
use ciborium::value::Value;
use coset::{CborSerializable, CoseSign1, TaggedCborSerializable};
use p256::ecdsa::VerifyingKey;
use tracing::debug;
use url::Url;

use crate::{
    status::{
        manager::StatusListTokenClaims, CredentialStatus, StatusError, StatusList, CWT_STATUS_LIST_CLAIM,
        MEDIA_TYPE_STATUSLIST_CWT, MEDIA_TYPE_STATUSLIST_JWT,
    },
    utils::x509::CertPublicKey,
};

/// Default time-to-live of cached status lists.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Fetches status tokens. Implemented over HTTP by [`HttpStatusFetcher`]; tests provide
/// their own implementations.
pub trait StatusTokenFetcher {
    /// Fetch the token at the URI, returning the response `Content-Type` (if any) and the
    /// body bytes.
    fn fetch(
        &self,
        uri: &Url,
    ) -> impl std::future::Future<Output = Result<(Option<String>, Vec<u8>), StatusError>> + Send;
}

/// Fetches status tokens with a [`reqwest::Client`], accepting both media types.
#[derive(Default)]
pub struct HttpStatusFetcher {
    client: reqwest::Client,
}

impl StatusTokenFetcher for HttpStatusFetcher {
    async fn fetch(&self, uri: &Url) -> Result<(Option<String>, Vec<u8>), StatusError> {
        let response = self
            .client
            .get(uri.clone())
            .header(
                reqwest::header::ACCEPT,
                format!("{MEDIA_TYPE_STATUSLIST_JWT}, {MEDIA_TYPE_STATUSLIST_CWT}"),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StatusError::HttpStatus(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();
        Ok((content_type, body))
    }
}

struct CacheEntry {
    list: StatusList,
    expires: DateTime<Utc>,
}

/// Retrieves, verifies and caches status lists, and resolves slot statuses by index.
pub struct StatusClient<F> {
    fetcher: F,
    ttl: Duration,
    verification_key: Option<VerifyingKey>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for StatusClient<HttpStatusFetcher> {
    fn default() -> Self {
        StatusClient::new(HttpStatusFetcher::default())
    }
}

impl<F: StatusTokenFetcher> StatusClient<F> {
    pub fn new(fetcher: F) -> Self {
        StatusClient {
            fetcher,
            ttl: DEFAULT_CACHE_TTL,
            verification_key: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Verify token signatures against this status issuer key. Without a key, tokens are
    /// parsed but their signature is not checked.
    pub fn with_verification_key(mut self, key: VerifyingKey) -> Self {
        self.verification_key = Some(key);
        self
    }

    /// The status of slot `index` in the list at `uri`. Uses the cache when fresh;
    /// expired entries are refetched.
    pub async fn check(&self, uri: &Url, index: u64) -> Result<CredentialStatus, StatusError> {
        {
            let cache = self.cache.lock().expect("status cache lock");
            if let Some(entry) = cache.get(uri.as_str()) {
                if entry.expires > Utc::now() {
                    return entry.list.status(index);
                }
            }
        }

        debug!("fetching status list from {uri}");
        let (content_type, body) = self.fetcher.fetch(uri).await?;
        let list = self.parse_token(content_type.as_deref(), &body)?;

        let status = list.status(index);
        self.cache.lock().expect("status cache lock").insert(
            uri.as_str().to_string(),
            CacheEntry {
                list,
                expires: Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(5)),
            },
        );
        status
    }

    /// Drop the cached list for a URI, forcing a refetch on next access.
    pub fn invalidate(&self, uri: &Url) {
        self.cache.lock().expect("status cache lock").remove(uri.as_str());
    }

    /// Parse a token, dispatching on the content type when present and otherwise
    /// auto-detecting: a leading COSE_Sign1 tag byte means the CBOR envelope.
    fn parse_token(&self, content_type: Option<&str>, body: &[u8]) -> Result<StatusList, StatusError> {
        match content_type {
            Some(content_type) if content_type.starts_with(MEDIA_TYPE_STATUSLIST_JWT) => self.parse_jwt(body),
            Some(content_type) if content_type.starts_with(MEDIA_TYPE_STATUSLIST_CWT) => self.parse_cwt(body),
            Some(other) => Err(StatusError::UnexpectedContentType(other.to_string())),
            None => self.auto_detect(body),
        }
    }

    fn auto_detect(&self, body: &[u8]) -> Result<StatusList, StatusError> {
        match body.first() {
            Some(0xd2) => self.parse_cwt(body),
            _ => self.parse_jwt(body),
        }
    }

    fn parse_jwt(&self, body: &[u8]) -> Result<StatusList, StatusError> {
        let token = std::str::from_utf8(body).map_err(|_| StatusError::Parse("token is not UTF-8".to_string()))?;

        let claims: StatusListTokenClaims = match &self.verification_key {
            Some(key) => {
                let pem = p256::pkcs8::EncodePublicKey::to_public_key_pem(key, p256::pkcs8::LineEnding::LF)
                    .map_err(|e| StatusError::Parse(e.to_string()))?;
                let decoding_key = jsonwebtoken::DecodingKey::from_ec_pem(pem.as_bytes())
                    .map_err(|e| StatusError::Parse(e.to_string()))?;

                let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES256);
                validation.validate_exp = false;
                validation.validate_aud = false;
                validation.required_spec_claims.clear();

                jsonwebtoken::decode(token, &decoding_key, &validation)
                    .map_err(|_| StatusError::TokenSignatureInvalid)?
                    .claims
            }
            None => {
                let payload = token
                    .split('.')
                    .nth(1)
                    .ok_or_else(|| StatusError::Parse("token is not a JWT".to_string()))?;
                let payload = BASE64_URL_SAFE_NO_PAD
                    .decode(payload)
                    .map_err(|e| StatusError::Parse(e.to_string()))?;
                serde_json::from_slice(&payload).map_err(|e| StatusError::Parse(e.to_string()))?
            }
        };

        let compressed = BASE64_URL_SAFE_NO_PAD
            .decode(&claims.status_list.lst)
            .map_err(|e| StatusError::Parse(e.to_string()))?;
        StatusList::from_compressed(claims.status_list.bits, &compressed)
    }

    fn parse_cwt(&self, body: &[u8]) -> Result<StatusList, StatusError> {
        let cose = CoseSign1::from_tagged_slice(body)
            .or_else(|_| CoseSign1::from_slice(body))
            .map_err(|e| StatusError::Parse(e.to_string()))?;

        if let Some(key) = &self.verification_key {
            let cose_wrapper: crate::utils::cose::MdocCose<CoseSign1, Value> = cose.clone().into();
            cose_wrapper
                .verify(&CertPublicKey::P256(*key))
                .map_err(|_| StatusError::TokenSignatureInvalid)?;
        }

        let payload = cose
            .payload
            .as_ref()
            .ok_or_else(|| StatusError::Parse("CWT has no payload".to_string()))?;
        let claims: Value = crate::utils::serialization::cbor_deserialize(payload)?;
        let Value::Map(entries) = claims else {
            return Err(StatusError::Parse("CWT claims are not a map".to_string()));
        };

        let status_list = entries
            .iter()
            .find_map(|(key, value)| match key {
                Value::Integer(i) if i128::from(*i) == CWT_STATUS_LIST_CLAIM as i128 => Some(value),
                _ => None,
            })
            .ok_or_else(|| StatusError::Parse("CWT lacks the status list claim".to_string()))?;

        let claim: crate::status::CborStatusListClaim =
            status_list.deserialized().map_err(|e| StatusError::Parse(e.to_string()))?;
        StatusList::from_compressed(claim.bits, &claim.lst)
    }
}
