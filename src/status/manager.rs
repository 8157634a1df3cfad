//! Issuer-side management of a status list: allocating slots for newly issued
//! credentials, mutating their status, and publishing the list as a signed token in
//! either envelope format.

use base64::prelude::*;
use chrono::Utc;
use ciborium::value::Value;
use coset::{iana, CoseSign1Builder, HeaderBuilder, TaggedCborSerializable};
use p256::{
    ecdsa::SigningKey,
    pkcs8::{EncodePrivateKey, LineEnding},
};
use serde::{Deserialize, Serialize};

use crate::{
    iso::mdocs::{StatusClaim, StatusListRef},
    status::{CredentialStatus, JsonStatusListClaim, StatusError, StatusList, CWT_STATUS_LIST_CLAIM},
    utils::{
        cose::CoseSigner,
        serialization::cbor_serialize,
    },
};

/// JWT claims of a status list token.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct StatusListTokenClaims {
    pub sub: String,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    pub status_list: JsonStatusListClaim,
}

/// A fixed-capacity status list with a monotonically increasing slot allocator.
///
/// `revoke`, `suspend` and `reinstate` are idempotent slot mutations; allocation refuses
/// once the capacity is exhausted.
#[derive(Debug, Clone)]
pub struct StatusListManager {
    uri: String,
    statuses: Vec<u8>,
    next_index: u64,
}

impl StatusListManager {
    pub fn new(uri: impl Into<String>, capacity: usize) -> Self {
        StatusListManager {
            uri: uri.into(),
            statuses: vec![CredentialStatus::Valid.into(); capacity],
            next_index: 0,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn capacity(&self) -> u64 {
        self.statuses.len() as u64
    }

    /// Allocate the next free slot, returning the claim to embed in the credential.
    /// Indices are strictly increasing until exhaustion.
    pub fn allocate(&mut self) -> Result<StatusClaim, StatusError> {
        if self.next_index >= self.capacity() {
            return Err(StatusError::CapacityExhausted);
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(StatusClaim {
            status_list: StatusListRef {
                idx: index,
                uri: self.uri.clone(),
            },
        })
    }

    fn set(&mut self, index: u64, status: CredentialStatus) -> Result<(), StatusError> {
        let size = self.capacity();
        let slot = self
            .statuses
            .get_mut(index as usize)
            .ok_or(StatusError::IndexOutOfRange { index, size })?;
        *slot = status.into();
        Ok(())
    }

    pub fn revoke(&mut self, index: u64) -> Result<(), StatusError> {
        self.set(index, CredentialStatus::Invalid)
    }

    pub fn suspend(&mut self, index: u64) -> Result<(), StatusError> {
        self.set(index, CredentialStatus::Suspended)
    }

    pub fn reinstate(&mut self, index: u64) -> Result<(), StatusError> {
        self.set(index, CredentialStatus::Valid)
    }

    pub fn status(&self, index: u64) -> Result<CredentialStatus, StatusError> {
        let size = self.capacity();
        self.statuses
            .get(index as usize)
            .map(|slot| CredentialStatus::from(*slot))
            .ok_or(StatusError::IndexOutOfRange { index, size })
    }

    /// The current list as a status list with one byte per slot.
    pub fn to_status_list(&self) -> StatusList {
        StatusList::from_packed(8, self.statuses.clone()).expect("8 bits per slot is always representable")
    }

    /// Publish the list as a `statuslist+jwt` token signed with ES256.
    pub fn to_jwt_token(&self, signing_key: &SigningKey) -> Result<String, StatusError> {
        let claims = StatusListTokenClaims {
            sub: self.uri.clone(),
            iat: Utc::now().timestamp(),
            exp: None,
            status_list: JsonStatusListClaim {
                bits: 8,
                lst: BASE64_URL_SAFE_NO_PAD.encode(self.to_status_list().compress()),
                aggregation_uri: None,
            },
        };

        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::ES256);
        header.typ = Some("statuslist+jwt".to_string());

        let pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| StatusError::Parse(e.to_string()))?;
        let key = jsonwebtoken::EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| StatusError::Parse(e.to_string()))?;

        jsonwebtoken::encode(&header, &claims, &key).map_err(|e| StatusError::Parse(e.to_string()))
    }

    /// Publish the list as a `statuslist+cwt` token: a tagged COSE_Sign1 whose payload is
    /// a CBOR claims map with the status list under claim key 65534 and the raw compressed
    /// bytes in `lst`.
    pub fn to_cwt_token(&self, signing_key: &SigningKey) -> Result<Vec<u8>, StatusError> {
        let status_list = Value::Map(vec![
            (Value::Text("bits".to_string()), Value::from(8u64)),
            (Value::Text("lst".to_string()), Value::Bytes(self.to_status_list().compress())),
        ]);
        let claims = Value::Map(vec![
            (Value::from(2u64), Value::Text(self.uri.clone())),
            (Value::from(6u64), Value::from(Utc::now().timestamp() as u64)),
            (Value::from(CWT_STATUS_LIST_CLAIM), status_list),
        ]);

        let header = HeaderBuilder::new()
            .algorithm(iana::Algorithm::ES256)
            .value(16, Value::Text(super::MEDIA_TYPE_STATUSLIST_CWT.to_string()))
            .build();

        let cose = CoseSign1Builder::new()
            .protected(header)
            .payload(cbor_serialize(&claims)?)
            .try_create_signature(&[], |data| signing_key.sign_data(data))?
            .build();

        cose.to_tagged_vec().map_err(|e| StatusError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rand_core::OsRng;

    use super::*;

    #[test]
    fn allocation_is_strictly_increasing_until_exhaustion() {
        let mut manager = StatusListManager::new("https://status.example.com/1", 3);

        let indices: Vec<_> = (0..3).map(|_| manager.allocate().unwrap().status_list.idx).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        assert_matches!(manager.allocate(), Err(StatusError::CapacityExhausted));
    }

    #[test]
    fn slot_mutations_are_idempotent() {
        let mut manager = StatusListManager::new("https://status.example.com/1", 10);

        manager.revoke(4).unwrap();
        manager.revoke(4).unwrap();
        assert_eq!(manager.status(4).unwrap(), CredentialStatus::Invalid);

        manager.suspend(5).unwrap();
        assert_eq!(manager.status(5).unwrap(), CredentialStatus::Suspended);

        manager.reinstate(5).unwrap();
        manager.reinstate(5).unwrap();
        assert_eq!(manager.status(5).unwrap(), CredentialStatus::Valid);

        assert_matches!(manager.revoke(10), Err(StatusError::IndexOutOfRange { .. }));
    }

    #[test]
    fn status_list_reflects_mutations() {
        let mut manager = StatusListManager::new("https://status.example.com/1", 100);
        manager.revoke(10).unwrap();
        manager.suspend(5).unwrap();

        let list = manager.to_status_list();
        assert_eq!(list.len(), 100);
        assert_eq!(list.status(0).unwrap(), CredentialStatus::Valid);
        assert_eq!(list.status(5).unwrap(), CredentialStatus::Suspended);
        assert_eq!(list.status(10).unwrap(), CredentialStatus::Invalid);
    }

    #[test]
    fn cwt_token_starts_with_sign1_tag() {
        let manager = StatusListManager::new("https://status.example.com/1", 10);
        let key = SigningKey::random(&mut OsRng);

        let token = manager.to_cwt_token(&key).unwrap();
        assert_eq!(token[0], 0xd2);
    }

    #[test]
    fn jwt_token_has_the_right_typ() {
        let manager = StatusListManager::new("https://status.example.com/1", 10);
        let key = SigningKey::random(&mut OsRng);

        let token = manager.to_jwt_token(&key).unwrap();
        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.typ.as_deref(), Some("statuslist+jwt"));
    }
}
