//! Data structures around the Mobile Security Object (MSO): the issuer-signed items whose
//! digests it binds, the digest tables themselves, and the validity window.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use ciborium::tag;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_with::skip_serializing_none;

use crate::utils::{cose::CoseKey, crypto, serialization::TaggedBytes};

pub type DocType = String;
pub type NameSpace = String;
pub type DataElementIdentifier = String;
pub type DataElementValue = ciborium::value::Value;
pub type DigestId = u64;

/// An RFC 3339 date-time, encoded under CBOR tag 0.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Tdate(pub tag::Required<String, 0>);

impl From<DateTime<Utc>> for Tdate {
    fn from(datetime: DateTime<Utc>) -> Self {
        Tdate(tag::Required(datetime.to_rfc3339_opts(SecondsFormat::Secs, true)))
    }
}

impl TryFrom<&Tdate> for DateTime<Utc> {
    type Error = chrono::ParseError;

    fn try_from(date: &Tdate) -> Result<Self, Self::Error> {
        Ok(DateTime::parse_from_rfc3339(&date.0 .0)?.with_timezone(&Utc))
    }
}

impl Tdate {
    pub fn now() -> Self {
        Utc::now().into()
    }
}

/// A calendar date, encoded under CBOR tag 1004.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FullDate(pub tag::Required<String, 1004>);

impl From<NaiveDate> for FullDate {
    fn from(date: NaiveDate) -> Self {
        FullDate(tag::Required(date.format("%Y-%m-%d").to_string()))
    }
}

impl TryFrom<&FullDate> for NaiveDate {
    type Error = chrono::ParseError;

    fn try_from(date: &FullDate) -> Result<Self, Self::Error> {
        NaiveDate::parse_from_str(&date.0 .0, "%Y-%m-%d")
    }
}

impl FullDate {
    /// Parse a `YYYY-MM-DD` string, validating it denotes an actual calendar day.
    pub fn parse(date: &str) -> Result<Self, chrono::ParseError> {
        Ok(NaiveDate::parse_from_str(date, "%Y-%m-%d")?.into())
    }
}

/// A single issuer-signed attribute, together with the salt that blinds its digest and the
/// digest ID under which the MSO carries that digest.
///
/// Constructed at issuance and never mutated afterwards; disclosure selects a subset of
/// these items without altering them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSignedItem {
    #[serde(rename = "digestID")]
    pub digest_id: DigestId,
    pub random: ByteBuf,
    pub element_identifier: DataElementIdentifier,
    pub element_value: DataElementValue,
}

pub type IssuerSignedItemBytes = TaggedBytes<IssuerSignedItem>;

/// The issuer-signed items of one namespace.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct Attributes(pub Vec<IssuerSignedItemBytes>);

impl AsRef<Vec<IssuerSignedItemBytes>> for Attributes {
    fn as_ref(&self) -> &Vec<IssuerSignedItemBytes> {
        &self.0
    }
}

impl From<Vec<IssuerSignedItemBytes>> for Attributes {
    fn from(items: Vec<IssuerSignedItemBytes>) -> Self {
        Attributes(items)
    }
}

pub type IssuerNameSpaces = IndexMap<NameSpace, Attributes>;

/// Digest table of one namespace: digest ID to digest bytes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct DigestIds(pub IndexMap<DigestId, ByteBuf>);

/// The two-level digest table of the MSO.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct ValueDigests(pub IndexMap<NameSpace, DigestIds>);

/// Digest algorithms the MSO may declare.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl DigestAlgorithm {
    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => crypto::sha256(bytes),
            DigestAlgorithm::Sha512 => crypto::sha512(bytes),
        }
    }
}

/// The holder's device key, as bound into the MSO by the issuer.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyInfo {
    pub device_key: CoseKey,
}

impl From<CoseKey> for DeviceKeyInfo {
    fn from(device_key: CoseKey) -> Self {
        DeviceKeyInfo { device_key }
    }
}

/// Validity window of the credential. Invariant: `signed ≤ valid_from ≤ valid_until`.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidityInfo {
    pub signed: Tdate,
    pub valid_from: Tdate,
    pub valid_until: Tdate,
    pub expected_update: Option<Tdate>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum MobileSecurityObjectVersion {
    #[serde(rename = "1.0")]
    V1_0,
}

/// Reference to a slot in a status list (see [`crate::status`]), carried in the MSO.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusListRef {
    pub idx: u64,
    pub uri: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusClaim {
    pub status_list: StatusListRef,
}

/// The Mobile Security Object: binds the per-element digest table, the holder's device
/// key, the document type and the validity window under one issuer signature.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MobileSecurityObject {
    pub version: MobileSecurityObjectVersion,
    pub digest_algorithm: DigestAlgorithm,
    pub value_digests: ValueDigests,
    pub device_key_info: DeviceKeyInfo,
    pub doc_type: DocType,
    pub validity_info: ValidityInfo,
    pub status: Option<StatusClaim>,
}

/// The issuer authentication envelope: a COSE_Sign1 over the tag-24 wrapped MSO, with the
/// Document Signer certificate chain in the protected header.
pub type IssuerAuth = crate::utils::cose::MdocCose<coset::CoseSign1, TaggedBytes<MobileSecurityObject>>;

#[cfg(test)]
mod tests {
    use ciborium::value::Value;

    use crate::utils::serialization::{cbor_deserialize, cbor_serialize};

    use super::*;

    #[test]
    fn tdate_roundtrip() {
        let now: Tdate = Utc::now().into();
        let parsed: DateTime<Utc> = (&now).try_into().unwrap();
        let again: Tdate = parsed.into();
        assert_eq!(now, again);

        // Tag 0 on the wire.
        let bytes = cbor_serialize(&now).unwrap();
        assert_eq!(bytes[0], 0xc0);
    }

    #[test]
    fn full_date_validates() {
        FullDate::parse("1990-03-15").unwrap();
        assert!(FullDate::parse("1990-13-15").is_err());
        assert!(FullDate::parse("1990-02-30").is_err());
        assert!(FullDate::parse("not a date").is_err());

        // Tag 1004 on the wire.
        let bytes = cbor_serialize(&FullDate::parse("1990-03-15").unwrap()).unwrap();
        assert_eq!(&bytes[..2], &[0xd9, 0x03]);
    }

    #[test]
    fn issuer_signed_item_wire_names() {
        let item = IssuerSignedItem {
            digest_id: 7,
            random: ByteBuf::from(vec![0u8; 32]),
            element_identifier: "family_name".to_string(),
            element_value: Value::Text("Smith".to_string()),
        };

        let value = Value::serialized(&item).unwrap();
        let Value::Map(entries) = value else {
            panic!("expected map");
        };
        let keys: Vec<_> = entries
            .iter()
            .map(|(k, _)| k.as_text().unwrap().to_string())
            .collect();
        assert_eq!(keys, ["digestID", "random", "elementIdentifier", "elementValue"]);

        let bytes = cbor_serialize(&TaggedBytes(item.clone())).unwrap();
        let decoded: IssuerSignedItemBytes = cbor_deserialize(&bytes).unwrap();
        assert_eq!(decoded.0, item);
    }
}
