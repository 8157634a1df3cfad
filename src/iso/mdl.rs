//! The mDL document type `org.iso.18013.5.1.mDL` and its canonical namespace: the full
//! attribute record with its wire-level types, plus the age attestation flags.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use ciborium::value::Value;
use indexmap::IndexMap;
use nutype::nutype;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_with::skip_serializing_none;

use crate::{
    iso::{
        mdocs::{FullDate, Tdate},
        unsigned::{Entry, UnsignedDocument},
    },
    utils::serialization::CborError,
};

/// The mDL document type.
pub const MDL_DOC_TYPE: &str = "org.iso.18013.5.1.mDL";
/// The canonical mDL namespace.
pub const MDL_NAMESPACE: &str = "org.iso.18013.5.1";

/// The age attestation thresholds commonly requested.
pub const AGE_OVER_THRESHOLDS: [u8; 4] = [18, 21, 25, 65];

fn is_latin1(value: &str) -> bool {
    !value.is_empty() && value.chars().count() <= 150 && value.chars().all(|c| (c as u32) <= 0xFF)
}

/// Text attribute: non-empty Latin-1, at most 150 characters.
#[nutype(
    validate(predicate = is_latin1),
    derive(Debug, Clone, PartialEq, Eq, AsRef, Deref, TryFrom, Serialize, Deserialize)
)]
pub struct Latin1String(String);

fn is_region_code(value: &str) -> bool {
    value.len() == 2 && value.chars().all(|c| c.is_ascii_uppercase())
}

/// Two-letter region code (ISO 3166-1 alpha-2).
#[nutype(
    validate(predicate = is_region_code),
    derive(Debug, Clone, PartialEq, Eq, AsRef, Deref, TryFrom, Serialize, Deserialize)
)]
pub struct CountryCode(String);

fn is_nonempty_bytes(value: &Vec<u8>) -> bool {
    !value.is_empty()
}

/// Non-empty byte string attribute (portrait, biometric templates, signature marks).
#[nutype(
    validate(predicate = is_nonempty_bytes),
    derive(Debug, Clone, PartialEq, Eq, AsRef, Deref, TryFrom, Serialize, Deserialize)
)]
pub struct BytesAttribute(Vec<u8>);

/// A category of vehicles the holder may drive, with optional per-category restrictions.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DrivingPrivilege {
    pub vehicle_category_code: Latin1String,
    pub issue_date: Option<FullDate>,
    pub expiry_date: Option<FullDate>,
    pub codes: Option<Vec<PrivilegeCode>>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PrivilegeCode {
    pub code: Latin1String,
    pub sign: Option<Latin1String>,
    pub value: Option<Latin1String>,
}

/// The full mDL attribute record: eleven mandatory attributes, the optional attributes of
/// the namespace, and the age attestations. Invariants (Latin-1 caps, region codes,
/// non-empty portrait, valid dates) are enforced by the field types.
#[derive(Debug, Clone, PartialEq)]
pub struct MdlAttributes {
    // Mandatory.
    pub family_name: Latin1String,
    pub given_name: Latin1String,
    pub birth_date: FullDate,
    pub issue_date: FullDate,
    pub expiry_date: FullDate,
    pub issuing_country: CountryCode,
    pub issuing_authority: Latin1String,
    pub document_number: Latin1String,
    pub portrait: BytesAttribute,
    pub driving_privileges: Vec<DrivingPrivilege>,
    pub un_distinguishing_sign: Latin1String,

    // Optional.
    pub administrative_number: Option<Latin1String>,
    pub sex: Option<u64>,
    pub height: Option<u64>,
    pub weight: Option<u64>,
    pub eye_colour: Option<Latin1String>,
    pub hair_colour: Option<Latin1String>,
    pub birth_place: Option<Latin1String>,
    pub resident_address: Option<Latin1String>,
    pub portrait_capture_date: Option<Tdate>,
    pub age_in_years: Option<u64>,
    pub age_birth_year: Option<u64>,
    pub issuing_jurisdiction: Option<Latin1String>,
    pub nationality: Option<CountryCode>,
    pub resident_city: Option<Latin1String>,
    pub resident_state: Option<Latin1String>,
    pub resident_postal_code: Option<Latin1String>,
    pub resident_country: Option<CountryCode>,
    pub biometric_template_face: Option<BytesAttribute>,
    pub biometric_template_finger: Option<BytesAttribute>,
    pub biometric_template_signature_sign: Option<BytesAttribute>,
    pub biometric_template_iris: Option<BytesAttribute>,
    pub family_name_national_character: Option<String>,
    pub given_name_national_character: Option<String>,
    pub signature_usual_mark: Option<BytesAttribute>,

    /// Age attestations per threshold, emitted as `age_over_NN` boolean elements.
    pub age_over: BTreeMap<u8, bool>,
}

fn text(value: &Latin1String) -> Value {
    Value::Text(value.as_ref().to_string())
}

fn serialized<T: Serialize>(value: &T) -> Result<Value, CborError> {
    Ok(Value::serialized(value)?)
}

impl MdlAttributes {
    /// The data element name of an age attestation at the given threshold.
    pub fn age_over_element(threshold: u8) -> String {
        format!("age_over_{threshold:02}")
    }

    /// The attributes as data elements of the canonical namespace, walking mandatory then
    /// optional attributes in declaration order and skipping unset optionals.
    pub fn to_entries(&self) -> Result<Vec<Entry>, CborError> {
        let mut entries = vec![
            Entry {
                name: "family_name".to_string(),
                value: text(&self.family_name),
            },
            Entry {
                name: "given_name".to_string(),
                value: text(&self.given_name),
            },
            Entry {
                name: "birth_date".to_string(),
                value: serialized(&self.birth_date)?,
            },
            Entry {
                name: "issue_date".to_string(),
                value: serialized(&self.issue_date)?,
            },
            Entry {
                name: "expiry_date".to_string(),
                value: serialized(&self.expiry_date)?,
            },
            Entry {
                name: "issuing_country".to_string(),
                value: Value::Text(self.issuing_country.as_ref().to_string()),
            },
            Entry {
                name: "issuing_authority".to_string(),
                value: text(&self.issuing_authority),
            },
            Entry {
                name: "document_number".to_string(),
                value: text(&self.document_number),
            },
            Entry {
                name: "portrait".to_string(),
                value: Value::Bytes(self.portrait.as_ref().clone()),
            },
            Entry {
                name: "driving_privileges".to_string(),
                value: serialized(&self.driving_privileges)?,
            },
            Entry {
                name: "un_distinguishing_sign".to_string(),
                value: text(&self.un_distinguishing_sign),
            },
        ];

        let mut optional = |name: &str, value: Option<Value>| {
            if let Some(value) = value {
                entries.push(Entry {
                    name: name.to_string(),
                    value,
                });
            }
        };

        optional("administrative_number", self.administrative_number.as_ref().map(text));
        optional("sex", self.sex.map(Value::from));
        optional("height", self.height.map(Value::from));
        optional("weight", self.weight.map(Value::from));
        optional("eye_colour", self.eye_colour.as_ref().map(text));
        optional("hair_colour", self.hair_colour.as_ref().map(text));
        optional("birth_place", self.birth_place.as_ref().map(text));
        optional("resident_address", self.resident_address.as_ref().map(text));
        optional(
            "portrait_capture_date",
            self.portrait_capture_date.as_ref().map(serialized).transpose()?,
        );
        optional("age_in_years", self.age_in_years.map(Value::from));
        optional("age_birth_year", self.age_birth_year.map(Value::from));
        optional("issuing_jurisdiction", self.issuing_jurisdiction.as_ref().map(text));
        optional(
            "nationality",
            self.nationality.as_ref().map(|c| Value::Text(c.as_ref().to_string())),
        );
        optional("resident_city", self.resident_city.as_ref().map(text));
        optional("resident_state", self.resident_state.as_ref().map(text));
        optional("resident_postal_code", self.resident_postal_code.as_ref().map(text));
        optional(
            "resident_country",
            self.resident_country.as_ref().map(|c| Value::Text(c.as_ref().to_string())),
        );
        optional(
            "biometric_template_face",
            self.biometric_template_face
                .as_ref()
                .map(|b| Value::Bytes(b.as_ref().clone())),
        );
        optional(
            "biometric_template_finger",
            self.biometric_template_finger
                .as_ref()
                .map(|b| Value::Bytes(b.as_ref().clone())),
        );
        optional(
            "biometric_template_signature_sign",
            self.biometric_template_signature_sign
                .as_ref()
                .map(|b| Value::Bytes(b.as_ref().clone())),
        );
        optional(
            "biometric_template_iris",
            self.biometric_template_iris
                .as_ref()
                .map(|b| Value::Bytes(b.as_ref().clone())),
        );
        optional(
            "family_name_national_character",
            self.family_name_national_character
                .as_ref()
                .map(|s| Value::Text(s.clone())),
        );
        optional(
            "given_name_national_character",
            self.given_name_national_character
                .as_ref()
                .map(|s| Value::Text(s.clone())),
        );
        optional(
            "signature_usual_mark",
            self.signature_usual_mark.as_ref().map(|b| Value::Bytes(b.as_ref().clone())),
        );

        for (threshold, over) in &self.age_over {
            entries.push(Entry {
                name: Self::age_over_element(*threshold),
                value: Value::Bool(*over),
            });
        }

        Ok(entries)
    }

    /// Turn the record into issuance input for the mDL document type, with the given
    /// validity window, or one year from now by default.
    pub fn to_unsigned(&self, validity: Option<(Tdate, Tdate)>) -> Result<UnsignedDocument, CborError> {
        let (valid_from, valid_until) = validity.unwrap_or_else(|| {
            let now = Utc::now();
            (now.into(), (now + Duration::days(365)).into())
        });

        Ok(UnsignedDocument {
            doc_type: MDL_DOC_TYPE.to_string(),
            valid_from,
            valid_until,
            attributes: IndexMap::from([(MDL_NAMESPACE.to_string(), self.to_entries()?)]),
        })
    }
}

/// Helper for constructing byte valued attributes in APIs that work with [`ByteBuf`].
impl From<BytesAttribute> for ByteBuf {
    fn from(bytes: BytesAttribute) -> Self {
        ByteBuf::from(bytes.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn example_attributes() -> MdlAttributes {
        MdlAttributes {
            family_name: Latin1String::try_new("Smith".to_string()).unwrap(),
            given_name: Latin1String::try_new("John".to_string()).unwrap(),
            birth_date: FullDate::parse("1990-03-15").unwrap(),
            issue_date: FullDate::parse("2020-01-01").unwrap(),
            expiry_date: FullDate::parse("2030-01-01").unwrap(),
            issuing_country: CountryCode::try_new("SE".to_string()).unwrap(),
            issuing_authority: Latin1String::try_new("Swedish Transport Agency".to_string()).unwrap(),
            document_number: Latin1String::try_new("123456789".to_string()).unwrap(),
            portrait: BytesAttribute::try_new(vec![0xff, 0xd8, 0xff, 0xe0]).unwrap(),
            driving_privileges: vec![DrivingPrivilege {
                vehicle_category_code: Latin1String::try_new("B".to_string()).unwrap(),
                issue_date: Some(FullDate::parse("2020-01-01").unwrap()),
                expiry_date: None,
                codes: None,
            }],
            un_distinguishing_sign: Latin1String::try_new("S".to_string()).unwrap(),
            administrative_number: None,
            sex: None,
            height: None,
            weight: None,
            eye_colour: None,
            hair_colour: None,
            birth_place: None,
            resident_address: None,
            portrait_capture_date: None,
            age_in_years: None,
            age_birth_year: None,
            issuing_jurisdiction: None,
            nationality: None,
            resident_city: None,
            resident_state: None,
            resident_postal_code: None,
            resident_country: None,
            biometric_template_face: None,
            biometric_template_finger: None,
            biometric_template_signature_sign: None,
            biometric_template_iris: None,
            family_name_national_character: None,
            given_name_national_character: None,
            signature_usual_mark: None,
            age_over: BTreeMap::from([(18, true), (21, true), (65, false)]),
        }
    }

    #[test]
    fn attribute_invariants_are_enforced() {
        assert!(Latin1String::try_new(String::new()).is_err());
        assert!(Latin1String::try_new("a".repeat(151)).is_err());
        assert!(Latin1String::try_new("contains \u{2603}".to_string()).is_err());
        assert!(CountryCode::try_new("SWE".to_string()).is_err());
        assert!(CountryCode::try_new("se".to_string()).is_err());
        assert!(BytesAttribute::try_new(vec![]).is_err());
    }

    #[test]
    fn entries_walk_mandatory_then_age_flags() {
        let entries = example_attributes().to_entries().unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(&names[..3], &["family_name", "given_name", "birth_date"]);
        assert!(names.contains(&"portrait"));
        assert_eq!(&names[names.len() - 3..], &["age_over_18", "age_over_21", "age_over_65"]);

        let age_over_65 = entries.iter().find(|e| e.name == "age_over_65").unwrap();
        assert_eq!(age_over_65.value, Value::Bool(false));
    }

    #[test]
    fn unset_optionals_are_skipped() {
        let entries = example_attributes().to_entries().unwrap();
        assert!(!entries.iter().any(|e| e.name == "resident_city"));

        let mut attributes = example_attributes();
        attributes.resident_city = Some(Latin1String::try_new("Stockholm".to_string()).unwrap());
        let entries = attributes.to_entries().unwrap();
        assert!(entries.iter().any(|e| e.name == "resident_city"));
    }

    #[test]
    fn unsigned_document_defaults_to_one_year() {
        let unsigned = example_attributes().to_unsigned(None).unwrap();
        assert_eq!(unsigned.doc_type, MDL_DOC_TYPE);

        let from: chrono::DateTime<Utc> = (&unsigned.valid_from).try_into().unwrap();
        let until: chrono::DateTime<Utc> = (&unsigned.valid_until).try_into().unwrap();
        assert_eq!(until - from, Duration::days(365));
    }
}
