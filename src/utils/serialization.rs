//! CBOR serialization utilities.
//!
//! Every signature and digest in this crate is computed over CBOR-encoded bytes, so all
//! encoding goes through the two functions in this module: [`cbor_serialize`] and
//! [`cbor_deserialize`]. The wrapper types defined here implement the encoding conventions
//! that ISO 18013-5 uses pervasively:
//!
//! - [`TaggedBytes`]: a data structure that is first encoded to bytes and then embedded in
//!   its parent as a tag 24 byte string, so that the parent can be re-encoded without
//!   disturbing the bytes that digests and signatures were computed over.
//! - [`CborSeq`]: a struct whose fields are encoded as a fixed-length CBOR array.
//! - [`RequiredValue`]: a field that must contain a specific constant on the wire.

use std::{borrow::Cow, fmt::Debug, marker::PhantomData};

use ciborium::{tag, value::Value};
use serde::{de, de::DeserializeOwned, ser, Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(thiserror::Error, Debug)]
pub enum CborError {
    #[error("CBOR encoding failed: {0}")]
    Encoding(#[from] ciborium::ser::Error<std::io::Error>),
    #[error("CBOR decoding failed: {0}")]
    Decoding(#[from] ciborium::de::Error<std::io::Error>),
    #[error("CBOR value conversion failed: {0}")]
    Value(#[from] ciborium::value::Error),
    #[error("duplicate key in CBOR map")]
    DuplicateMapKey,
}

/// Encode a value to CBOR bytes. The encoding is definite-length and encodes integers in
/// their smallest form; map ordering follows the order in which the data structures of this
/// crate hold their entries.
pub fn cbor_serialize<T: Serialize>(val: &T) -> Result<Vec<u8>, CborError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(val, &mut bytes)?;
    Ok(bytes)
}

/// Decode a value from CBOR bytes. Decoding is pedantic: maps containing duplicate keys
/// anywhere in the tree are rejected.
pub fn cbor_deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CborError> {
    let value: Value = ciborium::de::from_reader(bytes)?;
    reject_duplicate_map_keys(&value)?;
    let deserialized = value.deserialized()?;
    Ok(deserialized)
}

fn reject_duplicate_map_keys(value: &Value) -> Result<(), CborError> {
    match value {
        Value::Map(entries) => {
            let mut seen = std::collections::HashSet::with_capacity(entries.len());
            for (key, val) in entries {
                if !seen.insert(cbor_serialize(key)?) {
                    return Err(CborError::DuplicateMapKey);
                }
                reject_duplicate_map_keys(key)?;
                reject_duplicate_map_keys(val)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(reject_duplicate_map_keys),
        Value::Tag(_, inner) => reject_duplicate_map_keys(inner),
        _ => Ok(()),
    }
}

/// Wrapper for data structures that are serialized to bytes first and then embedded into
/// their parent structure as a tag 24 (encoded CBOR data item) byte string.
///
/// This indirection is what allows an [`IssuerSignedItem`](crate::iso::mdocs::IssuerSignedItem)
/// to be hashed, or an engagement ephemeral key to be transcribed into the session
/// transcript, independently of the structure that carries it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedBytes<T>(pub T);

impl<T> From<T> for TaggedBytes<T> {
    fn from(val: T) -> Self {
        TaggedBytes(val)
    }
}

impl<T: Default> Default for TaggedBytes<T> {
    fn default() -> Self {
        TaggedBytes(T::default())
    }
}

impl<T: Serialize> TaggedBytes<T> {
    /// The encoded bytes of the inner value, i.e. the contents of the tagged byte string.
    pub fn inner_bytes(&self) -> Result<Vec<u8>, CborError> {
        cbor_serialize(&self.0)
    }
}

impl<T: Serialize> Serialize for TaggedBytes<T> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = cbor_serialize(&self.0).map_err(ser::Error::custom)?;
        tag::Required::<ByteBuf, 24>(ByteBuf::from(bytes)).serialize(serializer)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for TaggedBytes<T> {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag::Required::<ByteBuf, 24>(bytes) = tag::Required::deserialize(deserializer)?;
        let inner = cbor_deserialize(&bytes).map_err(de::Error::custom)?;
        Ok(TaggedBytes(inner))
    }
}

/// Field names of a struct wrapped in [`CborSeq`], in declaration order. These must match
/// the serde names of the fields, since they are used to reconstruct the struct from the
/// positional array encoding.
pub trait KeyedCborFields {
    const FIELD_NAMES: &'static [&'static str];
}

/// Wrapper that encodes a struct as a fixed-length CBOR array of its field values, in
/// declaration order. `None` fields are encoded as null, so structs used with this wrapper
/// must not skip serializing absent fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CborSeq<T>(pub T);

impl<T> From<T> for CborSeq<T> {
    fn from(val: T) -> Self {
        CborSeq(val)
    }
}

impl<T: Serialize> Serialize for CborSeq<T> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match Value::serialized(&self.0).map_err(ser::Error::custom)? {
            Value::Map(entries) => {
                Value::Array(entries.into_iter().map(|(_, v)| v).collect()).serialize(serializer)
            }
            _ => Err(ser::Error::custom("CborSeq inner type must serialize to a map")),
        }
    }
}

impl<'de, T: DeserializeOwned + KeyedCborFields> Deserialize<'de> for CborSeq<T> {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<Value>::deserialize(deserializer)?;
        if values.len() > T::FIELD_NAMES.len() {
            return Err(de::Error::custom("too many values for CborSeq"));
        }
        let map = Value::Map(
            T::FIELD_NAMES
                .iter()
                .zip(values)
                .map(|(name, value)| (Value::Text((*name).to_string()), value))
                .collect(),
        );
        let inner = map.deserialized().map_err(de::Error::custom)?;
        Ok(CborSeq(inner))
    }
}

/// Contract for [`RequiredValue`]: the constant that must appear on the wire.
pub trait RequiredValueTrait {
    type Type: Serialize + DeserializeOwned + PartialEq + Debug;
    const REQUIRED_VALUE: Self::Type;
}

/// A field holding no data, which serializes to a required constant and whose
/// deserialization fails if the constant is not present.
#[derive(Debug, Clone, PartialEq)]
pub struct RequiredValue<T: RequiredValueTrait>(PhantomData<T>);

impl<T: RequiredValueTrait> Default for RequiredValue<T> {
    fn default() -> Self {
        RequiredValue(PhantomData)
    }
}

impl<T: RequiredValueTrait> Serialize for RequiredValue<T> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        T::REQUIRED_VALUE.serialize(serializer)
    }
}

impl<'de, T: RequiredValueTrait> Deserialize<'de> for RequiredValue<T> {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let found = T::Type::deserialize(deserializer)?;
        if found != T::REQUIRED_VALUE {
            return Err(de::Error::custom(format!(
                "expected required value {:?}, found {:?}",
                T::REQUIRED_VALUE,
                found
            )));
        }
        Ok(RequiredValue::default())
    }
}

/// Wire constant for device authentication (see [`crate::iso::engagement`]).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAuthenticationString;
impl RequiredValueTrait for DeviceAuthenticationString {
    type Type = Cow<'static, str>;
    const REQUIRED_VALUE: Self::Type = Cow::Borrowed("DeviceAuthentication");
}

/// Wire constant for reader authentication (see [`crate::iso::device_retrieval`]).
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderAuthenticationString;
impl RequiredValueTrait for ReaderAuthenticationString {
    type Type = Cow<'static, str>;
    const REQUIRED_VALUE: Self::Type = Cow::Borrowed("ReaderAuthentication");
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[test]
    fn serialization_is_deterministic() {
        let map = IndexMap::from([("a".to_string(), 1u64), ("b".to_string(), 2)]);
        assert_eq!(cbor_serialize(&map).unwrap(), cbor_serialize(&map).unwrap());

        let decoded: IndexMap<String, u64> =
            cbor_deserialize(cbor_serialize(&map).unwrap().as_slice()).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn duplicate_map_keys_are_rejected() {
        // {"a": 1, "a": 2}
        let bytes = hex::decode("a2616101616102").unwrap();
        assert!(matches!(
            cbor_deserialize::<IndexMap<String, u64>>(&bytes),
            Err(CborError::DuplicateMapKey)
        ));
    }

    #[test]
    fn tagged_bytes_roundtrip() {
        let val = TaggedBytes("hello".to_string());
        let bytes = cbor_serialize(&val).unwrap();

        // Tag 24 (0xd818), followed by a byte string containing the encoded inner value.
        assert_eq!(&bytes[..2], &[0xd8, 0x18]);

        let decoded: TaggedBytes<String> = cbor_deserialize(&bytes).unwrap();
        assert_eq!(decoded.0, "hello");
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Pair {
        first: u64,
        second: Option<String>,
    }

    impl KeyedCborFields for Pair {
        const FIELD_NAMES: &'static [&'static str] = &["first", "second"];
    }

    #[test]
    fn cbor_seq_encodes_as_array() {
        let seq = CborSeq(Pair {
            first: 42,
            second: Some("x".to_string()),
        });
        let bytes = cbor_serialize(&seq).unwrap();
        let value: Value = ciborium::de::from_reader(bytes.as_slice()).unwrap();
        assert!(matches!(value, Value::Array(ref items) if items.len() == 2));

        let decoded: CborSeq<Pair> = cbor_deserialize(&bytes).unwrap();
        assert_eq!(decoded.0, seq.0);
    }

    #[test]
    fn cbor_seq_encodes_none_as_null() {
        let seq = CborSeq(Pair {
            first: 1,
            second: None,
        });
        let value: Value = ciborium::de::from_reader(cbor_serialize(&seq).unwrap().as_slice()).unwrap();
        let Value::Array(items) = value else {
            panic!("expected array");
        };
        assert_eq!(items[1], Value::Null);
    }

    #[test]
    fn required_value_enforces_constant() {
        let bytes = cbor_serialize(&RequiredValue::<DeviceAuthenticationString>::default()).unwrap();
        let decoded: Result<RequiredValue<DeviceAuthenticationString>, _> = cbor_deserialize(&bytes);
        assert!(decoded.is_ok());

        let wrong = cbor_serialize(&"NotDeviceAuthentication").unwrap();
        let decoded: Result<RequiredValue<DeviceAuthenticationString>, _> = cbor_deserialize(&wrong);
        assert!(decoded.is_err());
    }
}
