//! Device engagement and everything that has to be signed with the mdoc's private key
//! during disclosure, chiefly [`DeviceAuthentication`] with its transcript of the session.
//!
//! NB. "Device authentication" is not to be confused with the
//! [`DeviceAuth`](super::disclosure::DeviceAuth) structure in the disclosure module, which
//! contains the holder's signature over the [`DeviceAuthentication`] defined here.

use std::borrow::Cow;

use base64::prelude::*;
use ciborium::value::Value;
use p256::{ecdsa::VerifyingKey, PublicKey, SecretKey};
use rand_core::OsRng;
use serde::{de, ser, Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{
    iso::{disclosure::DeviceNameSpacesBytes, mdocs::DocType},
    utils::{
        cose::CoseKey,
        crypto::{sha256, CryptoError},
        serialization::{
            cbor_deserialize, cbor_serialize, CborError, CborSeq, DeviceAuthenticationString, KeyedCborFields,
            RequiredValue, TaggedBytes,
        },
    },
};

#[derive(thiserror::Error, Debug)]
pub enum EngagementError {
    #[error("engagement is missing the expected key or field: {0}")]
    Malformed(&'static str),
    #[error("QR URI does not start with \"mdoc:\"")]
    QrScheme,
    #[error("QR URI is not valid base64url: {0}")]
    QrBase64(#[from] base64::DecodeError),
    #[error(transparent)]
    Cbor(#[from] CborError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The structure that the holder signs with the mdoc private key when disclosing:
/// `["DeviceAuthentication", session_transcript, doc_type, device_name_spaces_bytes]`.
/// The transcript acts as the challenge in a challenge-response mechanism; both sides
/// compute this structure independently and never transmit it.
pub type DeviceAuthentication<'a> = CborSeq<DeviceAuthenticationKeyed<'a>>;

/// See [`DeviceAuthentication`].
pub type DeviceAuthenticationBytes<'a> = TaggedBytes<DeviceAuthentication<'a>>;

/// See [`DeviceAuthentication`].
#[derive(Serialize, Debug, Clone)]
pub struct DeviceAuthenticationKeyed<'a> {
    pub device_authentication: RequiredValue<DeviceAuthenticationString>,
    pub session_transcript: Cow<'a, SessionTranscript>,
    pub doc_type: Cow<'a, str>,
    pub device_name_spaces_bytes: DeviceNameSpacesBytes,
}

impl KeyedCborFields for DeviceAuthenticationKeyed<'_> {
    const FIELD_NAMES: &'static [&'static str] = &[
        "device_authentication",
        "session_transcript",
        "doc_type",
        "device_name_spaces_bytes",
    ];
}

impl<'a> DeviceAuthenticationKeyed<'a> {
    pub fn new(doc_type: &'a str, session_transcript: &'a SessionTranscript) -> Self {
        DeviceAuthenticationKeyed {
            device_authentication: RequiredValue::default(),
            session_transcript: Cow::Borrowed(session_transcript),
            doc_type: Cow::Borrowed(doc_type),
            device_name_spaces_bytes: DeviceNameSpacesBytes::default(),
        }
    }

    /// The encoded bytes the holder signs or MACs.
    pub fn encode(doc_type: &DocType, session_transcript: &SessionTranscript) -> Result<Vec<u8>, CborError> {
        cbor_serialize(&TaggedBytes(CborSeq(DeviceAuthenticationKeyed::new(
            doc_type,
            session_transcript,
        ))))
    }
}

/// Transcript of the session: the device engagement, the reader's ephemeral key and the
/// handover, all exactly as exchanged. Both sides must arrive at byte-identical encodings
/// of this structure; it is the salt of the session key derivation and part of everything
/// either party signs during the session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionTranscriptKeyed {
    pub device_engagement_bytes: Option<DeviceEngagementBytes>,
    pub ereader_key_bytes: Option<ESenderKeyBytes>,
    pub handover: Handover,
}

impl KeyedCborFields for SessionTranscriptKeyed {
    const FIELD_NAMES: &'static [&'static str] = &["device_engagement_bytes", "ereader_key_bytes", "handover"];
}

pub type SessionTranscript = CborSeq<SessionTranscriptKeyed>;

impl SessionTranscript {
    /// Transcript for proximity flows (QR or NFC handover): both engagement structures are
    /// embedded and the handover slot is null.
    pub fn new(
        device_engagement: &DeviceEngagement,
        e_reader_key: &CoseKey,
        handover: Handover,
    ) -> SessionTranscript {
        SessionTranscriptKeyed {
            device_engagement_bytes: Some(TaggedBytes(device_engagement.clone())),
            ereader_key_bytes: Some(TaggedBytes(e_reader_key.clone())),
            handover,
        }
        .into()
    }

    /// Transcript for web-based presentation: no engagement structures, and a structured
    /// URL record as handover.
    pub fn new_web(response_uri: &url::Url, client_id: &str, nonce: String, mdoc_nonce: &str) -> Result<Self, CborError> {
        let handover = WebHandoverKeyed {
            client_id_hash: ByteBuf::from(sha256(&cbor_serialize(&[client_id, mdoc_nonce])?)),
            response_uri_hash: ByteBuf::from(sha256(&cbor_serialize(&[response_uri.as_str(), mdoc_nonce])?)),
            nonce,
        };

        Ok(SessionTranscriptKeyed {
            device_engagement_bytes: None,
            ereader_key_bytes: None,
            handover: Handover::Web(handover.into()),
        }
        .into())
    }

    pub fn bytes(&self) -> Result<Vec<u8>, CborError> {
        cbor_serialize(&TaggedBytes(self.clone()))
    }
}

/// How the reader and holder first established contact. Null for the proximity flows
/// (QR and NFC), a structured URL record for the web flow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Handover {
    Qr,
    Web(CborSeq<WebHandoverKeyed>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WebHandoverKeyed {
    /// `SHA256(CBOR_encode([client_id, mdoc_nonce]))`
    pub client_id_hash: ByteBuf,
    /// `SHA256(CBOR_encode([response_uri, mdoc_nonce]))`
    pub response_uri_hash: ByteBuf,
    pub nonce: String,
}

impl KeyedCborFields for WebHandoverKeyed {
    const FIELD_NAMES: &'static [&'static str] = &["client_id_hash", "response_uri_hash", "nonce"];
}

pub type DeviceEngagementBytes = TaggedBytes<DeviceEngagement>;
pub type ESenderKeyBytes = TaggedBytes<CoseKey>;

/// Describes how the reader can connect to the holder: the protocol version, the security
/// field with the device's ephemeral key, the available transports and optional origin
/// info. Encoded as an integer-keyed map (0 version, 1 security, 2 retrieval methods,
/// 5 origin infos).
#[derive(Debug, Clone, PartialEq)]
pub struct Engagement {
    pub version: EngagementVersion,
    pub security: Security,
    pub device_retrieval_methods: Option<Vec<RetrievalMethod>>,
    pub origin_infos: Vec<OriginInfo>,
}

pub type DeviceEngagement = Engagement;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum EngagementVersion {
    #[serde(rename = "1.0")]
    V1_0,
}

/// The ephemeral public key used for establishing an end-to-end encrypted channel. The key
/// is always carried tag-24 embedded, on write and on read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SecurityKeyed {
    pub cipher_suite_identifier: CipherSuiteIdentifier,
    pub e_sender_key_bytes: ESenderKeyBytes,
}

impl KeyedCborFields for SecurityKeyed {
    const FIELD_NAMES: &'static [&'static str] = &["cipher_suite_identifier", "e_sender_key_bytes"];
}

pub type Security = CborSeq<SecurityKeyed>;

#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuiteIdentifier {
    P256 = 1,
}

/// A transport over which the holder is reachable, with its transport-specific options.
/// Encoded as `[type, version, options]` (NFC 1, BLE 2, Wi-Fi Aware 3).
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalMethod {
    Nfc(NfcOptions),
    Ble(BleOptions),
    WifiAware(WifiAwareOptions),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BleOptions {
    pub peripheral_server_mode: bool,
    pub central_client_mode: bool,
    pub peripheral_server_uuid: Option<ByteBuf>,
    pub central_client_uuid: Option<ByteBuf>,
    pub peripheral_server_address: Option<ByteBuf>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NfcOptions {
    pub max_command_data_length: u64,
    pub max_response_data_length: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WifiAwareOptions {
    pub pass_phrase: Option<String>,
    pub operating_class: Option<u64>,
    pub channel_number: Option<u64>,
    pub supported_bands: Option<ByteBuf>,
}

/// The kind and direction of the previously received protocol message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OriginInfo {
    pub cat: OriginInfoDirection,
    #[serde(rename = "type")]
    pub typ: OriginInfoType,
}

#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OriginInfoDirection {
    Delivered = 0,
    Received = 1,
}

#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OriginInfoType {
    Website = 1,
    OnDeviceQrCode = 2,
    MessageData = 3,
}

impl Engagement {
    /// Build a device engagement with a freshly generated P-256 ephemeral key. Returns the
    /// engagement and the corresponding private key, which the holder needs for the
    /// session key agreement.
    pub fn new_device_engagement(
        device_retrieval_methods: Option<Vec<RetrievalMethod>>,
        origin_infos: Vec<OriginInfo>,
    ) -> Result<(DeviceEngagement, SecretKey), EngagementError> {
        let private_key = SecretKey::random(&mut OsRng);
        let cose_key: CoseKey = (&VerifyingKey::from(private_key.public_key())).try_into()?;

        let engagement = Engagement {
            version: EngagementVersion::V1_0,
            security: SecurityKeyed {
                cipher_suite_identifier: CipherSuiteIdentifier::P256,
                e_sender_key_bytes: TaggedBytes(cose_key),
            }
            .into(),
            device_retrieval_methods,
            origin_infos,
        };

        Ok((engagement, private_key))
    }

    /// The ephemeral public key from the security field.
    pub fn ephemeral_public_key(&self) -> Result<PublicKey, EngagementError> {
        let key: PublicKey = (&self.security.0.e_sender_key_bytes.0)
            .try_into()
            .map_err(EngagementError::Crypto)?;
        Ok(key)
    }

    /// The `mdoc:` URI carrying the engagement, for rendering as a QR code.
    pub fn qr_uri(&self) -> Result<String, EngagementError> {
        Ok(format!("mdoc:{}", BASE64_URL_SAFE_NO_PAD.encode(cbor_serialize(self)?)))
    }

    /// Parse an `mdoc:` QR URI back into the engagement.
    pub fn parse_qr_uri(uri: &str) -> Result<DeviceEngagement, EngagementError> {
        let encoded = uri.strip_prefix("mdoc:").ok_or(EngagementError::QrScheme)?;
        let bytes = BASE64_URL_SAFE_NO_PAD.decode(encoded)?;
        let engagement = cbor_deserialize(&bytes)?;
        Ok(engagement)
    }
}

fn int_entry<T: Serialize, E: ser::Error>(key: u64, value: &T) -> Result<(Value, Value), E> {
    Ok((Value::from(key), Value::serialized(value).map_err(ser::Error::custom)?))
}

fn lookup(entries: &[(Value, Value)], key: u64) -> Option<&Value> {
    entries.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if i128::from(*i) == key as i128 => Some(v),
        _ => None,
    })
}

fn field<'de, T: serde::de::DeserializeOwned, D: de::Deserializer<'de>>(
    entries: &[(Value, Value)],
    key: u64,
    name: &'static str,
) -> Result<T, D::Error> {
    lookup(entries, key)
        .ok_or_else(|| de::Error::missing_field(name))?
        .deserialized()
        .map_err(de::Error::custom)
}

impl Serialize for Engagement {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut entries = vec![
            int_entry::<_, S::Error>(0, &self.version)?,
            int_entry::<_, S::Error>(1, &self.security)?,
        ];
        if let Some(methods) = &self.device_retrieval_methods {
            entries.push(int_entry::<_, S::Error>(2, methods)?);
        }
        if !self.origin_infos.is_empty() {
            entries.push(int_entry::<_, S::Error>(5, &self.origin_infos)?);
        }
        Value::Map(entries).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Engagement {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Value::Map(entries) = value else {
            return Err(de::Error::custom("engagement is not a map"));
        };

        let version = field::<_, D>(&entries, 0, "version")?;
        let security = field::<_, D>(&entries, 1, "security")?;
        let device_retrieval_methods = lookup(&entries, 2)
            .map(|v| v.deserialized().map_err(de::Error::custom))
            .transpose()?;
        let origin_infos = lookup(&entries, 5)
            .map(|v| v.deserialized().map_err(de::Error::custom))
            .transpose()?
            .unwrap_or_default();

        Ok(Engagement {
            version,
            security,
            device_retrieval_methods,
            origin_infos,
        })
    }
}

impl RetrievalMethod {
    fn type_id(&self) -> u64 {
        match self {
            RetrievalMethod::Nfc(_) => 1,
            RetrievalMethod::Ble(_) => 2,
            RetrievalMethod::WifiAware(_) => 3,
        }
    }
}

impl Serialize for RetrievalMethod {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let options = match self {
            RetrievalMethod::Nfc(options) => Value::Map(vec![
                (Value::from(0u64), Value::from(options.max_command_data_length)),
                (Value::from(1u64), Value::from(options.max_response_data_length)),
            ]),
            RetrievalMethod::Ble(options) => {
                let mut entries = vec![
                    (Value::from(0u64), Value::Bool(options.peripheral_server_mode)),
                    (Value::from(1u64), Value::Bool(options.central_client_mode)),
                ];
                if let Some(uuid) = &options.peripheral_server_uuid {
                    entries.push((Value::from(10u64), Value::Bytes(uuid.to_vec())));
                }
                if let Some(uuid) = &options.central_client_uuid {
                    entries.push((Value::from(11u64), Value::Bytes(uuid.to_vec())));
                }
                if let Some(address) = &options.peripheral_server_address {
                    entries.push((Value::from(20u64), Value::Bytes(address.to_vec())));
                }
                Value::Map(entries)
            }
            RetrievalMethod::WifiAware(options) => {
                let mut entries = Vec::new();
                if let Some(pass_phrase) = &options.pass_phrase {
                    entries.push((Value::from(0u64), Value::Text(pass_phrase.clone())));
                }
                if let Some(class) = options.operating_class {
                    entries.push((Value::from(1u64), Value::from(class)));
                }
                if let Some(channel) = options.channel_number {
                    entries.push((Value::from(2u64), Value::from(channel)));
                }
                if let Some(bands) = &options.supported_bands {
                    entries.push((Value::from(3u64), Value::Bytes(bands.to_vec())));
                }
                Value::Map(entries)
            }
        };

        Value::Array(vec![Value::from(self.type_id()), Value::from(1u64), options]).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RetrievalMethod {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Value::Array(items) = value else {
            return Err(de::Error::custom("retrieval method is not an array"));
        };
        let [typ, _version, options] = items.as_slice() else {
            return Err(de::Error::custom("retrieval method is not a three-element array"));
        };
        let typ = typ
            .as_integer()
            .map(i128::from)
            .ok_or_else(|| de::Error::custom("retrieval method type is not an integer"))?;
        let Value::Map(options) = options else {
            return Err(de::Error::custom("retrieval method options is not a map"));
        };

        let opt_bytes = |key: u64| -> Option<ByteBuf> {
            lookup(options, key)
                .and_then(Value::as_bytes)
                .map(|b| ByteBuf::from(b.clone()))
        };
        let opt_uint =
            |key: u64| -> Option<u64> { lookup(options, key).and_then(Value::as_integer).and_then(|i| i.try_into().ok()) };
        let opt_bool = |key: u64| -> Option<bool> { lookup(options, key).and_then(Value::as_bool) };

        let method = match typ {
            1 => RetrievalMethod::Nfc(NfcOptions {
                max_command_data_length: opt_uint(0).ok_or_else(|| de::Error::missing_field("max command length"))?,
                max_response_data_length: opt_uint(1).ok_or_else(|| de::Error::missing_field("max response length"))?,
            }),
            2 => RetrievalMethod::Ble(BleOptions {
                peripheral_server_mode: opt_bool(0).unwrap_or_default(),
                central_client_mode: opt_bool(1).unwrap_or_default(),
                peripheral_server_uuid: opt_bytes(10),
                central_client_uuid: opt_bytes(11),
                peripheral_server_address: opt_bytes(20),
            }),
            3 => RetrievalMethod::WifiAware(WifiAwareOptions {
                pass_phrase: lookup(options, 0).and_then(Value::as_text).map(str::to_string),
                operating_class: opt_uint(1),
                channel_number: opt_uint(2),
                supported_bands: opt_bytes(3),
            }),
            other => return Err(de::Error::custom(format!("unknown retrieval method type {other}"))),
        };
        Ok(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) fn example_engagement() -> (DeviceEngagement, SecretKey) {
        Engagement::new_device_engagement(
            Some(vec![RetrievalMethod::Ble(BleOptions {
                central_client_mode: true,
                central_client_uuid: Some(ByteBuf::from(vec![0u8; 16])),
                ..Default::default()
            })]),
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn engagement_roundtrip() {
        let (engagement, key) = example_engagement();

        let bytes = cbor_serialize(&engagement).unwrap();
        let decoded: DeviceEngagement = cbor_deserialize(&bytes).unwrap();
        assert_eq!(decoded, engagement);

        assert_eq!(decoded.ephemeral_public_key().unwrap(), key.public_key());
    }

    #[test]
    fn engagement_wire_shape() {
        let (engagement, _) = example_engagement();
        let value: Value = ciborium::de::from_reader(cbor_serialize(&engagement).unwrap().as_slice()).unwrap();

        let Value::Map(entries) = value else {
            panic!("expected map");
        };
        // version "1.0" under key 0, security under key 1, retrieval methods under key 2.
        assert_eq!(lookup(&entries, 0), Some(&Value::Text("1.0".to_string())));
        assert!(matches!(lookup(&entries, 1), Some(Value::Array(_))));
        assert!(matches!(lookup(&entries, 2), Some(Value::Array(_))));

        // The ephemeral key is tag-24 embedded inside the security array.
        let Some(Value::Array(security)) = lookup(&entries, 1) else {
            panic!("expected security array");
        };
        assert!(matches!(&security[1], Value::Tag(24, _)));
    }

    #[test]
    fn qr_uri_roundtrip() {
        let (engagement, _) = example_engagement();

        let uri = engagement.qr_uri().unwrap();
        assert!(uri.starts_with("mdoc:"));

        let parsed = Engagement::parse_qr_uri(&uri).unwrap();
        assert_eq!(parsed, engagement);

        assert!(matches!(
            Engagement::parse_qr_uri("https://example.com"),
            Err(EngagementError::QrScheme)
        ));
    }

    #[test]
    fn session_transcript_is_reproducible() {
        let (engagement, _) = example_engagement();
        let reader_key = SecretKey::random(&mut OsRng);
        let reader_cose_key: CoseKey = (&VerifyingKey::from(reader_key.public_key())).try_into().unwrap();

        let transcript = SessionTranscript::new(&engagement, &reader_cose_key, Handover::Qr);
        let transcript_again = SessionTranscript::new(&engagement, &reader_cose_key, Handover::Qr);
        assert_eq!(transcript.bytes().unwrap(), transcript_again.bytes().unwrap());

        // [device_engagement_bytes, ereader_key_bytes, null]
        let value: Value = ciborium::de::from_reader(cbor_serialize(&transcript).unwrap().as_slice()).unwrap();
        let Value::Array(items) = value else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], Value::Tag(24, _)));
        assert!(matches!(&items[1], Value::Tag(24, _)));
        assert_eq!(items[2], Value::Null);
    }

    #[test]
    fn device_authentication_encoding() {
        let (engagement, _) = example_engagement();
        let reader_key = SecretKey::random(&mut OsRng);
        let reader_cose_key: CoseKey = (&VerifyingKey::from(reader_key.public_key())).try_into().unwrap();
        let transcript = SessionTranscript::new(&engagement, &reader_cose_key, Handover::Qr);

        let doc_type = "org.iso.18013.5.1.mDL".to_string();
        let bytes = DeviceAuthenticationKeyed::encode(&doc_type, &transcript).unwrap();

        // Tag 24 wrapping the encoded four-element array.
        assert_eq!(&bytes[..2], &[0xd8, 0x18]);
        assert_eq!(bytes, DeviceAuthenticationKeyed::encode(&doc_type, &transcript).unwrap());
    }
}
