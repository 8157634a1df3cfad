//! Revocation status lists: a signed, compressed list of per-credential status slots,
//! published at a URI and referenced from the MSO by index.

mod client;
mod manager;

pub use client::{HttpStatusFetcher, StatusClient, StatusTokenFetcher};
pub use manager::StatusListManager;

use miniz_oxide::{deflate::compress_to_vec_zlib, inflate::decompress_to_vec_zlib};
use serde::{Deserialize, Serialize};

pub const MEDIA_TYPE_STATUSLIST_JWT: &str = "application/statuslist+jwt";
pub const MEDIA_TYPE_STATUSLIST_CWT: &str = "application/statuslist+cwt";

/// CWT claim key under which the status list is carried.
pub const CWT_STATUS_LIST_CLAIM: i64 = 65534;

#[derive(thiserror::Error, Debug)]
pub enum StatusError {
    #[error("index {index} out of range for status list of size {size}")]
    IndexOutOfRange { index: u64, size: u64 },
    #[error("status list capacity exhausted")]
    CapacityExhausted,
    #[error("unsupported bits-per-slot value {0}")]
    UnsupportedBits(u8),
    #[error("decompression failed")]
    Decompress,
    #[error("token parsing failed: {0}")]
    Parse(String),
    #[error("token signature invalid")]
    TokenSignatureInvalid,
    #[error("unexpected content type {0}")]
    UnexpectedContentType(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error(transparent)]
    Cbor(#[from] crate::utils::serialization::CborError),
    #[error(transparent)]
    Cose(#[from] crate::utils::cose::CoseError),
}

/// The status of a credential slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Valid,
    Invalid,
    Suspended,
    /// A value this implementation does not recognize.
    Unknown(u8),
}

impl From<u8> for CredentialStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => CredentialStatus::Valid,
            1 => CredentialStatus::Invalid,
            2 => CredentialStatus::Suspended,
            other => CredentialStatus::Unknown(other),
        }
    }
}

impl From<CredentialStatus> for u8 {
    fn from(status: CredentialStatus) -> u8 {
        match status {
            CredentialStatus::Valid => 0,
            CredentialStatus::Invalid => 1,
            CredentialStatus::Suspended => 2,
            CredentialStatus::Unknown(other) => other,
        }
    }
}

/// The `status_list` claim of the JWT envelope: `lst` is the base64url-no-pad encoding of
/// the compressed list.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonStatusListClaim {
    pub bits: u8,
    pub lst: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation_uri: Option<String>,
}

/// The status list claim of the CWT envelope (claim key 65534): `lst` is the raw
/// compressed bytes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CborStatusListClaim {
    pub bits: u8,
    pub lst: serde_bytes::ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation_uri: Option<String>,
}

/// A decompressed status list: `bits` per slot, packed little-endian within each byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusList {
    bits: u8,
    packed: Vec<u8>,
}

impl StatusList {
    /// Wrap packed slot data. Only 1, 2, 4 and 8 bits per slot are representable.
    pub fn from_packed(bits: u8, packed: Vec<u8>) -> Result<Self, StatusError> {
        if ![1, 2, 4, 8].contains(&bits) {
            return Err(StatusError::UnsupportedBits(bits));
        }
        Ok(StatusList { bits, packed })
    }

    /// Decompress a zlib-deflated packed list.
    pub fn from_compressed(bits: u8, compressed: &[u8]) -> Result<Self, StatusError> {
        let packed = decompress_to_vec_zlib(compressed).map_err(|_| StatusError::Decompress)?;
        Self::from_packed(bits, packed)
    }

    /// The zlib-deflated packed list.
    pub fn compress(&self) -> Vec<u8> {
        compress_to_vec_zlib(&self.packed, 6)
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Number of slots in the list.
    pub fn len(&self) -> u64 {
        (self.packed.len() as u64) * 8 / self.bits as u64
    }

    pub fn is_empty(&self) -> bool {
        self.packed.is_empty()
    }

    /// The raw status value at a slot.
    pub fn get(&self, index: u64) -> Result<u8, StatusError> {
        if index >= self.len() {
            return Err(StatusError::IndexOutOfRange {
                index,
                size: self.len(),
            });
        }
        let slots_per_byte = (8 / self.bits) as u64;
        let byte = self.packed[(index / slots_per_byte) as usize];
        let shift = ((index % slots_per_byte) as u8) * self.bits;
        let mask = if self.bits == 8 { 0xff } else { (1u8 << self.bits) - 1 };
        Ok((byte >> shift) & mask)
    }

    /// The status at a slot, mapped to the known values.
    pub fn status(&self, index: u64) -> Result<CredentialStatus, StatusError> {
        Ok(self.get(index)?.into())
    }
}
