//! The encrypted session between reader and device: ECDH key agreement over the
//! engagement ephemeral keys, derivation of the two directional session keys, and the
//! AES-256-GCM channel with its per-direction message counters.

use aes_gcm::{
    aead::{Aead, Nonce},
    Aes256Gcm, Key, KeyInit,
};
use p256::{PublicKey, SecretKey};
use serde::{de::DeserializeOwned, Serialize};
use serde_bytes::ByteBuf;

use crate::{
    iso::{
        disclosure::{SessionData, SessionStatus},
        engagement::SessionTranscript,
    },
    utils::crypto::{hkdf, sha256, CryptoError},
};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("message counter exhausted, key must not be reused")]
    CounterExhausted,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("message contains no data")]
    MissingData,
    #[error("session was terminated by the other party")]
    Terminated,
    #[error("peer signalled status {0:?}")]
    PeerStatus(SessionStatus),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Cbor(#[from] crate::utils::serialization::CborError),
}

/// Which side of the session this party is. Determines which directional key encrypts
/// outgoing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Reader,
    Device,
}

/// The two directional session keys, as derived by both parties from the ECDH shared
/// secret and the session transcript.
pub struct SessionKeys {
    sk_reader: [u8; 32],
    sk_device: [u8; 32],
}

impl SessionKeys {
    /// Derive the session keys: HKDF-SHA-256 over the ECDH shared secret, salted with the
    /// digest of the session transcript bytes, expanded with `"SKReader"` and
    /// `"SKDevice"`. Both parties arrive at the same two keys.
    pub fn derive(
        own_key: &SecretKey,
        peer_key: &PublicKey,
        session_transcript: &SessionTranscript,
    ) -> Result<Self, SessionError> {
        let shared_secret =
            p256::ecdh::diffie_hellman(own_key.to_nonzero_scalar(), peer_key.as_affine());
        let salt = sha256(&session_transcript.bytes()?);

        let sk_reader = hkdf(shared_secret.raw_secret_bytes(), &salt, "SKReader", 32)?;
        let sk_device = hkdf(shared_secret.raw_secret_bytes(), &salt, "SKDevice", 32)?;

        Ok(SessionKeys {
            sk_reader: sk_reader.try_into().expect("HKDF output length"),
            sk_device: sk_device.try_into().expect("HKDF output length"),
        })
    }
}

/// One direction of the channel: a key and a monotonically increasing message counter.
/// The counter starts at 1 and is never reused under the same key; when it would wrap,
/// the cipher refuses further operation.
struct DirectionalCipher {
    cipher: Aes256Gcm,
    counter: u64,
}

impl DirectionalCipher {
    fn new(key: &[u8; 32]) -> Self {
        DirectionalCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            counter: 1,
        }
    }

    /// The 12-byte nonce: 8 zero bytes followed by the big-endian 32-bit counter.
    fn nonce(&self) -> Result<Nonce<Aes256Gcm>, SessionError> {
        let counter: u32 = self.counter.try_into().map_err(|_| SessionError::CounterExhausted)?;
        let mut nonce = [0u8; 12];
        nonce[8..].copy_from_slice(&counter.to_be_bytes());
        Ok(*Nonce::<Aes256Gcm>::from_slice(&nonce))
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = self.nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SessionError::EncryptionFailed)?;
        self.counter += 1;
        Ok(ciphertext)
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = self.nonce()?;
        let plaintext = self
            .cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| SessionError::DecryptionFailed)?;
        self.counter += 1;
        Ok(plaintext)
    }
}

/// An established session. Single-writer: the caller serializes its use; `encrypt` and
/// `decrypt` are the only operations, and counter advancement is internal.
pub struct Session {
    role: SessionRole,
    sk_reader: DirectionalCipher,
    sk_device: DirectionalCipher,
    terminated: bool,
}

impl Session {
    pub fn new(role: SessionRole, keys: SessionKeys) -> Self {
        Session {
            role,
            sk_reader: DirectionalCipher::new(&keys.sk_reader),
            sk_device: DirectionalCipher::new(&keys.sk_device),
            terminated: false,
        }
    }

    /// Establish the session from this party's ephemeral private key, the peer's
    /// ephemeral public key and the agreed transcript.
    pub fn establish(
        role: SessionRole,
        own_key: &SecretKey,
        peer_key: &PublicKey,
        session_transcript: &SessionTranscript,
    ) -> Result<Self, SessionError> {
        Ok(Session::new(role, SessionKeys::derive(own_key, peer_key, session_transcript)?))
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    fn outgoing(&mut self) -> &mut DirectionalCipher {
        match self.role {
            SessionRole::Reader => &mut self.sk_reader,
            SessionRole::Device => &mut self.sk_device,
        }
    }

    fn incoming(&mut self) -> &mut DirectionalCipher {
        match self.role {
            SessionRole::Reader => &mut self.sk_device,
            SessionRole::Device => &mut self.sk_reader,
        }
    }

    /// Encrypt an outgoing message under this party's directional key.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SessionData, SessionError> {
        if self.terminated {
            return Err(SessionError::Terminated);
        }
        let ciphertext = self.outgoing().encrypt(plaintext)?;
        Ok(SessionData {
            data: Some(ByteBuf::from(ciphertext)),
            status: None,
        })
    }

    /// Decrypt an incoming message under the peer's directional key. A termination status
    /// tears the session down; decrypt failures and missing data surface as errors.
    pub fn decrypt(&mut self, message: &SessionData) -> Result<Vec<u8>, SessionError> {
        if self.terminated {
            return Err(SessionError::Terminated);
        }
        match message.status {
            Some(SessionStatus::Terminated) => {
                self.terminated = true;
                return Err(SessionError::Terminated);
            }
            Some(status) => return Err(SessionError::PeerStatus(status)),
            None => {}
        }
        let ciphertext = message.data.as_ref().ok_or(SessionError::MissingData)?;
        self.incoming().decrypt(ciphertext)
    }

    /// Serialize a message to CBOR and encrypt it.
    pub fn serialize_and_encrypt<T: Serialize>(&mut self, message: &T) -> Result<SessionData, SessionError> {
        let bytes = crate::utils::serialization::cbor_serialize(message)?;
        self.encrypt(&bytes)
    }

    /// Decrypt a message and deserialize it from CBOR.
    pub fn decrypt_and_deserialize<T: DeserializeOwned>(&mut self, message: &SessionData) -> Result<T, SessionError> {
        let bytes = self.decrypt(message)?;
        let deserialized = crate::utils::serialization::cbor_deserialize(&bytes)?;
        Ok(deserialized)
    }

    /// Tear the session down, producing the termination message for the peer. The keys
    /// are unusable afterwards.
    pub fn terminate(mut self) -> SessionData {
        self.terminated = true;
        SessionData::new_termination()
    }
}
